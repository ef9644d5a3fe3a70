//! Object-space diagnostics: heap enumeration and id round-trips.
//!
//! Consumers of the core, not part of the dispatch/sharing machinery.
//! Object ids use the classic immediate encoding (false 0, true 2, nil 4,
//! odd ids for integers) with heap handles and symbols packed into the
//! remaining even space. Floats get no stable id here.

use marten_object::{ModuleId, ObjectHandle, Value};

use crate::context::RuntimeContext;
use crate::error::{RuntimeError, RuntimeResult};

const FALSE_ID: i64 = 0;
const TRUE_ID: i64 = 2;
const NIL_ID: i64 = 4;

/// A stable identity for a value.
pub fn object_id(value: Value) -> RuntimeResult<i64> {
    match value {
        Value::False => Ok(FALSE_ID),
        Value::True => Ok(TRUE_ID),
        Value::Nil => Ok(NIL_ID),
        Value::Integer(i) => i
            .checked_mul(2)
            .and_then(|doubled| doubled.checked_add(1))
            .ok_or_else(|| RuntimeError::range("integer too large for an id")),
        Value::Symbol(symbol) => Ok(i64::from(symbol.index()) * 8 + 6),
        Value::Object(handle) => Ok((i64::from(handle.index()) + 1) * 8),
        Value::Float(_) => Err(RuntimeError::range("float values have no stable id")),
    }
}

/// Invert [`object_id`]. Out-of-range or unmapped ids are a user-visible
/// range error.
pub fn id_to_ref(ctx: &RuntimeContext, id: i64) -> RuntimeResult<Value> {
    match id {
        FALSE_ID => return Ok(Value::False),
        TRUE_ID => return Ok(Value::True),
        NIL_ID => return Ok(Value::Nil),
        _ => {}
    }

    if id % 2 != 0 {
        return Ok(Value::Integer((id - 1) / 2));
    }

    if id > 0 && id % 8 == 6 {
        let index = (id - 6) / 8;
        // Symbol ids are dense, so the reverse mapping is a bounds check
        if let Some(symbol) = ctx.symbols().from_index(index as u32) {
            return Ok(Value::Symbol(symbol));
        }
    }

    if id > 0 && id % 8 == 0 {
        let index = (id / 8) - 1;
        if (index as usize) < ctx.heap().object_count() {
            return Ok(Value::Object(ObjectHandle::from_index(index as u32)));
        }
    }

    Err(RuntimeError::range(format!("{id} is not an id value")))
}

/// Visit every live heap object, optionally restricted to instances of
/// `class` or one of its subclasses. Returns the number visited.
pub fn each_object(
    ctx: &RuntimeContext,
    class: Option<ModuleId>,
    mut f: impl FnMut(ObjectHandle),
) -> usize {
    let mut count = 0;
    ctx.heap().each_object(|handle, object| {
        if let Some(wanted) = class {
            let actual = ctx.shapes().get(object.shape_id()).class();
            if !ctx.modules().get(actual).ancestors().contains(&wanted) {
                return;
            }
        }
        count += 1;
        f(handle);
    });
    count
}
