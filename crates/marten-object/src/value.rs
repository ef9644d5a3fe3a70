//! Runtime values
//!
//! Immediates (`Nil`, booleans, numbers, symbols) are `Copy` and always safe
//! to hand to another thread; only `Object` values point into the heap and
//! participate in the sharing write barrier.

use crate::heap::ObjectHandle;
use crate::symbol::SymbolId;

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// The nil singleton
    Nil,
    /// The false singleton
    False,
    /// The true singleton
    True,
    /// A signed machine integer
    Integer(i64),
    /// A double-precision float
    Float(f64),
    /// An interned symbol
    Symbol(SymbolId),
    /// A heap object
    Object(ObjectHandle),
}

/// Discriminant of a [`Value`], used by immediate-receiver dispatch guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `Value::Nil`
    Nil,
    /// `Value::False`
    False,
    /// `Value::True`
    True,
    /// `Value::Integer`
    Integer,
    /// `Value::Float`
    Float,
    /// `Value::Symbol`
    Symbol,
    /// `Value::Object`
    Object,
}

impl Value {
    /// Create a boolean value.
    pub fn boolean(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    /// The kind discriminant of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Nil => ValueKind::Nil,
            Self::False => ValueKind::False,
            Self::True => ValueKind::True,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::Symbol(_) => ValueKind::Symbol,
            Self::Object(_) => ValueKind::Object,
        }
    }

    /// The object handle, if this value is a heap object.
    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Check truthiness (everything but `nil` and `false` is truthy).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::False)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind() {
        assert_eq!(Value::Nil.kind(), ValueKind::Nil);
        assert_eq!(Value::Integer(1).kind(), ValueKind::Integer);
        assert_eq!(Value::boolean(true), Value::True);
        assert_eq!(Value::boolean(false), Value::False);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::False.is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::True.is_truthy());
    }
}
