//! Object graph walking.
//!
//! Enumerates the objects reachable from a root set. The sharing
//! controller's promotion walk fuses its own worklist with the
//! already-shared check; the full walk here serves diagnostics and the test
//! harness that verifies the sharing closure property.

use rustc_hash::FxHashSet;

use crate::heap::{Heap, ObjectHandle};
use crate::value::Value;

/// Handles directly reachable from an object's fields. Immediates are
/// skipped; duplicates are preserved (callers dedup via their own visited
/// discipline).
pub fn adjacent_objects(heap: &Heap, handle: ObjectHandle) -> Vec<ObjectHandle> {
    let Some(object) = heap.get(handle) else {
        return Vec::new();
    };
    object
        .fields_snapshot()
        .into_iter()
        .filter_map(|value| match value {
            Value::Object(h) => Some(h),
            _ => None,
        })
        .collect()
}

/// The full transitive closure of objects reachable from `roots`, roots
/// included. Iterative worklist; cycle-safe via the visited set.
pub fn reachable_from(
    heap: &Heap,
    roots: impl IntoIterator<Item = ObjectHandle>,
) -> FxHashSet<ObjectHandle> {
    let mut visited = FxHashSet::default();
    let mut worklist: Vec<ObjectHandle> = roots.into_iter().collect();

    while let Some(handle) = worklist.pop() {
        if !visited.insert(handle) {
            continue;
        }
        worklist.extend(adjacent_objects(heap, handle));
    }

    visited
}
