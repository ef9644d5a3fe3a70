//! The object heap: an append-only arena indexed by handle.
//!
//! Each object stores its shape id in an atomic slot; shape transitions
//! (adding a field, promotion to shared) are compare-and-swap operations on
//! that slot, so two racing transitions have exactly one winner and never
//! produce a torn shape.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::shape::ShapeId;
use crate::value::Value;

/// A handle to a heap object. Stable for the lifetime of the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    /// The raw arena index.
    pub fn index(self) -> u32 {
        self.0
    }

    /// Reconstruct from a raw arena index. The handle is only meaningful
    /// against the heap it was allocated from.
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }
}

/// A heap-allocated object: an atomic shape id plus a field vector.
pub struct HeapObject {
    shape: AtomicU32,
    /// Singleton objects (classes, modules, other well-known one-off
    /// receivers) get identity-guarded cache entries instead of shape
    /// guards.
    singleton: bool,
    fields: RwLock<Vec<Value>>,
}

impl HeapObject {
    /// The object's current shape id.
    pub fn shape_id(&self) -> ShapeId {
        ShapeId::from_raw(self.shape.load(Ordering::Acquire))
    }

    /// Atomically swing the shape from `from` to `to`. Returns false if the
    /// current shape was not `from` (a racing transition won); the caller
    /// re-reads the shape and retries or gives up.
    pub fn transition_shape(&self, from: ShapeId, to: ShapeId) -> bool {
        self.shape
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether this object is a known singleton receiver.
    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    /// Read the field at `offset`, if initialized.
    pub fn field(&self, offset: usize) -> Option<Value> {
        self.fields.read().get(offset).copied()
    }

    /// Store a field at `offset`, growing the vector as needed. This is the
    /// raw store; callers run the sharing write barrier first.
    pub fn set_field_raw(&self, offset: usize, value: Value) {
        let mut fields = self.fields.write();
        if fields.len() <= offset {
            fields.resize(offset + 1, Value::Nil);
        }
        fields[offset] = value;
    }

    /// Snapshot of all field values.
    pub fn fields_snapshot(&self) -> Vec<Value> {
        self.fields.read().clone()
    }
}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapObject")
            .field("shape", &self.shape_id())
            .field("singleton", &self.singleton)
            .field("fields", &self.fields.read().len())
            .finish()
    }
}

/// Append-only object arena.
pub struct Heap {
    objects: RwLock<Vec<Arc<HeapObject>>>,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(Vec::new()),
        }
    }

    /// Allocate an object with the given initial shape.
    pub fn allocate(&self, shape: ShapeId) -> ObjectHandle {
        self.allocate_with(shape, false)
    }

    /// Allocate a singleton object (identity-guarded at call sites).
    pub fn allocate_singleton(&self, shape: ShapeId) -> ObjectHandle {
        self.allocate_with(shape, true)
    }

    fn allocate_with(&self, shape: ShapeId, singleton: bool) -> ObjectHandle {
        let object = Arc::new(HeapObject {
            shape: AtomicU32::new(shape.to_raw()),
            singleton,
            fields: RwLock::new(Vec::new()),
        });
        let mut objects = self.objects.write();
        let handle = ObjectHandle(objects.len() as u32);
        objects.push(object);
        handle
    }

    /// Look up an object by handle.
    pub fn get(&self, handle: ObjectHandle) -> Option<Arc<HeapObject>> {
        self.objects.read().get(handle.0 as usize).cloned()
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Visit every allocated object. Objects allocated while the walk runs
    /// are not visited.
    pub fn each_object(&self, mut f: impl FnMut(ObjectHandle, &Arc<HeapObject>)) {
        let snapshot: Vec<Arc<HeapObject>> = self.objects.read().clone();
        for (index, object) in snapshot.iter().enumerate() {
            f(ObjectHandle(index as u32), object);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
