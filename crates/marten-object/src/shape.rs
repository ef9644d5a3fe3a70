//! Shapes: field-layout descriptors with a sharing bit.
//!
//! A shape describes what fields an object has, at which offsets, which
//! class owns it, and whether the object is visible to multiple threads
//! (the `shared` bit). Shapes are immutable and interned in a
//! [`ShapeRegistry`]; adding a field or promoting to the shared variant
//! produces (or reuses) a successor shape. Objects change shape by swapping
//! their shape id, never by mutating the shape.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::symbol::SymbolId;

/// Identifies the class or module owning objects of a shape. Ids are
/// allocated by the runtime's metadata store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// An interned shape id. The raw value is what the per-object atomic shape
/// slot stores, making promotion a single integer compare-and-swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeId(u32);

impl ShapeId {
    /// The raw value stored in an object's atomic shape slot.
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Reconstruct from a raw atomic load.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// An immutable field-layout descriptor.
pub struct Shape {
    id: ShapeId,
    class: ModuleId,
    /// The shape this one was transitioned from, if any.
    parent: Option<ShapeId>,
    /// The field added relative to the parent (None for roots and for
    /// shared-variant transitions).
    key: Option<SymbolId>,
    shared: bool,
    field_offsets: FxHashMap<SymbolId, usize>,
    fields_ordered: Vec<SymbolId>,
}

impl Shape {
    /// This shape's interned id.
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// The class owning objects of this shape.
    pub fn class(&self) -> ModuleId {
        self.class
    }

    /// The shape this one was transitioned from.
    pub fn parent(&self) -> Option<ShapeId> {
        self.parent
    }

    /// Whether objects of this shape are visible to multiple threads.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Offset of a field in the object's field vector.
    pub fn offset_of(&self, key: SymbolId) -> Option<usize> {
        self.field_offsets.get(&key).copied()
    }

    /// Number of fields in this layout.
    pub fn field_count(&self) -> usize {
        self.fields_ordered.len()
    }

    /// Field names in insertion order.
    pub fn fields(&self) -> &[SymbolId] {
        &self.fields_ordered
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("key", &self.key)
            .field("shared", &self.shared)
            .field("field_count", &self.field_count())
            .finish()
    }
}

/// Interning registry of shapes and their transition tables.
pub struct ShapeRegistry {
    inner: RwLock<ShapeRegistryInner>,
}

#[derive(Default)]
struct ShapeRegistryInner {
    shapes: Vec<Arc<Shape>>,
    /// Empty root shape per class.
    roots: FxHashMap<ModuleId, ShapeId>,
    /// Transition by added field, keyed by (base shape, field).
    add_transitions: FxHashMap<(ShapeId, SymbolId), ShapeId>,
    /// Transition to the shared variant of a shape.
    shared_transitions: FxHashMap<ShapeId, ShapeId>,
}

impl ShapeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ShapeRegistryInner::default()),
        }
    }

    /// The empty, unshared root shape for a class, interning it on first use.
    pub fn root_for(&self, class: ModuleId) -> ShapeId {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.roots.get(&class) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.roots.get(&class) {
            return id;
        }
        let id = intern(&mut inner, class, None, None, false, FxHashMap::default(), Vec::new());
        inner.roots.insert(class, id);
        id
    }

    /// Look up an interned shape.
    pub fn get(&self, id: ShapeId) -> Arc<Shape> {
        Arc::clone(&self.inner.read().shapes[id.0 as usize])
    }

    /// Whether the shape carries the shared bit.
    pub fn is_shared(&self, id: ShapeId) -> bool {
        self.inner.read().shapes[id.0 as usize].shared
    }

    /// The successor of `base` with `key` appended. Preserves the shared
    /// bit. Returns `base` unchanged if the field is already present.
    pub fn add_field(&self, base: ShapeId, key: SymbolId) -> ShapeId {
        {
            let inner = self.inner.read();
            if inner.shapes[base.0 as usize].field_offsets.contains_key(&key) {
                return base;
            }
            if let Some(&id) = inner.add_transitions.get(&(base, key)) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.add_transitions.get(&(base, key)) {
            return id;
        }

        let base_shape = Arc::clone(&inner.shapes[base.0 as usize]);
        let mut field_offsets = base_shape.field_offsets.clone();
        field_offsets.insert(key, base_shape.fields_ordered.len());
        let mut fields_ordered = base_shape.fields_ordered.clone();
        fields_ordered.push(key);

        let id = intern(
            &mut inner,
            base_shape.class,
            Some(base),
            Some(key),
            base_shape.shared,
            field_offsets,
            fields_ordered,
        );
        inner.add_transitions.insert((base, key), id);
        id
    }

    /// The shared variant of `base`: same class and layout, shared bit set.
    /// A shared shape is its own shared variant.
    pub fn shared_variant(&self, base: ShapeId) -> ShapeId {
        {
            let inner = self.inner.read();
            if inner.shapes[base.0 as usize].shared {
                return base;
            }
            if let Some(&id) = inner.shared_transitions.get(&base) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.shared_transitions.get(&base) {
            return id;
        }

        let base_shape = Arc::clone(&inner.shapes[base.0 as usize]);
        let id = intern(
            &mut inner,
            base_shape.class,
            Some(base),
            None,
            true,
            base_shape.field_offsets.clone(),
            base_shape.fields_ordered.clone(),
        );
        inner.shared_transitions.insert(base, id);
        id
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn intern(
    inner: &mut ShapeRegistryInner,
    class: ModuleId,
    parent: Option<ShapeId>,
    key: Option<SymbolId>,
    shared: bool,
    field_offsets: FxHashMap<SymbolId, usize>,
    fields_ordered: Vec<SymbolId>,
) -> ShapeId {
    let id = ShapeId(inner.shapes.len() as u32);
    inner.shapes.push(Arc::new(Shape {
        id,
        class,
        parent,
        key,
        shared,
        field_offsets,
        fields_ordered,
    }));
    id
}
