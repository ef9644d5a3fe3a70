//! Interned symbols
//!
//! Method names, constant names and field names are interned once per
//! context; after that, comparison is integer equality. This also makes
//! name guards in the dispatch caches trivially correct: equal names always
//! carry the same `SymbolId`, so identity and equality coincide.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// An interned symbol. Compare with `==`; the numeric value is stable for
/// the lifetime of the owning [`SymbolTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    /// The raw table index.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Interning table mapping names to [`SymbolId`]s.
pub struct SymbolTable {
    inner: RwLock<SymbolTableInner>,
}

#[derive(Default)]
struct SymbolTableInner {
    by_name: FxHashMap<String, SymbolId>,
    names: Vec<String>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SymbolTableInner::default()),
        }
    }

    /// Intern a name, returning its stable id.
    pub fn intern(&self, name: &str) -> SymbolId {
        // Fast path: already interned
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.by_name.get(name) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        // Double-check after acquiring the write lock
        if let Some(&id) = inner.by_name.get(name) {
            return id;
        }

        let id = SymbolId(inner.names.len() as u32);
        inner.names.push(name.to_string());
        inner.by_name.insert(name.to_string(), id);
        id
    }

    /// Reconstruct a symbol id from its raw index, if one was interned.
    pub fn from_index(&self, index: u32) -> Option<SymbolId> {
        ((index as usize) < self.len()).then_some(SymbolId(index))
    }

    /// The name a symbol was interned from.
    pub fn name(&self, id: SymbolId) -> String {
        self.inner.read().names[id.0 as usize].clone()
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Whether no symbol has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        let c = table.intern("bar");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.name(a), "foo");
        assert_eq!(table.name(c), "bar");
    }
}
