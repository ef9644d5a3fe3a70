//! Module/class metadata store.
//!
//! Modules own method tables, constant tables and the assumptions that
//! certify them. Every mutator invalidates the affected assumption while
//! holding the table lock, before the new state is published, so no thread
//! can observe stale cached behavior past the mutation; a fresh assumption
//! is minted for the new fact.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use marten_object::{ModuleId, ObjectHandle, SymbolId, Value};

use crate::assumption::Assumption;
use crate::context::RuntimeContext;
use crate::error::RuntimeResult;

/// A method body: native code invoked with the context, receiver and
/// arguments.
pub type MethodFn = dyn Fn(&RuntimeContext, Value, &[Value]) -> RuntimeResult<Value> + Send + Sync;

/// A resolved method binding.
pub struct Method {
    name: SymbolId,
    owner: ModuleId,
    body: Arc<MethodFn>,
}

impl Method {
    /// Create a method owned by `owner`.
    pub fn new(
        name: SymbolId,
        owner: ModuleId,
        body: impl Fn(&RuntimeContext, Value, &[Value]) -> RuntimeResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            owner,
            body: Arc::new(body),
        })
    }

    /// The method's name.
    pub fn name(&self) -> SymbolId {
        self.name
    }

    /// The module the method is defined in.
    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// Invoke the method body.
    pub fn call(&self, ctx: &RuntimeContext, receiver: Value, args: &[Value]) -> RuntimeResult<Value> {
        (self.body)(ctx, receiver, args)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

/// State of a constant slot in a module.
#[derive(Clone, Debug)]
pub enum ConstantState {
    /// Defined with a value
    Defined(Value),
    /// Deferred: resolving this constant triggers loading `path`
    AutoloadPending {
        /// The feature to load
        path: Arc<str>,
    },
    /// The load for `path` is running on `owner`. The owning thread sees
    /// the constant as missing (recursion safety); other threads block on
    /// the load's completion signal.
    AutoloadInProgress {
        /// The feature being loaded
        path: Arc<str>,
        /// The thread driving the load
        owner: ThreadId,
    },
}

/// Outcome of an authoritative method lookup: the binding (if any) plus the
/// assumptions of every module walked, so a cache entry built from this
/// lookup is invalidated by any mutation along the walk.
pub struct MethodLookup {
    /// The resolved binding, or `None` for a definitive miss.
    pub method: Option<Arc<Method>>,
    /// Method-table assumptions of every walked module.
    pub assumptions: SmallVec<[Arc<Assumption>; 2]>,
}

/// A class or module record.
pub struct Module {
    id: ModuleId,
    name: String,
    /// Linearized ancestor chain, self first.
    ancestors: RwLock<Vec<ModuleId>>,
    methods: RwLock<FxHashMap<SymbolId, Arc<Method>>>,
    methods_assumption: RwLock<Arc<Assumption>>,
    constants: RwLock<FxHashMap<SymbolId, ConstantState>>,
    constants_assumption: RwLock<Arc<Assumption>>,
}

impl Module {
    fn new(id: ModuleId, name: String, ancestors: Vec<ModuleId>) -> Self {
        let methods_assumption = Assumption::new(format!("methods of {name}"));
        let constants_assumption = Assumption::new(format!("constants of {name}"));
        Self {
            id,
            name,
            ancestors: RwLock::new(ancestors),
            methods: RwLock::new(FxHashMap::default()),
            methods_assumption: RwLock::new(methods_assumption),
            constants: RwLock::new(FxHashMap::default()),
            constants_assumption: RwLock::new(constants_assumption),
        }
    }

    /// This module's id.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// This module's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The linearized ancestor chain, self first.
    pub fn ancestors(&self) -> Vec<ModuleId> {
        self.ancestors.read().clone()
    }

    /// The current method-table assumption. Valid until the next method
    /// definition/removal or ancestor change on this module.
    pub fn methods_assumption(&self) -> Arc<Assumption> {
        Arc::clone(&self.methods_assumption.read())
    }

    /// The current constant-table assumption. Valid until the next constant
    /// definition/removal or autoload state change on this module.
    pub fn constants_assumption(&self) -> Arc<Assumption> {
        Arc::clone(&self.constants_assumption.read())
    }

    fn bump_methods_assumption(&self) {
        let mut slot = self.methods_assumption.write();
        slot.invalidate();
        *slot = Assumption::new(format!("methods of {}", self.name));
    }

    fn bump_constants_assumption(&self) {
        let mut slot = self.constants_assumption.write();
        slot.invalidate();
        *slot = Assumption::new(format!("constants of {}", self.name));
    }

    /// Define or redefine a method. Invalidates the method-table assumption
    /// before the new binding becomes visible.
    pub fn define_method(&self, method: Arc<Method>) {
        let mut methods = self.methods.write();
        self.bump_methods_assumption();
        methods.insert(method.name(), method);
    }

    /// Remove a method. Returns whether a binding was present.
    pub fn remove_method(&self, name: SymbolId) -> bool {
        let mut methods = self.methods.write();
        self.bump_methods_assumption();
        methods.remove(&name).is_some()
    }

    /// Look up a method defined directly on this module.
    pub fn lookup_own_method(&self, name: SymbolId) -> Option<Arc<Method>> {
        self.methods.read().get(&name).cloned()
    }

    /// The current state of a constant slot.
    pub fn constant(&self, name: SymbolId) -> Option<ConstantState> {
        self.constants.read().get(&name).cloned()
    }

    /// Define or redefine a constant.
    pub fn set_constant(&self, name: SymbolId, value: Value) {
        let mut constants = self.constants.write();
        self.bump_constants_assumption();
        constants.insert(name, ConstantState::Defined(value));
    }

    /// Register an autoload: resolving `name` will load `path`. Does not
    /// overwrite an already-defined constant.
    pub fn set_autoload(&self, name: SymbolId, path: impl Into<Arc<str>>) {
        let mut constants = self.constants.write();
        if matches!(constants.get(&name), Some(ConstantState::Defined(_))) {
            return;
        }
        self.bump_constants_assumption();
        constants.insert(name, ConstantState::AutoloadPending { path: path.into() });
    }

    /// Remove a constant, returning its value if it was defined.
    pub fn remove_constant(&self, name: SymbolId) -> Option<Value> {
        let mut constants = self.constants.write();
        self.bump_constants_assumption();
        match constants.remove(&name) {
            Some(ConstantState::Defined(value)) => Some(value),
            _ => None,
        }
    }

    /// Transition `name` from pending to in-progress, owned by the calling
    /// thread. Returns false if the slot is not pending (already loading,
    /// defined, or gone), in which case the caller re-resolves.
    pub fn autoload_start(&self, name: SymbolId) -> bool {
        let mut constants = self.constants.write();
        let Some(ConstantState::AutoloadPending { path }) = constants.get(&name).cloned() else {
            return false;
        };
        self.bump_constants_assumption();
        constants.insert(
            name,
            ConstantState::AutoloadInProgress {
                path,
                owner: std::thread::current().id(),
            },
        );
        true
    }

    /// End the in-progress marker for `name`, reverting to pending. A no-op
    /// unless the slot is in progress on the calling thread (the load may
    /// have defined or undefined the constant in the meantime).
    pub fn autoload_finish(&self, name: SymbolId) {
        let mut constants = self.constants.write();
        let current = std::thread::current().id();
        let Some(ConstantState::AutoloadInProgress { path, owner }) = constants.get(&name).cloned()
        else {
            return;
        };
        if owner != current {
            return;
        }
        self.bump_constants_assumption();
        constants.insert(name, ConstantState::AutoloadPending { path });
    }

    /// Remove `name` if it is still an unfulfilled autoload slot (the load
    /// ran but never defined the constant). Returns whether it was removed.
    pub fn undefine_constant_if_still_autoload(&self, name: SymbolId) -> bool {
        let mut constants = self.constants.write();
        match constants.get(&name) {
            Some(ConstantState::AutoloadPending { .. })
            | Some(ConstantState::AutoloadInProgress { .. }) => {
                self.bump_constants_assumption();
                constants.remove(&name);
                true
            }
            _ => false,
        }
    }

    /// Handles of all objects stored in defined constants (sharing roots).
    pub fn constant_object_roots(&self) -> Vec<ObjectHandle> {
        self.constants
            .read()
            .values()
            .filter_map(|state| match state {
                ConstantState::Defined(Value::Object(handle)) => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

/// The process-wide module table.
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<Module>>>,
    root: ModuleId,
    uncached_lookups: AtomicU64,
}

impl ModuleRegistry {
    /// Create a registry with the root module ("Object" analogue) defined.
    pub fn new() -> Self {
        let root = ModuleId(0);
        Self {
            modules: RwLock::new(vec![Arc::new(Module::new(root, "Object".to_string(), vec![root]))]),
            root,
            uncached_lookups: AtomicU64::new(0),
        }
    }

    /// The root module every ancestor chain ends in.
    pub fn root(&self) -> ModuleId {
        self.root
    }

    /// Define a new module. Its ancestor chain is itself followed by the
    /// superclass chain (the root module when none is given).
    pub fn define_module(&self, name: &str, superclass: Option<ModuleId>) -> ModuleId {
        let mut modules = self.modules.write();
        let id = ModuleId(modules.len() as u32);
        let super_id = superclass.unwrap_or(self.root);
        let mut ancestors = vec![id];
        ancestors.extend(modules[super_id.0 as usize].ancestors());
        modules.push(Arc::new(Module::new(id, name.to_string(), ancestors)));
        id
    }

    /// Look up a module record.
    pub fn get(&self, id: ModuleId) -> Arc<Module> {
        Arc::clone(&self.modules.read()[id.0 as usize])
    }

    /// Insert `includee`'s chain into `target`'s ancestors, after `target`
    /// itself. Invalidates `target`'s method-table assumption: cached
    /// bindings resolved through the old chain must be rebuilt.
    pub fn include_module(&self, target: ModuleId, includee: ModuleId) {
        let target_module = self.get(target);
        let included_chain = self.get(includee).ancestors();

        let mut ancestors = target_module.ancestors.write();
        target_module.bump_methods_assumption();
        let mut new_chain = vec![target];
        for id in included_chain.iter().chain(ancestors.iter()) {
            if !new_chain.contains(id) {
                new_chain.push(*id);
            }
        }
        *ancestors = new_chain;
    }

    /// Authoritative method resolution: walk the ancestor chain of `class`,
    /// collecting each walked module's method-table assumption. Used to
    /// populate call-site caches and as the megamorphic fallback.
    pub fn lookup_method(&self, class: ModuleId, name: SymbolId) -> MethodLookup {
        self.uncached_lookups.fetch_add(1, Ordering::Relaxed);

        let mut assumptions = SmallVec::new();
        for ancestor in self.get(class).ancestors() {
            let module = self.get(ancestor);
            assumptions.push(module.methods_assumption());
            if let Some(method) = module.lookup_own_method(name) {
                return MethodLookup {
                    method: Some(method),
                    assumptions,
                };
            }
        }
        MethodLookup {
            method: None,
            assumptions,
        }
    }

    /// Number of authoritative (uncached) method lookups performed.
    pub fn uncached_lookup_count(&self) -> u64 {
        self.uncached_lookups.load(Ordering::Relaxed)
    }

    /// Sharing roots: object values held in any module's constants.
    pub fn constant_roots(&self) -> Vec<ObjectHandle> {
        let modules: Vec<Arc<Module>> = self.modules.read().clone();
        modules
            .iter()
            .flat_map(|m| m.constant_object_roots())
            .collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
