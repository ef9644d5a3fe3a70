//! The runtime context: owner of the heap, registries, sharing state and
//! host hooks.
//!
//! Everything is explicit state on the context; there is no ambient global.
//! Call sites and constant sites hold no context reference themselves, they
//! receive it per operation.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use marten_object::{Heap, ModuleId, ObjectHandle, ShapeRegistry, SymbolId, SymbolTable, Value};

use crate::autoload::AutoloadCoordinator;
use crate::error::{RuntimeError, RuntimeResult};
use crate::loader::{FeatureLoader, NullLoader};
use crate::module::ModuleRegistry;
use crate::shared::SharedObjects;
use crate::threads::{ThreadRegistration, ThreadRegistry};

/// Tunables for the resolution core.
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum call-site chain depth before megamorphic collapse.
    pub dispatch_cache_limit: usize,
    /// Maximum constant-site chain depth before megamorphic collapse.
    pub constant_cache_limit: usize,
    /// Consecutive guard failures before an entry is replaced.
    pub entry_miss_limit: u32,
    /// Assumption-driven evictions at one site before megamorphic collapse.
    pub eviction_limit: u32,
    /// Master switch for the sharing protocol.
    pub shared_objects: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dispatch_cache_limit: 8,
            constant_cache_limit: 8,
            entry_miss_limit: 64,
            eviction_limit: 32,
            shared_objects: true,
        }
    }
}

/// Classes backing immediate values.
#[derive(Clone, Copy, Debug)]
pub struct CoreClasses {
    /// The root class, ancestor of everything.
    pub object: ModuleId,
    /// Class of `nil`
    pub nil_class: ModuleId,
    /// Class of `true`
    pub true_class: ModuleId,
    /// Class of `false`
    pub false_class: ModuleId,
    /// Class of integers
    pub integer_class: ModuleId,
    /// Class of floats
    pub float_class: ModuleId,
    /// Class of symbols
    pub symbol_class: ModuleId,
}

/// Host hook invoked when method resolution finds no binding.
pub type MethodMissingHook =
    dyn Fn(&RuntimeContext, Value, SymbolId, &[Value]) -> RuntimeResult<Value> + Send + Sync;

/// Host hook invoked when constant resolution is exhausted.
pub type ConstMissingHook =
    dyn Fn(&RuntimeContext, ModuleId, SymbolId) -> RuntimeResult<Value> + Send + Sync;

/// The runtime context.
pub struct RuntimeContext {
    heap: Heap,
    shapes: ShapeRegistry,
    symbols: SymbolTable,
    modules: ModuleRegistry,
    globals: RwLock<FxHashMap<SymbolId, Value>>,
    threads: ThreadRegistry,
    sharing: SharedObjects,
    autoloads: AutoloadCoordinator,
    loader: Arc<dyn FeatureLoader>,
    options: Options,
    core: CoreClasses,
    method_missing: RwLock<Arc<MethodMissingHook>>,
    const_missing: RwLock<Arc<ConstMissingHook>>,
}

impl RuntimeContext {
    /// Create a context with default options and no feature loader.
    pub fn new() -> Self {
        Self::with_loader(Arc::new(NullLoader))
    }

    /// Create a context with default options and the given loader.
    pub fn with_loader(loader: Arc<dyn FeatureLoader>) -> Self {
        Self::with_options(Options::default(), loader)
    }

    /// Create a fully configured context.
    pub fn with_options(options: Options, loader: Arc<dyn FeatureLoader>) -> Self {
        let modules = ModuleRegistry::new();
        let core = CoreClasses {
            object: modules.root(),
            nil_class: modules.define_module("NilClass", None),
            true_class: modules.define_module("TrueClass", None),
            false_class: modules.define_module("FalseClass", None),
            integer_class: modules.define_module("Integer", None),
            float_class: modules.define_module("Float", None),
            symbol_class: modules.define_module("Symbol", None),
        };

        Self {
            heap: Heap::new(),
            shapes: ShapeRegistry::new(),
            symbols: SymbolTable::new(),
            modules,
            globals: RwLock::new(FxHashMap::default()),
            threads: ThreadRegistry::new(),
            sharing: SharedObjects::new(),
            autoloads: AutoloadCoordinator::new(),
            loader,
            options,
            core,
            method_missing: RwLock::new(Arc::new(default_method_missing)),
            const_missing: RwLock::new(Arc::new(default_const_missing)),
        }
    }

    /// The object heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The shape registry.
    pub fn shapes(&self) -> &ShapeRegistry {
        &self.shapes
    }

    /// The symbol table.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The module metadata store.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// The live-thread registry.
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// The sharing controller.
    pub fn sharing(&self) -> &SharedObjects {
        &self.sharing
    }

    /// The autoload completion signals.
    pub fn autoloads(&self) -> &AutoloadCoordinator {
        &self.autoloads
    }

    /// The feature loader.
    pub fn loader(&self) -> &Arc<dyn FeatureLoader> {
        &self.loader
    }

    /// The configured tunables.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Classes backing immediate values.
    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    /// Intern a name.
    pub fn intern(&self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// The class of a value.
    pub fn class_of(&self, value: Value) -> ModuleId {
        match value {
            Value::Object(handle) => self
                .heap
                .get(handle)
                .map(|object| self.shapes.get(object.shape_id()).class())
                .unwrap_or(self.core.object),
            Value::Nil => self.core.nil_class,
            Value::True => self.core.true_class,
            Value::False => self.core.false_class,
            Value::Integer(_) => self.core.integer_class,
            Value::Float(_) => self.core.float_class,
            Value::Symbol(_) => self.core.symbol_class,
        }
    }

    /// Allocate an instance of `class` with the empty shape.
    pub fn allocate(&self, class: ModuleId) -> ObjectHandle {
        self.heap.allocate(self.shapes.root_for(class))
    }

    /// Allocate a singleton instance (identity-guarded at call sites).
    pub fn allocate_singleton(&self, class: ModuleId) -> ObjectHandle {
        self.heap.allocate_singleton(self.shapes.root_for(class))
    }

    /// Read a named field; absent fields read as nil.
    pub fn read_field(&self, handle: ObjectHandle, name: SymbolId) -> RuntimeResult<Value> {
        let object = self
            .heap
            .get(handle)
            .ok_or_else(|| RuntimeError::internal("dangling object handle"))?;
        let shape = self.shapes.get(object.shape_id());
        Ok(shape
            .offset_of(name)
            .and_then(|offset| object.field(offset))
            .unwrap_or(Value::Nil))
    }

    /// Store a named field, growing the shape if the field is new. Runs the
    /// sharing barrier before the store becomes visible.
    pub fn write_field(
        &self,
        handle: ObjectHandle,
        name: SymbolId,
        value: Value,
    ) -> RuntimeResult<()> {
        let object = self
            .heap
            .get(handle)
            .ok_or_else(|| RuntimeError::internal("dangling object handle"))?;

        self.sharing.propagate(self, handle, value);

        loop {
            let shape = object.shape_id();
            if let Some(offset) = self.shapes.get(shape).offset_of(name) {
                object.set_field_raw(offset, value);
                return Ok(());
            }
            let grown = self.shapes.add_field(shape, name);
            if object.transition_shape(shape, grown) {
                let offset = self
                    .shapes
                    .get(grown)
                    .offset_of(name)
                    .ok_or_else(|| RuntimeError::internal("field vanished after transition"))?;
                object.set_field_raw(offset, value);
                return Ok(());
            }
            // Lost a racing transition (field add or promotion); retry
            // against the fresh shape.
        }
    }

    /// Set a global variable. Globals are sharing roots, so the value is
    /// write-barriered when sharing is active.
    pub fn set_global(&self, name: SymbolId, value: Value) {
        self.sharing.write_barrier(self, value);
        self.globals.write().insert(name, value);
    }

    /// Read a global variable.
    pub fn global(&self, name: SymbolId) -> Option<Value> {
        self.globals.read().get(&name).copied()
    }

    /// Sharing roots: object values held in globals.
    pub fn global_object_roots(&self) -> Vec<ObjectHandle> {
        self.globals
            .read()
            .values()
            .filter_map(Value::as_object)
            .collect()
    }

    /// Register an additional runtime thread rooted at `roots`. The second
    /// live thread activates sharing, and the root promotion walk completes
    /// before this returns, so the caller can only start the thread once
    /// everything it can reach is shared.
    pub fn register_thread(&self, roots: Vec<ObjectHandle>) -> ThreadRegistration<'_> {
        let (id, live) = self.threads.add(roots.clone());
        if live >= 2 {
            self.sharing.start_sharing(self, "new thread");
        }
        if self.sharing.is_sharing() {
            for root in roots {
                self.sharing.write_barrier(self, Value::Object(root));
            }
        }
        ThreadRegistration::new(self, id)
    }

    /// Replace the method-missing hook.
    pub fn set_method_missing_hook(
        &self,
        hook: impl Fn(&RuntimeContext, Value, SymbolId, &[Value]) -> RuntimeResult<Value>
        + Send
        + Sync
        + 'static,
    ) {
        *self.method_missing.write() = Arc::new(hook);
    }

    /// Replace the const-missing hook.
    pub fn set_const_missing_hook(
        &self,
        hook: impl Fn(&RuntimeContext, ModuleId, SymbolId) -> RuntimeResult<Value>
        + Send
        + Sync
        + 'static,
    ) {
        *self.const_missing.write() = Arc::new(hook);
    }

    /// Invoke the method-missing hook.
    pub fn method_missing(
        &self,
        receiver: Value,
        name: SymbolId,
        args: &[Value],
    ) -> RuntimeResult<Value> {
        let hook = Arc::clone(&self.method_missing.read());
        hook(self, receiver, name, args)
    }

    /// Invoke the const-missing hook.
    pub fn const_missing(&self, scope: ModuleId, name: SymbolId) -> RuntimeResult<Value> {
        let hook = Arc::clone(&self.const_missing.read());
        hook(self, scope, name)
    }

    /// Human-readable description of a value, for diagnostics and errors.
    pub fn describe(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Symbol(symbol) => format!(":{}", self.symbols.name(symbol)),
            Value::Object(handle) => {
                let class = self.class_of(Value::Object(handle));
                format!("#<{}>", self.modules.get(class).name())
            }
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_of_immediates() {
        let ctx = RuntimeContext::new();
        assert_eq!(ctx.class_of(Value::Nil), ctx.core().nil_class);
        assert_eq!(ctx.class_of(Value::True), ctx.core().true_class);
        assert_eq!(ctx.class_of(Value::Integer(1)), ctx.core().integer_class);
        assert_eq!(ctx.class_of(Value::Float(1.0)), ctx.core().float_class);
        assert_eq!(ctx.class_of(Value::Symbol(ctx.intern("s"))), ctx.core().symbol_class);
    }

    #[test]
    fn test_field_roundtrip_and_nil_default() {
        let ctx = RuntimeContext::new();
        let object = ctx.allocate(ctx.core().object);
        let name = ctx.intern("width");

        assert_eq!(ctx.read_field(object, name).unwrap(), Value::Nil);
        ctx.write_field(object, name, Value::Integer(12)).unwrap();
        assert_eq!(ctx.read_field(object, name).unwrap(), Value::Integer(12));

        // Overwrite without a shape transition
        ctx.write_field(object, name, Value::Integer(13)).unwrap();
        assert_eq!(ctx.read_field(object, name).unwrap(), Value::Integer(13));
    }

    #[test]
    fn test_globals() {
        let ctx = RuntimeContext::new();
        let name = ctx.intern("$flag");
        assert!(ctx.global(name).is_none());
        ctx.set_global(name, Value::True);
        assert_eq!(ctx.global(name), Some(Value::True));
    }

    #[test]
    fn test_describe() {
        let ctx = RuntimeContext::new();
        let class = ctx.modules().define_module("Widget", None);
        assert_eq!(ctx.describe(Value::Nil), "nil");
        assert_eq!(ctx.describe(Value::Integer(-4)), "-4");
        assert_eq!(ctx.describe(Value::Symbol(ctx.intern("name"))), ":name");
        assert_eq!(ctx.describe(Value::Object(ctx.allocate(class))), "#<Widget>");
    }
}

fn default_method_missing(
    ctx: &RuntimeContext,
    receiver: Value,
    name: SymbolId,
    _args: &[Value],
) -> RuntimeResult<Value> {
    Err(RuntimeError::no_method(
        ctx.describe(receiver),
        ctx.symbols().name(name),
    ))
}

fn default_const_missing(
    ctx: &RuntimeContext,
    scope: ModuleId,
    name: SymbolId,
) -> RuntimeResult<Value> {
    Err(RuntimeError::name_error(
        ctx.modules().get(scope).name(),
        ctx.symbols().name(name),
    ))
}
