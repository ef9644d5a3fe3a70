//! Per-call-site method dispatch caches.
//!
//! A call site owns an ordered chain of cache entries, newest first. Each
//! entry pairs a guard (shape, identity, or immediate-kind match plus name
//! equality) with the assumptions its binding depends on and the resolved
//! action. Dispatch re-checks every entry's assumptions before its guard on
//! every execution; entries whose assumptions died are skipped and pruned
//! at the next insertion. A site that has seen too much receiver diversity
//! collapses permanently to the uncached resolver path.
//!
//! Races are benign by construction: the walk runs under a read lock,
//! structural changes under the write lock, and two threads racing to
//! insert equivalent entries just leave a duplicate that the guard
//! discipline tolerates.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use marten_object::{ObjectHandle, ShapeId, SymbolId, Value, ValueKind};

use crate::assumption::{Assumption, check_all};
use crate::context::RuntimeContext;
use crate::error::RuntimeResult;
use crate::module::Method;

/// Predicate deciding whether a cache entry applies to a receiver.
#[derive(Clone, Debug)]
pub enum Guard {
    /// Shape match for general heap receivers.
    Shape {
        /// Expected receiver shape
        shape: ShapeId,
        /// Expected method name
        name: SymbolId,
    },
    /// Identity match for singleton receivers; cheaper than reading and
    /// comparing the shape.
    Identity {
        /// The expected receiver itself
        object: ObjectHandle,
        /// Expected method name
        name: SymbolId,
    },
    /// Kind match for immediate (non-heap) receivers.
    Immediate {
        /// Expected value kind
        kind: ValueKind,
        /// Expected method name
        name: SymbolId,
    },
}

impl Guard {
    /// Choose the guard kind for a receiver: identity for singletons, shape
    /// for other heap objects, kind for immediates.
    fn for_receiver(ctx: &RuntimeContext, receiver: Value, name: SymbolId) -> Self {
        match receiver {
            Value::Object(handle) => match ctx.heap().get(handle) {
                Some(object) if object.is_singleton() => Self::Identity {
                    object: handle,
                    name,
                },
                Some(object) => Self::Shape {
                    shape: object.shape_id(),
                    name,
                },
                None => Self::Identity {
                    object: handle,
                    name,
                },
            },
            other => Self::Immediate {
                kind: other.kind(),
                name,
            },
        }
    }

    fn matches(&self, ctx: &RuntimeContext, receiver: Value, name: SymbolId) -> bool {
        match self {
            Self::Shape {
                shape,
                name: cached,
            } => {
                *cached == name
                    && receiver
                        .as_object()
                        .and_then(|handle| ctx.heap().get(handle))
                        .map(|object| object.shape_id() == *shape)
                        .unwrap_or(false)
            }
            Self::Identity {
                object,
                name: cached,
            } => *cached == name && receiver.as_object() == Some(*object),
            Self::Immediate { kind, name: cached } => {
                *cached == name
                    && *kind != ValueKind::Object
                    && receiver.kind() == *kind
            }
        }
    }
}

/// The resolved action of a cache entry.
#[derive(Clone)]
enum CacheAction {
    /// A method binding to invoke (or report `true` for respond checks).
    Method(Arc<Method>),
    /// A definitive miss, cached only by respond checks and guarded by the
    /// walked modules' assumptions so later definitions invalidate it.
    Missing,
}

/// One node in a call site's chain.
struct CacheEntry {
    guard: Guard,
    assumptions: SmallVec<[Arc<Assumption>; 2]>,
    action: CacheAction,
    /// Consecutive walks in which this entry's guard failed; persistently
    /// stale entries are replaced at the next insertion.
    stale_misses: AtomicU32,
}

enum CacheState {
    Chain(Vec<Arc<CacheEntry>>),
    /// Permanent: too much diversity or churn; always resolve uncached.
    Megamorphic,
}

enum Probe {
    Hit(CacheAction),
    Miss,
    Megamorphic,
}

/// The inline cache a call site owns.
///
/// Identity is the program location; the site is mutated only through its
/// own dispatches.
pub struct CallSite {
    cache: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Entries evicted because an assumption died; above the configured
    /// limit the whole chain collapses to megamorphic.
    evictions: AtomicU32,
}

impl CallSite {
    /// Create an empty call site.
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(CacheState::Chain(Vec::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU32::new(0),
        }
    }

    /// Dispatch `receiver.name(args)` through the cache. Resolver misses
    /// surface through the context's method-missing hook and are never
    /// cached on this path (method tables can grow).
    pub fn dispatch(
        &self,
        ctx: &RuntimeContext,
        receiver: Value,
        name: SymbolId,
        args: &[Value],
    ) -> RuntimeResult<Value> {
        match self.probe(ctx, receiver, name) {
            Probe::Hit(CacheAction::Method(method)) => method.call(ctx, receiver, args),
            Probe::Hit(CacheAction::Missing) => ctx.method_missing(receiver, name, args),
            Probe::Megamorphic => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let lookup = ctx.modules().lookup_method(ctx.class_of(receiver), name);
                match lookup.method {
                    Some(method) => method.call(ctx, receiver, args),
                    None => ctx.method_missing(receiver, name, args),
                }
            }
            Probe::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let lookup = ctx.modules().lookup_method(ctx.class_of(receiver), name);
                match lookup.method {
                    Some(method) => {
                        self.insert(
                            ctx,
                            receiver,
                            name,
                            lookup.assumptions,
                            CacheAction::Method(Arc::clone(&method)),
                        );
                        method.call(ctx, receiver, args)
                    }
                    None => ctx.method_missing(receiver, name, args),
                }
            }
        }
    }

    /// Whether the receiver responds to `name`. Same chain and guard
    /// discipline as [`dispatch`](Self::dispatch) with a boolean terminal
    /// action; definitive misses are cached here because the guarding
    /// assumptions invalidate the entry when a method is later defined.
    pub fn responds_to(&self, ctx: &RuntimeContext, receiver: Value, name: SymbolId) -> bool {
        match self.probe(ctx, receiver, name) {
            Probe::Hit(CacheAction::Method(_)) => true,
            Probe::Hit(CacheAction::Missing) => false,
            Probe::Megamorphic => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let lookup = ctx.modules().lookup_method(ctx.class_of(receiver), name);
                lookup.method.is_some()
            }
            Probe::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let lookup = ctx.modules().lookup_method(ctx.class_of(receiver), name);
                let action = match &lookup.method {
                    Some(method) => CacheAction::Method(Arc::clone(method)),
                    None => CacheAction::Missing,
                };
                let found = lookup.method.is_some();
                self.insert(ctx, receiver, name, lookup.assumptions, action);
                found
            }
        }
    }

    /// Walk the chain newest-first: skip entries with a dead assumption,
    /// take the first whose guard matches.
    fn probe(&self, ctx: &RuntimeContext, receiver: Value, name: SymbolId) -> Probe {
        let state = self.cache.read();
        let entries = match &*state {
            CacheState::Megamorphic => return Probe::Megamorphic,
            CacheState::Chain(entries) => entries,
        };

        for entry in entries {
            if !check_all(&entry.assumptions) {
                // Dead entry: fall through without consulting its guard;
                // physically unlinked at the next insertion.
                continue;
            }
            if entry.guard.matches(ctx, receiver, name) {
                entry.stale_misses.store(0, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Probe::Hit(entry.action.clone());
            }
            entry.stale_misses.fetch_add(1, Ordering::Relaxed);
        }
        Probe::Miss
    }

    fn insert(
        &self,
        ctx: &RuntimeContext,
        receiver: Value,
        name: SymbolId,
        assumptions: SmallVec<[Arc<Assumption>; 2]>,
        action: CacheAction,
    ) {
        let options = ctx.options();
        let mut state = self.cache.write();
        let CacheState::Chain(entries) = &mut *state else {
            return;
        };

        // Unlink dead and persistently stale entries.
        let mut invalid = 0u32;
        entries.retain(|entry| {
            if !check_all(&entry.assumptions) {
                invalid += 1;
                return false;
            }
            entry.stale_misses.load(Ordering::Relaxed) < options.entry_miss_limit
        });
        let evictions = self.evictions.fetch_add(invalid, Ordering::Relaxed) + invalid;

        if entries.len() >= options.dispatch_cache_limit
            || evictions >= options.eviction_limit
        {
            tracing::debug!(
                depth = entries.len(),
                evictions,
                "call site went megamorphic"
            );
            *state = CacheState::Megamorphic;
            return;
        }

        entries.insert(
            0,
            Arc::new(CacheEntry {
                guard: Guard::for_receiver(ctx, receiver, name),
                assumptions,
                action,
                stale_misses: AtomicU32::new(0),
            }),
        );
    }

    /// Current chain depth (0 when megamorphic).
    pub fn depth(&self) -> usize {
        match &*self.cache.read() {
            CacheState::Chain(entries) => entries.len(),
            CacheState::Megamorphic => 0,
        }
    }

    /// Whether the site has permanently collapsed to uncached resolution.
    pub fn is_megamorphic(&self) -> bool {
        matches!(&*self.cache.read(), CacheState::Megamorphic)
    }

    /// Cache hits recorded at this site.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses (resolver fallbacks) recorded at this site.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for CallSite {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Method;

    fn context_with_class(name: &str) -> (RuntimeContext, marten_object::ModuleId) {
        let ctx = RuntimeContext::new();
        let class = ctx.modules().define_module(name, None);
        (ctx, class)
    }

    fn define_const_method(ctx: &RuntimeContext, class: marten_object::ModuleId, name: &str, result: i64) {
        let sym = ctx.intern(name);
        ctx.modules()
            .get(class)
            .define_method(Method::new(sym, class, move |_, _, _| {
                Ok(Value::Integer(result))
            }));
    }

    #[test]
    fn test_monomorphic_hit_skips_resolver() {
        let (ctx, class) = context_with_class("Widget");
        define_const_method(&ctx, class, "bar", 1);
        let bar = ctx.intern("bar");
        let receiver = Value::Object(ctx.allocate(class));
        let site = CallSite::new();

        assert_eq!(site.dispatch(&ctx, receiver, bar, &[]).unwrap(), Value::Integer(1));
        let lookups = ctx.modules().uncached_lookup_count();

        // Stable shape: every further dispatch is a cache hit
        for _ in 0..5 {
            assert_eq!(site.dispatch(&ctx, receiver, bar, &[]).unwrap(), Value::Integer(1));
        }
        assert_eq!(ctx.modules().uncached_lookup_count(), lookups);
        assert_eq!(site.depth(), 1);
        assert_eq!(site.miss_count(), 1);
        assert_eq!(site.hit_count(), 5);
    }

    #[test]
    fn test_cache_evolution_scenario() {
        let (ctx, class) = context_with_class("Widget");
        define_const_method(&ctx, class, "bar", 1);
        let bar = ctx.intern("bar");
        let site = CallSite::new();

        // Shape S1: one field; shape S2: empty
        let s1_receiver = ctx.allocate(class);
        ctx.write_field(s1_receiver, ctx.intern("a"), Value::Integer(0)).unwrap();
        let s2_receiver = ctx.allocate(class);

        // First call, S1: resolver populates E1
        site.dispatch(&ctx, Value::Object(s1_receiver), bar, &[]).unwrap();
        assert_eq!(site.depth(), 1);
        assert_eq!(site.miss_count(), 1);

        // Second call, S1: E1 hits, no resolver
        let lookups = ctx.modules().uncached_lookup_count();
        site.dispatch(&ctx, Value::Object(s1_receiver), bar, &[]).unwrap();
        assert_eq!(ctx.modules().uncached_lookup_count(), lookups);

        // Third call, S2: E1 guard fails, E2 pushed to the head
        site.dispatch(&ctx, Value::Object(s2_receiver), bar, &[]).unwrap();
        assert_eq!(site.depth(), 2);
        assert_eq!(site.miss_count(), 2);

        // Class redefinition invalidates E1 and E2; next S1 call rejects
        // them and rebuilds as E3, chain [E3, E2-pruned]
        define_const_method(&ctx, class, "bar", 9);
        assert_eq!(
            site.dispatch(&ctx, Value::Object(s1_receiver), bar, &[]).unwrap(),
            Value::Integer(9)
        );
        assert_eq!(site.miss_count(), 3);
        // Both old entries carried the same dead assumption, so the prune
        // pass dropped them and only E3 remains
        assert_eq!(site.depth(), 1);
    }

    #[test]
    fn test_megamorphic_collapse_is_permanent() {
        let (ctx, class) = context_with_class("Widget");
        define_const_method(&ctx, class, "bar", 1);
        let bar = ctx.intern("bar");
        let site = CallSite::new();
        let limit = ctx.options().dispatch_cache_limit;

        // One distinct shape per receiver
        for i in 0..limit + 4 {
            let receiver = ctx.allocate(class);
            ctx.write_field(receiver, ctx.intern(&format!("f{i}")), Value::Nil).unwrap();
            site.dispatch(&ctx, Value::Object(receiver), bar, &[]).unwrap();
        }
        assert!(site.is_megamorphic());
        assert_eq!(site.depth(), 0);

        // Further diversity never grows the chain again, but dispatch
        // still resolves correctly
        let receiver = ctx.allocate(class);
        ctx.write_field(receiver, ctx.intern("fresh"), Value::Nil).unwrap();
        assert_eq!(site.dispatch(&ctx, Value::Object(receiver), bar, &[]).unwrap(), Value::Integer(1));
        assert!(site.is_megamorphic());
        assert_eq!(site.depth(), 0);
    }

    #[test]
    fn test_resolver_miss_is_never_cached() {
        let (ctx, class) = context_with_class("Widget");
        let nope = ctx.intern("nope");
        let receiver = Value::Object(ctx.allocate(class));
        let site = CallSite::new();

        for _ in 0..2 {
            let err = site.dispatch(&ctx, receiver, nope, &[]).unwrap_err();
            assert!(matches!(err, crate::error::RuntimeError::NoMethod { .. }));
        }
        // Both dispatches fell through to the resolver; nothing was cached
        assert_eq!(site.depth(), 0);
        assert_eq!(site.miss_count(), 2);
    }

    #[test]
    fn test_method_missing_hook_handles_dispatch() {
        let (ctx, class) = context_with_class("Widget");
        ctx.set_method_missing_hook(|_, _, _, _| Ok(Value::Integer(-1)));
        let nope = ctx.intern("nope");
        let site = CallSite::new();

        let result = site.dispatch(&ctx, Value::Object(ctx.allocate(class)), nope, &[]);
        assert_eq!(result.unwrap(), Value::Integer(-1));
    }

    #[test]
    fn test_responds_to_caches_misses_until_definition() {
        let (ctx, class) = context_with_class("Widget");
        let bar = ctx.intern("bar");
        let receiver = Value::Object(ctx.allocate(class));
        let site = CallSite::new();

        assert!(!site.responds_to(&ctx, receiver, bar));
        assert_eq!(site.depth(), 1);

        // The cached "false" is guarded by the walked method tables
        assert!(!site.responds_to(&ctx, receiver, bar));
        assert_eq!(site.miss_count(), 1);

        // Defining the method invalidates the cached miss on its very next
        // consultation
        define_const_method(&ctx, class, "bar", 1);
        assert!(site.responds_to(&ctx, receiver, bar));
    }

    #[test]
    fn test_singleton_receiver_uses_identity_guard() {
        let (ctx, class) = context_with_class("Config");
        define_const_method(&ctx, class, "get", 7);
        let get = ctx.intern("get");
        let singleton = ctx.allocate_singleton(class);
        let site = CallSite::new();

        site.dispatch(&ctx, Value::Object(singleton), get, &[]).unwrap();

        // Growing the singleton's shape does not break an identity guard
        ctx.write_field(singleton, ctx.intern("a"), Value::Nil).unwrap();
        let lookups = ctx.modules().uncached_lookup_count();
        site.dispatch(&ctx, Value::Object(singleton), get, &[]).unwrap();
        assert_eq!(ctx.modules().uncached_lookup_count(), lookups);
    }

    #[test]
    fn test_immediate_receiver_dispatch() {
        let ctx = RuntimeContext::new();
        let double = ctx.intern("double");
        let integer_class = ctx.core().integer_class;
        ctx.modules().get(integer_class).define_method(Method::new(
            double,
            integer_class,
            |_, receiver, _| match receiver {
                Value::Integer(i) => Ok(Value::Integer(i * 2)),
                _ => Ok(Value::Nil),
            },
        ));

        let site = CallSite::new();
        assert_eq!(site.dispatch(&ctx, Value::Integer(21), double, &[]).unwrap(), Value::Integer(42));
        assert_eq!(site.dispatch(&ctx, Value::Integer(4), double, &[]).unwrap(), Value::Integer(8));
        // One entry serves every integer receiver
        assert_eq!(site.depth(), 1);
        assert_eq!(site.miss_count(), 1);
    }

    #[test]
    fn test_invalidation_hits_every_dependent_site() {
        let (ctx, class) = context_with_class("Widget");
        define_const_method(&ctx, class, "bar", 1);
        let bar = ctx.intern("bar");
        let receiver = Value::Object(ctx.allocate(class));

        let sites: Vec<CallSite> = (0..4).map(|_| CallSite::new()).collect();
        for site in &sites {
            site.dispatch(&ctx, receiver, bar, &[]).unwrap();
        }

        define_const_method(&ctx, class, "bar", 2);
        for site in &sites {
            // Never a stale binding: every site re-resolves on its next
            // consultation
            assert_eq!(site.dispatch(&ctx, receiver, bar, &[]).unwrap(), Value::Integer(2));
            assert_eq!(site.miss_count(), 2);
        }
    }
}
