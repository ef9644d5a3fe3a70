//! Constant resolution with lazily-triggered, recursion-safe autoload.
//!
//! A constant reference site caches resolutions the same way a call site
//! caches method bindings: entries guarded by (scope identity, name) and
//! the constant-version assumptions of every scope and ancestor examined.
//! Missing-constant results are cached under the same assumptions, so any
//! definition or autoload state change in a searched scope invalidates the
//! cached "not here".
//!
//! Autoload is a state machine on the constant slot: pending slots trigger
//! the feature loader; a reentrant lookup from the loading thread sees the
//! constant as missing (never an error, never a deadlock); lookups from
//! other threads block on the per-path completion signal.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use marten_object::{ModuleId, SymbolId, Value};

use crate::assumption::{Assumption, check_all};
use crate::context::RuntimeContext;
use crate::error::RuntimeResult;
use crate::module::ConstantState;

/// A lexical scope for constant lookup: a module plus the enclosing scopes.
pub struct LexicalScope {
    module: ModuleId,
    parent: Option<Arc<LexicalScope>>,
}

impl LexicalScope {
    /// A top-level scope in `module`.
    pub fn root(module: ModuleId) -> Arc<Self> {
        Arc::new(Self {
            module,
            parent: None,
        })
    }

    /// A scope nested inside `parent`.
    pub fn nested(parent: &Arc<LexicalScope>, module: ModuleId) -> Arc<Self> {
        Arc::new(Self {
            module,
            parent: Some(Arc::clone(parent)),
        })
    }

    /// The module this scope opens.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Modules of this scope and its enclosing scopes, innermost first.
    fn lexical_chain(&self) -> Vec<ModuleId> {
        let mut chain = vec![self.module];
        let mut current = self.parent.as_deref();
        while let Some(scope) = current {
            chain.push(scope.module);
            current = scope.parent.as_deref();
        }
        chain
    }
}

/// Result of an authoritative constant search.
struct ConstantSearch {
    /// The declaring module and slot state, or `None` if nothing was found.
    found: Option<(ModuleId, ConstantState)>,
    /// Constant-version assumptions of every module examined.
    assumptions: SmallVec<[Arc<Assumption>; 2]>,
}

/// Authoritative search: the lexical chain (own constants only), then the
/// ancestors of the innermost scope's module. Slots being autoloaded by the
/// calling thread are treated as missing and skipped, which is what makes
/// recursive references during a load terminate.
fn search_constant(ctx: &RuntimeContext, scope: &LexicalScope, name: SymbolId) -> ConstantSearch {
    let current = std::thread::current().id();
    let mut assumptions = SmallVec::new();
    let mut seen: Vec<ModuleId> = Vec::new();

    let lexical = scope.lexical_chain();
    let ancestors = ctx.modules().get(scope.module()).ancestors();

    for id in lexical.into_iter().chain(ancestors) {
        if seen.contains(&id) {
            continue;
        }
        seen.push(id);

        let module = ctx.modules().get(id);
        assumptions.push(module.constants_assumption());

        match module.constant(name) {
            None => {}
            Some(ConstantState::AutoloadInProgress { owner, path }) => {
                if owner == current {
                    // Reentrant reference from the loading thread: pretend
                    // the constant does not exist for this lookup only.
                    tracing::debug!(
                        module = module.name(),
                        path = %path,
                        "constant treated as missing while autoloading"
                    );
                } else {
                    return ConstantSearch {
                        found: Some((id, ConstantState::AutoloadInProgress { owner, path })),
                        assumptions,
                    };
                }
            }
            Some(ConstantState::AutoloadPending { path }) => {
                if ctx.autoloads().is_loading_on_current_thread(&path) {
                    // This thread is already loading the same feature via
                    // another slot; consider the constant missing to avoid
                    // loading twice.
                    tracing::debug!(
                        module = module.name(),
                        path = %path,
                        "pending autoload treated as missing during its own load"
                    );
                } else {
                    return ConstantSearch {
                        found: Some((id, ConstantState::AutoloadPending { path })),
                        assumptions,
                    };
                }
            }
            Some(state @ ConstantState::Defined(_)) => {
                return ConstantSearch {
                    found: Some((id, state)),
                    assumptions,
                };
            }
        }
    }

    ConstantSearch {
        found: None,
        assumptions,
    }
}

#[derive(Clone)]
enum ConstOutcome {
    Defined(Value),
    Missing,
}

struct ConstantEntry {
    /// Identity of the lexical scope the entry was built for.
    scope: usize,
    name: SymbolId,
    assumptions: SmallVec<[Arc<Assumption>; 2]>,
    outcome: ConstOutcome,
}

enum ConstCacheState {
    Chain(Vec<Arc<ConstantEntry>>),
    Megamorphic,
}

enum Probe {
    Hit(ConstOutcome),
    Miss,
    Megamorphic,
}

fn scope_key(scope: &Arc<LexicalScope>) -> usize {
    Arc::as_ptr(scope) as usize
}

/// The inline cache a constant reference site owns.
pub struct ConstantSite {
    cache: RwLock<ConstCacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConstantSite {
    /// Create an empty constant site.
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(ConstCacheState::Chain(Vec::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve `name` in `scope`. Exhausted resolution surfaces through the
    /// context's const-missing hook.
    pub fn resolve(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
    ) -> RuntimeResult<Value> {
        match self.resolve_impl(ctx, scope, name)? {
            Some(value) => Ok(value),
            None => ctx.const_missing(scope.module(), name),
        }
    }

    /// Like [`resolve`](Self::resolve) but opting out of the const-missing
    /// hook: a missing constant yields `Ok(None)`.
    pub fn resolve_opt(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
    ) -> RuntimeResult<Option<Value>> {
        self.resolve_impl(ctx, scope, name)
    }

    fn resolve_impl(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
    ) -> RuntimeResult<Option<Value>> {
        match self.probe(scope, name) {
            Probe::Hit(ConstOutcome::Defined(value)) => Ok(Some(value)),
            Probe::Hit(ConstOutcome::Missing) => Ok(None),
            Probe::Megamorphic => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.resolve_slow(ctx, scope, name, false)
            }
            Probe::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.resolve_slow(ctx, scope, name, true)
            }
        }
    }

    /// Uncached resolution, driving autoload as needed.
    fn resolve_slow(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
        cacheable: bool,
    ) -> RuntimeResult<Option<Value>> {
        loop {
            let search = search_constant(ctx, scope, name);
            match search.found {
                Some((_, ConstantState::Defined(value))) => {
                    if cacheable {
                        self.insert(ctx, scope, name, search.assumptions, ConstOutcome::Defined(value));
                    }
                    return Ok(Some(value));
                }
                Some((declaring, ConstantState::AutoloadPending { path })) => {
                    // Drive the load ourselves; a lost race to claim the
                    // slot just re-resolves.
                    self.autoload(ctx, scope, name, declaring, path)?;
                    continue;
                }
                Some((_, ConstantState::AutoloadInProgress { path, .. })) => {
                    // Another thread is loading: block on its completion
                    // signal, then re-resolve and observe the final outcome.
                    ctx.autoloads().wait(&path);
                    continue;
                }
                None => {
                    if cacheable {
                        self.insert(ctx, scope, name, search.assumptions, ConstOutcome::Missing);
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Claim and run the autoload for `name` declared in `declaring`. A
    /// claim lost to a racing thread is a no-op; either way the caller
    /// re-resolves afterwards.
    fn autoload(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
        declaring: ModuleId,
        path: Arc<str>,
    ) -> RuntimeResult<()> {
        let module = ctx.modules().get(declaring);

        // Register the completion signal before the in-progress state is
        // visible: a racing resolver that observes the slot must find a
        // signal to block on, not a not-yet-registered path.
        if !ctx.autoloads().try_begin(Arc::clone(&path)) {
            // Another thread is already loading this path; wait it out and
            // let the caller re-resolve.
            ctx.autoloads().wait(&path);
            return Ok(());
        }

        // Mark in-progress before loading so recursive lookups see the
        // constant as being loaded.
        if !module.autoload_start(name) {
            ctx.autoloads().complete(&path);
            return Ok(());
        }
        tracing::debug!(module = module.name(), path = %path, "autoloading constant");

        let load_result = ctx.loader().load_feature(ctx, &path);

        // Re-search while still marked in progress (avoids recursing into
        // this same autoload). The load must have defined the constant in
        // the declaring module's ancestors for the promise to count.
        let resolved = search_constant(ctx, scope, name);
        let honored = match &resolved.found {
            Some((found_in, ConstantState::Defined(_))) => {
                let root = ctx.modules().root();
                *found_in == root || module.ancestors().contains(found_in)
            }
            _ => false,
        };
        if !honored {
            // The autoload promise was not honored: drop the stale slot so
            // the re-search below (and every later one) sees it gone.
            if module.undefine_constant_if_still_autoload(name) {
                tracing::debug!(
                    module = module.name(),
                    path = %path,
                    "autoload did not define constant; undefining"
                );
            }
        }

        module.autoload_finish(name);
        ctx.autoloads().complete(&path);

        match load_result {
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::debug!(path = %path, %error, "feature load failed");
                Err(error)
            }
        }
    }

    fn probe(&self, scope: &Arc<LexicalScope>, name: SymbolId) -> Probe {
        let key = scope_key(scope);
        let state = self.cache.read();
        let entries = match &*state {
            ConstCacheState::Megamorphic => return Probe::Megamorphic,
            ConstCacheState::Chain(entries) => entries,
        };

        for entry in entries {
            if !check_all(&entry.assumptions) {
                continue;
            }
            if entry.scope == key && entry.name == name {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Probe::Hit(entry.outcome.clone());
            }
        }
        Probe::Miss
    }

    fn insert(
        &self,
        ctx: &RuntimeContext,
        scope: &Arc<LexicalScope>,
        name: SymbolId,
        assumptions: SmallVec<[Arc<Assumption>; 2]>,
        outcome: ConstOutcome,
    ) {
        let mut state = self.cache.write();
        let ConstCacheState::Chain(entries) = &mut *state else {
            return;
        };

        entries.retain(|entry| check_all(&entry.assumptions));
        if entries.len() >= ctx.options().constant_cache_limit {
            tracing::debug!(depth = entries.len(), "constant site went megamorphic");
            *state = ConstCacheState::Megamorphic;
            return;
        }

        entries.insert(
            0,
            Arc::new(ConstantEntry {
                scope: scope_key(scope),
                name,
                assumptions,
                outcome,
            }),
        );
    }

    /// Current chain depth (0 when megamorphic).
    pub fn depth(&self) -> usize {
        match &*self.cache.read() {
            ConstCacheState::Chain(entries) => entries.len(),
            ConstCacheState::Megamorphic => 0,
        }
    }

    /// Whether the site has collapsed to uncached resolution.
    pub fn is_megamorphic(&self) -> bool {
        matches!(&*self.cache.read(), ConstCacheState::Megamorphic)
    }

    /// Cache hits recorded at this site.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses (authoritative searches) recorded at this site.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for ConstantSite {
    fn default() -> Self {
        Self::new()
    }
}
