//! Shared-object promotion: the software write barrier.
//!
//! Objects start thread-local. The first time a second thread becomes
//! reachable from the runtime's roots, sharing is switched on (one-shot)
//! and the whole root set is promoted to shared shapes. From then on, every
//! store into an already-shared object runs the barrier on the stored
//! value, promoting its reachable subgraph before the store is visible.
//!
//! Promotion is an explicit worklist, not recursion, so arbitrarily deep
//! and cyclic graphs are handled; the already-shared check doubles as the
//! visited set. The per-object shape swing is a compare-and-swap, so racing
//! promoters have exactly one winner and promotion is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use marten_object::{ObjectHandle, Value, graph};

use crate::context::RuntimeContext;

/// Process-wide sharing state and the promotion algorithm.
pub struct SharedObjects {
    /// One-shot: flipped true when a second thread becomes reachable,
    /// never flipped back.
    sharing: AtomicBool,
}

impl SharedObjects {
    /// Create with sharing off.
    pub fn new() -> Self {
        Self {
            sharing: AtomicBool::new(false),
        }
    }

    /// Whether multi-thread sharing has been activated.
    pub fn is_sharing(&self) -> bool {
        self.sharing.load(Ordering::Acquire)
    }

    /// Activate sharing and promote everything reachable from the root set
    /// (global variables, module constants, live-thread roots). Idempotent;
    /// only the first call walks the roots. Must complete before a second
    /// thread starts executing.
    pub fn start_sharing(&self, ctx: &RuntimeContext, reason: &str) {
        if !ctx.options().shared_objects {
            return;
        }
        if self
            .sharing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::info!(reason, "starting sharing");

        let mut roots = ctx.global_object_roots();
        roots.extend(ctx.modules().constant_roots());
        roots.extend(ctx.threads().live_roots());

        let start = Instant::now();
        let promoted = self.share_reachable(ctx, roots);
        tracing::debug!(promoted, elapsed = ?start.elapsed(), "shared roots");
    }

    /// Whether a value is safe to hand to another thread. Immediates always
    /// are; objects are once their shape carries the shared bit.
    pub fn is_shared(&self, ctx: &RuntimeContext, value: Value) -> bool {
        match value {
            Value::Object(handle) => self.is_shared_object(ctx, handle),
            _ => true,
        }
    }

    /// Shape-level shared check for a heap object.
    pub fn is_shared_object(&self, ctx: &RuntimeContext, handle: ObjectHandle) -> bool {
        if !ctx.options().shared_objects {
            return false;
        }
        ctx.heap()
            .get(handle)
            .map(|object| ctx.shapes().is_shared(object.shape_id()))
            .unwrap_or(false)
    }

    /// The write barrier: if sharing is active and `value` is an unshared
    /// object, promote it and everything reachable from it.
    pub fn write_barrier(&self, ctx: &RuntimeContext, value: Value) {
        if !ctx.options().shared_objects || !self.is_sharing() {
            return;
        }
        let Some(handle) = value.as_object() else {
            return;
        };
        if self.is_shared_object(ctx, handle) {
            return;
        }
        let promoted = self.share_reachable(ctx, vec![handle]);
        tracing::trace!(?handle, promoted, "write barrier promotion");
    }

    /// The hook every field store and collection insert runs before the
    /// store becomes visible: a value stored into a shared object must
    /// itself become shared.
    pub fn propagate(&self, ctx: &RuntimeContext, source: ObjectHandle, value: Value) {
        if self.is_shared_object(ctx, source) {
            self.write_barrier(ctx, value);
        }
    }

    /// Worklist promotion. Pops an object, skips it if already shared, else
    /// swings its shape to the shared variant and pushes its adjacent
    /// objects. Cycle safety comes from the already-shared check. A lost
    /// compare-and-swap (racing promotion or field-add transition) re-pushes
    /// the handle to retry against the fresh shape.
    fn share_reachable(&self, ctx: &RuntimeContext, mut worklist: Vec<ObjectHandle>) -> usize {
        let mut promoted = 0usize;

        while let Some(handle) = worklist.pop() {
            let Some(object) = ctx.heap().get(handle) else {
                continue;
            };
            let old_shape = object.shape_id();
            if ctx.shapes().is_shared(old_shape) {
                continue;
            }
            let new_shape = ctx.shapes().shared_variant(old_shape);
            if object.transition_shape(old_shape, new_shape) {
                promoted += 1;
                worklist.extend(graph::adjacent_objects(ctx.heap(), handle));
            } else {
                worklist.push(handle);
            }
        }

        promoted
    }
}

impl Default for SharedObjects {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use crate::loader::NullLoader;
    use std::sync::Arc;

    fn link(ctx: &RuntimeContext, from: ObjectHandle, field: &str, to: ObjectHandle) {
        ctx.write_field(from, ctx.intern(field), Value::Object(to))
            .unwrap();
    }

    #[test]
    fn test_immediates_are_always_shared() {
        let ctx = RuntimeContext::new();
        let sharing = ctx.sharing();
        assert!(sharing.is_shared(&ctx, Value::Nil));
        assert!(sharing.is_shared(&ctx, Value::Integer(5)));
        assert!(sharing.is_shared(&ctx, Value::Symbol(ctx.intern("s"))));
    }

    #[test]
    fn test_objects_start_unshared() {
        let ctx = RuntimeContext::new();
        let object = ctx.allocate(ctx.core().object);
        assert!(!ctx.sharing().is_shared_object(&ctx, object));
        assert!(!ctx.sharing().is_sharing());
    }

    #[test]
    fn test_start_sharing_promotes_the_root_set() {
        let ctx = RuntimeContext::new();
        let class = ctx.core().object;

        let global_root = ctx.allocate(class);
        let behind_global = ctx.allocate(class);
        link(&ctx, global_root, "child", behind_global);
        ctx.set_global(ctx.intern("$state"), Value::Object(global_root));

        let constant_root = ctx.allocate(class);
        ctx.modules()
            .get(ctx.modules().root())
            .set_constant(ctx.intern("ROOT"), Value::Object(constant_root));

        let unreferenced = ctx.allocate(class);

        ctx.sharing().start_sharing(&ctx, "test");
        assert!(ctx.sharing().is_sharing());
        assert!(ctx.sharing().is_shared_object(&ctx, global_root));
        assert!(ctx.sharing().is_shared_object(&ctx, behind_global));
        assert!(ctx.sharing().is_shared_object(&ctx, constant_root));
        // Promotion is reachability-based, not heap-wide
        assert!(!ctx.sharing().is_shared_object(&ctx, unreferenced));
    }

    #[test]
    fn test_write_barrier_promotes_transitively() {
        let ctx = RuntimeContext::new();
        let class = ctx.core().object;

        let shared = ctx.allocate(class);
        ctx.set_global(ctx.intern("$g"), Value::Object(shared));
        ctx.sharing().start_sharing(&ctx, "test");

        // A local graph, then published through a store into a shared object
        let head = ctx.allocate(class);
        let tail = ctx.allocate(class);
        link(&ctx, head, "next", tail);
        assert!(!ctx.sharing().is_shared_object(&ctx, head));

        link(&ctx, shared, "head", head);
        assert!(ctx.sharing().is_shared_object(&ctx, head));
        assert!(ctx.sharing().is_shared_object(&ctx, tail));
    }

    #[test]
    fn test_promotion_handles_cycles_and_preserves_fields() {
        let ctx = RuntimeContext::new();
        let class = ctx.core().object;

        let a = ctx.allocate(class);
        let b = ctx.allocate(class);
        link(&ctx, a, "peer", b);
        link(&ctx, b, "peer", a);
        ctx.write_field(a, ctx.intern("tag"), Value::Integer(1)).unwrap();
        ctx.set_global(ctx.intern("$a"), Value::Object(a));

        ctx.sharing().start_sharing(&ctx, "test");
        assert!(ctx.sharing().is_shared_object(&ctx, a));
        assert!(ctx.sharing().is_shared_object(&ctx, b));
        assert_eq!(ctx.read_field(a, ctx.intern("tag")).unwrap(), Value::Integer(1));
        assert_eq!(ctx.read_field(b, ctx.intern("peer")).unwrap(), Value::Object(a));
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let ctx = RuntimeContext::new();
        let object = ctx.allocate(ctx.core().object);
        ctx.set_global(ctx.intern("$o"), Value::Object(object));

        ctx.sharing().start_sharing(&ctx, "first");
        let shape_after_first = ctx.heap().get(object).unwrap().shape_id();

        ctx.sharing().start_sharing(&ctx, "second");
        ctx.sharing().write_barrier(&ctx, Value::Object(object));
        assert_eq!(ctx.heap().get(object).unwrap().shape_id(), shape_after_first);
    }

    #[test]
    fn test_disabled_sharing_is_inert() {
        let options = Options {
            shared_objects: false,
            ..Options::default()
        };
        let ctx = RuntimeContext::with_options(options, Arc::new(NullLoader));
        let object = ctx.allocate(ctx.core().object);
        ctx.set_global(ctx.intern("$o"), Value::Object(object));

        ctx.sharing().start_sharing(&ctx, "test");
        assert!(!ctx.sharing().is_sharing());
        assert!(!ctx.sharing().is_shared_object(&ctx, object));
    }
}
