//! Concurrent autoload tests
//!
//! Exactly one thread drives a given feature load; every other resolver of
//! the same constant blocks on the completion signal and observes the final
//! outcome. The loading thread itself sees the constant as missing, so
//! recursive references inside the loaded feature terminate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use marten_runtime::constant::{ConstantSite, LexicalScope};
use marten_runtime::{RuntimeContext, Value, loader_fn};

#[test]
fn test_concurrent_resolvers_load_once_and_all_observe_the_value() {
    let load_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&load_count);

    let loader = loader_fn(move |ctx: &RuntimeContext, path: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
        // Widen the window so other resolvers hit the in-progress slot
        thread::sleep(Duration::from_millis(20));
        assert_eq!(path, "lib/shared_config");
        let root = ctx.modules().root();
        ctx.modules()
            .get(root)
            .set_constant(ctx.intern("SharedConfig"), Value::Integer(11));
        Ok(true)
    });
    let ctx = RuntimeContext::with_loader(loader);

    let root = ctx.modules().root();
    let name = ctx.intern("SharedConfig");
    ctx.modules().get(root).set_autoload(name, "lib/shared_config");

    let registration = ctx.register_thread(Vec::new());
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let site = ConstantSite::new();
                let lexical = LexicalScope::root(ctx.modules().root());
                let value = site.resolve(&ctx, &lexical, name).unwrap();
                assert_eq!(value, Value::Integer(11));
            });
        }
    });
    drop(registration);

    assert_eq!(load_count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_waiters_survive_a_failed_load() {
    let loader = loader_fn(move |_: &RuntimeContext, _: &str| {
        thread::sleep(Duration::from_millis(20));
        Ok(true) // loads, but never defines the constant
    });
    let ctx = RuntimeContext::with_loader(loader);

    let root = ctx.modules().root();
    let name = ctx.intern("NeverDefined");
    ctx.modules().get(root).set_autoload(name, "lib/never");

    let registration = ctx.register_thread(Vec::new());
    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let site = ConstantSite::new();
                let lexical = LexicalScope::root(ctx.modules().root());
                // The unfulfilled autoload resolves to missing everywhere,
                // with no deadlock and no stuck waiter
                assert!(site.resolve_opt(&ctx, &lexical, name).unwrap().is_none());
            });
        }
    });
    drop(registration);

    assert!(ctx.modules().get(root).constant(name).is_none());
}
