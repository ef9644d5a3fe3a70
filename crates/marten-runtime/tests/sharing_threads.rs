//! Multi-thread sharing protocol tests
//!
//! Registering a second runtime thread activates sharing and promotes the
//! root set before the registration returns, so a spawned thread can only
//! ever observe shared objects. The write barrier then keeps publication
//! through shared objects safe.

use std::thread;

use marten_object::graph;
use marten_runtime::{RuntimeContext, Value};

#[test]
fn test_single_threaded_runs_share_nothing() {
    let ctx = RuntimeContext::new();
    let object = ctx.allocate(ctx.core().object);
    ctx.set_global(ctx.intern("$o"), Value::Object(object));

    assert_eq!(ctx.threads().live_count(), 1);
    assert!(!ctx.sharing().is_sharing());
    assert!(!ctx.sharing().is_shared_object(&ctx, object));
}

#[test]
fn test_second_thread_activates_sharing_before_it_runs() {
    let ctx = RuntimeContext::new();
    let class = ctx.core().object;

    let root = ctx.allocate(class);
    let nested = ctx.allocate(class);
    ctx.write_field(root, ctx.intern("nested"), Value::Object(nested)).unwrap();

    let registration = ctx.register_thread(vec![root]);
    assert_eq!(ctx.threads().live_count(), 2);
    assert!(ctx.sharing().is_sharing());

    // Everything reachable from the new thread's roots was promoted
    // synchronously during registration
    assert!(ctx.sharing().is_shared_object(&ctx, root));
    assert!(ctx.sharing().is_shared_object(&ctx, nested));

    drop(registration);
    assert_eq!(ctx.threads().live_count(), 1);
    // Sharing never deactivates
    assert!(ctx.sharing().is_sharing());
}

#[test]
fn test_spawned_thread_reads_promoted_graph() {
    let ctx = RuntimeContext::new();
    let class = ctx.core().object;
    let name = ctx.intern("payload");

    let root = ctx.allocate(class);
    ctx.write_field(root, name, Value::Integer(99)).unwrap();

    let registration = ctx.register_thread(vec![root]);
    thread::scope(|scope| {
        scope.spawn(|| {
            assert!(ctx.sharing().is_shared_object(&ctx, root));
            assert_eq!(ctx.read_field(root, name).unwrap(), Value::Integer(99));
        });
    });
    drop(registration);
}

#[test]
fn test_store_into_shared_object_publishes_safely() {
    let ctx = RuntimeContext::new();
    let class = ctx.core().object;
    let slot = ctx.intern("slot");

    let mailbox = ctx.allocate(class);
    let registration = ctx.register_thread(vec![mailbox]);

    // Writer publishes a fresh local graph through the shared mailbox;
    // reader polls for it. The barrier promotes the payload before the
    // store, so the reader can never see an unshared object.
    thread::scope(|scope| {
        scope.spawn(|| {
            let payload = ctx.allocate(class);
            ctx.write_field(payload, ctx.intern("value"), Value::Integer(7)).unwrap();
            ctx.write_field(mailbox, slot, Value::Object(payload)).unwrap();
        });

        scope.spawn(|| {
            loop {
                if let Ok(Value::Object(payload)) = ctx.read_field(mailbox, slot) {
                    assert!(ctx.sharing().is_shared_object(&ctx, payload));
                    assert_eq!(
                        ctx.read_field(payload, ctx.intern("value")).unwrap(),
                        Value::Integer(7)
                    );
                    break;
                }
                thread::yield_now();
            }
        });
    });
    drop(registration);
}

#[test]
fn test_barrier_promotes_the_full_reachable_closure() {
    let ctx = RuntimeContext::new();
    let class = ctx.core().object;

    // Branched and cyclic: root fans out to two arms that rejoin at a
    // leaf, which points back at the root
    let root = ctx.allocate(class);
    let left = ctx.allocate(class);
    let right = ctx.allocate(class);
    let leaf = ctx.allocate(class);
    ctx.write_field(root, ctx.intern("left"), Value::Object(left)).unwrap();
    ctx.write_field(root, ctx.intern("right"), Value::Object(right)).unwrap();
    ctx.write_field(left, ctx.intern("leaf"), Value::Object(leaf)).unwrap();
    ctx.write_field(right, ctx.intern("leaf"), Value::Object(leaf)).unwrap();
    ctx.write_field(leaf, ctx.intern("back"), Value::Object(root)).unwrap();
    let outside = ctx.allocate(class);

    let registration = ctx.register_thread(Vec::new());
    ctx.sharing().write_barrier(&ctx, Value::Object(root));

    // Closure property: every object an independent reachability walk
    // finds behind the barriered value is shared
    let closure = graph::reachable_from(ctx.heap(), [root]);
    assert_eq!(closure.len(), 4);
    for handle in &closure {
        assert!(ctx.sharing().is_shared_object(&ctx, *handle));
    }
    assert!(!ctx.sharing().is_shared_object(&ctx, outside));
    drop(registration);
}

#[test]
fn test_concurrent_promotion_has_one_winner_per_object() {
    let ctx = RuntimeContext::new();
    let class = ctx.core().object;

    // A chain long enough that racing barriers overlap
    let head = ctx.allocate(class);
    let mut tail = head;
    for _ in 0..512 {
        let next = ctx.allocate(class);
        ctx.write_field(tail, ctx.intern("next"), Value::Object(next)).unwrap();
        tail = next;
    }

    let registration = ctx.register_thread(Vec::new());
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| ctx.sharing().write_barrier(&ctx, Value::Object(head)));
        }
    });
    drop(registration);

    let mut cursor = head;
    let next = ctx.intern("next");
    loop {
        assert!(ctx.sharing().is_shared_object(&ctx, cursor));
        match ctx.read_field(cursor, next).unwrap() {
            Value::Object(handle) => cursor = handle,
            _ => break,
        }
    }
}
