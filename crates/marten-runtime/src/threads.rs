//! Live-thread registry.
//!
//! Tracks runtime threads and the objects they root. Registration of the
//! second live thread is the sharing trigger: the context promotes the full
//! root set before `register_thread` returns, so a new thread can never
//! observe an unshared object reachable from a shared root.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use marten_object::ObjectHandle;

use crate::context::RuntimeContext;

struct ThreadRecord {
    id: u64,
    roots: Vec<ObjectHandle>,
}

/// Registry of live runtime threads and their roots.
pub struct ThreadRegistry {
    records: Mutex<Vec<ThreadRecord>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    /// Create a registry with the main thread pre-registered.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(vec![ThreadRecord {
                id: 0,
                roots: Vec::new(),
            }]),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a thread record. Returns its id and the new live count.
    pub(crate) fn add(&self, roots: Vec<ObjectHandle>) -> (u64, usize) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        records.push(ThreadRecord { id, roots });
        (id, records.len())
    }

    pub(crate) fn remove(&self, id: u64) {
        self.records.lock().retain(|record| record.id != id);
    }

    /// Number of live registered threads.
    pub fn live_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Objects rooted by any live thread (sharing roots).
    pub fn live_roots(&self) -> Vec<ObjectHandle> {
        self.records
            .lock()
            .iter()
            .flat_map(|record| record.roots.iter().copied())
            .collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a registered thread; deregisters on drop.
pub struct ThreadRegistration<'ctx> {
    ctx: &'ctx RuntimeContext,
    id: u64,
}

impl<'ctx> ThreadRegistration<'ctx> {
    pub(crate) fn new(ctx: &'ctx RuntimeContext, id: u64) -> Self {
        Self { ctx, id }
    }

    /// The registry id of the registered thread.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ThreadRegistration<'_> {
    fn drop(&mut self) {
        self.ctx.threads().remove(self.id);
    }
}
