//! Per-path autoload completion signals.
//!
//! While a feature load is running, other threads resolving the same
//! constant block here until the loader thread completes or fails. This is
//! the only blocking point in the resolution core. The owning thread never
//! blocks: reentrant lookups are detected through the constant state and
//! the owner recorded here, and treated as missing.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::ThreadId;

struct LoadSignal {
    owner: ThreadId,
    done: Mutex<bool>,
    cond: Condvar,
}

/// Tracks in-flight feature loads keyed by path.
pub struct AutoloadCoordinator {
    loads: DashMap<Arc<str>, Arc<LoadSignal>>,
}

impl AutoloadCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self {
            loads: DashMap::new(),
        }
    }

    /// Record that the calling thread starts loading `path`. Returns false
    /// if a load for `path` is already in flight; the existing signal is
    /// left untouched so its waiters stay attached to the real load. This
    /// runs before the in-progress constant state is published, so a
    /// resolver that observes the state always finds a signal to block on.
    pub fn try_begin(&self, path: Arc<str>) -> bool {
        match self.loads.entry(path) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(LoadSignal {
                    owner: std::thread::current().id(),
                    done: Mutex::new(false),
                    cond: Condvar::new(),
                }));
                true
            }
        }
    }

    /// Signal completion (success or failure) of the load for `path` and
    /// release every waiter.
    pub fn complete(&self, path: &str) {
        if let Some((_, signal)) = self.loads.remove(path) {
            let mut done = signal.done.lock();
            *done = true;
            signal.cond.notify_all();
        }
    }

    /// Block until the in-flight load for `path` completes. Returns
    /// immediately if no load is in flight.
    pub fn wait(&self, path: &str) {
        let Some(signal) = self.loads.get(path).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let mut done = signal.done.lock();
        while !*done {
            signal.cond.wait(&mut done);
        }
    }

    /// Whether the calling thread itself is loading `path` (reentrant
    /// reference through a different constant slot).
    pub fn is_loading_on_current_thread(&self, path: &str) -> bool {
        self.loads
            .get(path)
            .map(|entry| entry.value().owner == std::thread::current().id())
            .unwrap_or(false)
    }
}

impl Default for AutoloadCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
