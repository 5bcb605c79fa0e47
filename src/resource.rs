//! Named shared locks
//!
//! Components that must not run a critical section concurrently with another
//! instance (e.g. two decoders sharing a codec library) acquire a lock by name
//! from a `ResourceManager` handed to them at construction. The registry
//! entry lives as long as at least one `SharedLock` for that name does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

struct Entry {
    lock: Arc<Mutex<()>>,
    /// Live `SharedLock` handles; only changed under the registry mutex
    handles: usize,
}

type Registry = Arc<Mutex<HashMap<String, Entry>>>;

#[derive(Clone, Default)]
pub struct ResourceManager {
    locks: Registry,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock registered under `name`, creating it if needed
    pub fn acquire_shared_lock(&self, name: &str) -> SharedLock {
        let mut locks = lock_registry(&self.locks);
        let entry = locks.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating shared lock '{}'", name);
            Entry {
                lock: Arc::new(Mutex::new(())),
                handles: 0,
            }
        });
        entry.handles += 1;

        SharedLock {
            name: name.to_string(),
            lock: Arc::clone(&entry.lock),
            registry: Arc::clone(&self.locks),
        }
    }

    /// Number of names currently registered
    pub fn active_locks(&self) -> usize {
        lock_registry(&self.locks).len()
    }
}

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<String, Entry>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a named lock; dropping the last handle unregisters the name
pub struct SharedLock {
    name: String,
    lock: Arc<Mutex<()>>,
    registry: Registry,
}

impl SharedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter the critical section
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        let mut locks = lock_registry(&self.registry);
        let Some(entry) = locks.get_mut(&self.name) else {
            return;
        };
        entry.handles = entry.handles.saturating_sub(1);
        if entry.handles == 0 {
            debug!("Releasing shared lock '{}'", self.name);
            locks.remove(&self.name);
        }
    }
}
