//! Per-filename lock registry
//!
//! Uploads hold a filename's lock from the moment the temp file is created
//! until the rename (or abort) finishes, so two uploads of the same name
//! never share a temp file. Nothing else takes these locks.
//!
//! The map is split into shards to keep unrelated names off each other's
//! mutex. Entries are reference counted: the last [`FileLock`] to go away
//! removes its entry, so the registry only holds names someone is using.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const SHARDS: usize = 16;

type Entry = Arc<AsyncMutex<()>>;

pub struct LockRegistry {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
    hasher: RandomState,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, name: &str) -> &Mutex<HashMap<String, Entry>> {
        let idx = (self.hasher.hash_one(name) % SHARDS as u64) as usize;
        &self.shards[idx]
    }

    /// Get-or-create under the shard mutex; the clone is what keeps the
    /// entry alive while the caller waits for or holds the lock.
    fn entry(&self, name: &str) -> Entry {
        let mut map = self.shard(name).lock();
        if let Some(existing) = map.get(name) {
            return Arc::clone(existing);
        }
        let created: Entry = Arc::new(AsyncMutex::new(()));
        map.insert(name.to_string(), Arc::clone(&created));
        created
    }

    /// Drops the caller's clone under the shard mutex, then removes the
    /// entry if the map's copy is the only one left.
    fn release(&self, name: &str, entry: Entry) {
        let mut map = self.shard(name).lock();
        drop(entry);
        let unused = map.get(name).is_some_and(|e| Arc::strong_count(e) == 1);
        if unused {
            map.remove(name);
        }
    }

    /// Exclusive hold on `name`, waiting (FIFO) for any current holder.
    pub async fn acquire(&self, name: &str) -> FileLock<'_> {
        let (mut lock, entry) = FileLock::pending(self, name);
        lock.guard = Some(entry.lock_owned().await);
        lock
    }

    /// Hold on `name` only if nobody has it right now.
    pub fn try_acquire(&self, name: &str) -> Option<FileLock<'_>> {
        let (mut lock, entry) = FileLock::pending(self, name);
        lock.guard = Some(entry.try_lock_owned().ok()?);
        Some(lock)
    }

    /// Number of filenames currently tracked.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped hold on one filename; released on drop on every exit path.
pub struct FileLock<'a> {
    registry: &'a LockRegistry,
    name: String,
    entry: Option<Entry>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> FileLock<'a> {
    /// Registers interest in `name` before waiting, so a waiter that is
    /// cancelled still releases its entry. Returns the clone to wait on.
    fn pending(registry: &'a LockRegistry, name: &str) -> (Self, Entry) {
        let entry = registry.entry(name);
        let lock = Self {
            registry,
            name: name.to_string(),
            entry: Some(Arc::clone(&entry)),
            guard: None,
        };
        (lock, entry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // Guard first: it owns a clone of the entry too
        drop(self.guard.take());
        if let Some(entry) = self.entry.take() {
            self.registry.release(&self.name, entry);
        }
    }
}
