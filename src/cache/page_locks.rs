//! # Per-Page Reader/Writer Locks
//!
//! Every page has a logical `RwLock`: `load` takes it shared, a flush takes
//! it exclusive. Keeping a lock per page alive forever would grow without
//! bound, so lock entries are created on first acquisition and reference
//! counted; the last guard to drop removes the entry from the table again.
//!
//! ## Lock Sharding
//!
//! The table itself is sharded by a hash of the page key so that lock
//! acquisition for unrelated pages does not contend on one map mutex.
//!
//! ## Deadlock Avoidance
//!
//! A flush locks every page of a write-group before touching any of them.
//! [`PageLockTable::write_multi`] sorts the keys ascending by
//! `(file_id, page_index)` first, so any two flushes acquire overlapping
//! sets in the same order. Guards release in reverse acquisition order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::cache::entry::PageKey;
use crate::config::WRITE_GROUP_SIZE;

const LOCK_SHARD_COUNT: usize = 64;

struct PageLockEntry {
    lock: RwLock<()>,
    ref_count: AtomicU64,
}

impl PageLockEntry {
    fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            ref_count: AtomicU64::new(1),
        }
    }

    fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

struct LockShard {
    locks: Mutex<HashMap<PageKey, Arc<PageLockEntry>>>,
}

impl LockShard {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, key: PageKey) -> Arc<PageLockEntry> {
        let mut map = self.locks.lock();
        if let Some(entry) = map.get(&key) {
            entry.acquire();
            return Arc::clone(entry);
        }
        let entry = Arc::new(PageLockEntry::new());
        map.insert(key, Arc::clone(&entry));
        entry
    }

    fn try_cleanup(&self, key: PageKey, entry: &PageLockEntry) {
        if entry.release() {
            let mut map = self.locks.lock();
            // Re-check under the map lock: another thread may have acquired
            // the entry between our decrement and here.
            if entry.ref_count.load(Ordering::Acquire) == 0 {
                map.remove(&key);
            }
        }
    }
}

/// Shared read lock on one page, released on drop.
pub struct PageReadGuard {
    shard: *const LockShard,
    key: PageKey,
    entry: Arc<PageLockEntry>,
}

// SAFETY: the shard pointer targets a shard inside PageLockTable, which is
// held in an Arc that outlives every guard; the entry Arc keeps the lock
// itself alive.
unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        // SAFETY: this guard owns exactly one read acquisition made in
        // PageLockTable::read, forgotten there so it can be released here.
        unsafe { self.entry.lock.force_unlock_read() };
        // SAFETY: shard pointer valid for the lifetime of the table.
        unsafe { (*self.shard).try_cleanup(self.key, &self.entry) };
    }
}

/// Exclusive write lock on one page, released on drop.
pub struct PageWriteGuard {
    shard: *const LockShard,
    key: PageKey,
    entry: Arc<PageLockEntry>,
}

// SAFETY: same reasoning as PageReadGuard.
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        // SAFETY: this guard owns the write acquisition made in
        // PageLockTable::write, forgotten there so it can be released here.
        unsafe { self.entry.lock.force_unlock_write() };
        // SAFETY: shard pointer valid for the lifetime of the table.
        unsafe { (*self.shard).try_cleanup(self.key, &self.entry) };
    }
}

/// A set of write guards covering one write-group, released in reverse
/// acquisition order on drop.
pub struct PageLockSet {
    guards: SmallVec<[PageWriteGuard; WRITE_GROUP_SIZE as usize]>,
}

impl Drop for PageLockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Sharded table of per-page reader/writer locks.
pub struct PageLockTable {
    shards: Vec<LockShard>,
}

impl PageLockTable {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARD_COUNT).map(|_| LockShard::new()).collect(),
        }
    }

    fn shard(&self, key: &PageKey) -> &LockShard {
        let hash = (key.file_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.page_index as usize);
        &self.shards[hash % LOCK_SHARD_COUNT]
    }

    /// Acquires a shared lock on a page, blocking.
    pub fn read(&self, key: PageKey) -> PageReadGuard {
        let shard = self.shard(&key);
        let entry = shard.get_or_create(key);

        let guard = entry.lock.read();
        // The parking_lot guard cannot move into PageReadGuard, so the
        // acquisition is kept and released manually in Drop.
        std::mem::forget(guard);

        PageReadGuard {
            shard: shard as *const LockShard,
            key,
            entry,
        }
    }

    /// Acquires an exclusive lock on a page, blocking.
    pub fn write(&self, key: PageKey) -> PageWriteGuard {
        let shard = self.shard(&key);
        let entry = shard.get_or_create(key);

        let guard = entry.lock.write();
        std::mem::forget(guard);

        PageWriteGuard {
            shard: shard as *const LockShard,
            key,
            entry,
        }
    }

    /// Acquires exclusive locks on several pages in ascending key order.
    pub fn write_multi(&self, keys: &[PageKey]) -> PageLockSet {
        let mut sorted: SmallVec<[PageKey; WRITE_GROUP_SIZE as usize]> =
            SmallVec::from_slice(keys);
        sorted.sort_unstable();

        PageLockSet {
            guards: sorted.into_iter().map(|key| self.write(key)).collect(),
        }
    }

    /// Number of live lock entries, for leak checks.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.locks.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PageLockTable {
    fn default() -> Self {
        Self::new()
    }
}
