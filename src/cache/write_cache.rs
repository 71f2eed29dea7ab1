//! # Write-Ordered Dirty Page Cache
//!
//! Dirty pages live in an ordered map keyed by `(file_id, page_index)` and
//! are flushed in write-groups: runs of up to 16 consecutive page indices
//! written back together so the disk sees sequential I/O. The map ordering
//! makes group enumeration a range scan and gives flushes a deterministic
//! page order.
//!
//! ## WAL-Before-Data
//!
//! Every dirty entry carries the LSN of the log record describing its
//! latest mutation. Before a buffer is written to its file, the log is
//! flushed up to that LSN. This is the only cross-component ordering the
//! cache enforces; writes within one group may still reach the platter in
//! any order, which recovery tolerates because the log got there first.
//!
//! ## Flush Paths
//!
//! - **Explicit** (`flush_file`): every group of the file, in ascending
//!   order. A pinned page anywhere in a group aborts with
//!   [`BlockedPageError`] — the caller is mid-mutation and must release
//!   first.
//! - **Background**: a dedicated thread wakes on an interval and flushes
//!   groups whose oldest entry went dirty before `now − hysteresis`,
//!   skipping groups with pinned pages rather than failing.
//! - **Capacity**: when the map is at capacity, `mark_dirty` of a new page
//!   first force-flushes the coldest groups so the dirty set never exceeds
//!   the write cache's share of the page budget.
//!
//! Each group flush takes the per-page write locks (ascending) before
//! re-reading the map, so lock order against readers is page-lock first,
//! map mutex second, file registry last.
//!
//! ## Backpressure
//!
//! Above `write_queue_length` dirty pages, `mark_dirty` of a *new* page
//! blocks on a condvar until a flush drains the map; re-marking an
//! already-dirty page never blocks. If the background flusher dies (too
//! many consecutive failures) the health flag flips and blocked and future
//! `mark_dirty` calls fail fast instead of hanging on a flusher that will
//! never come.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use parking_lot::{Condvar, Mutex};

use crate::cache::directory::PageDirectory;
use crate::cache::entry::{CacheEntry, PageKey};
use crate::cache::errors::{BlockedPageError, CacheFullError, NotInCacheError};
use crate::cache::page_locks::PageLockTable;
use crate::cache::FileRegistry;
use crate::config::{CacheConfig, FLUSHER_FAILURE_LIMIT};
use crate::memory::{DirectMemory, PagePointer};
use crate::storage::{stamp_page_header, DirtyPage, WriteAheadLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Abort the whole flush with `BlockedPageError` on a pinned page.
    Abort,
    /// Leave groups containing pinned pages for a later pass.
    SkipPinned,
}

struct WowState {
    map: BTreeMap<PageKey, Arc<CacheEntry>>,
}

pub struct WriteCache {
    page_size: usize,
    capacity: usize,
    write_queue_length: usize,
    sync_on_flush: bool,
    flush_interval: Duration,
    flush_hysteresis: Duration,
    memory: Arc<DirectMemory>,
    files: Arc<FileRegistry>,
    locks: Arc<PageLockTable>,
    directory: Arc<PageDirectory>,
    wal: Option<Arc<dyn WriteAheadLog>>,
    epoch: Instant,
    inner: Mutex<WowState>,
    /// Signalled whenever entries leave the map; backpressured markers wait
    /// on it.
    drained: Condvar,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    flusher: Mutex<Option<JoinHandle<()>>>,
    stop_flag: AtomicBool,
    failures: AtomicU32,
    broken: AtomicBool,
}

impl WriteCache {
    pub fn new(
        config: &CacheConfig,
        memory: Arc<DirectMemory>,
        files: Arc<FileRegistry>,
        locks: Arc<PageLockTable>,
        directory: Arc<PageDirectory>,
        wal: Option<Arc<dyn WriteAheadLog>>,
    ) -> Self {
        Self {
            page_size: config.page_size,
            capacity: config.write_cache_size(),
            write_queue_length: config.write_queue_length,
            sync_on_flush: config.sync_on_page_flush,
            flush_interval: config.flush_interval,
            flush_hysteresis: config.flush_hysteresis,
            memory,
            files,
            locks,
            directory,
            wal,
            epoch: Instant::now(),
            inner: Mutex::new(WowState {
                map: BTreeMap::new(),
            }),
            drained: Condvar::new(),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            flusher: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            broken: AtomicBool::new(false),
        }
    }

    /// Marks a page dirty, creating its entry if the page is not cached.
    /// A created entry reads current page content from disk (zeros beyond
    /// the end of the file).
    ///
    /// For pages resident in the read cache, go through the coordinator so
    /// the existing descriptor is reused.
    pub fn mark_dirty(&self, file_id: u64, page_index: u64) -> Result<Arc<CacheEntry>> {
        self.mark_dirty_inner(PageKey::new(file_id, page_index), None)
    }

    /// Marks an already-cached entry dirty. `None` means the caller never
    /// loaded the page, which is a contract violation.
    pub fn mark_dirty_entry(&self, entry: Option<Arc<CacheEntry>>) -> Result<Arc<CacheEntry>> {
        let entry = entry.ok_or_else(NotInCacheError::unknown)?;
        self.mark_dirty_inner(entry.key(), Some(entry))
    }

    pub fn get(&self, file_id: u64, page_index: u64) -> Option<Arc<CacheEntry>> {
        self.inner
            .lock()
            .map
            .get(&PageKey::new(file_id, page_index))
            .cloned()
    }

    /// Discards a dirty page without persisting it. Pinned pages are left
    /// untouched; the page silently stays cached until released.
    pub fn remove(&self, file_id: u64, page_index: u64) {
        let key = PageKey::new(file_id, page_index);
        let mut inner = self.inner.lock();

        match inner.map.get(&key) {
            Some(entry) if entry.is_pinned() => return,
            Some(_) => {}
            None => return,
        }

        let entry = inner.map.remove(&key).expect("entry checked above");
        self.detach(&entry);
        drop(inner);
        self.drained.notify_all();
    }

    /// Flushes every write-group of a file in ascending page order.
    pub fn flush_file(&self, file_id: u64) -> Result<()> {
        self.flush_file_with_sync(file_id, self.sync_on_flush)
    }

    pub fn flush_file_with_sync(&self, file_id: u64, sync: bool) -> Result<()> {
        let groups = {
            let inner = self.inner.lock();
            Self::groups_of_file(&inner, file_id)
        };

        for keys in groups {
            self.flush_group(&keys, FlushMode::Abort, sync)?;
        }
        Ok(())
    }

    /// Drops every entry. Nothing is persisted; buffers shared with the
    /// read cache stay alive.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let map = std::mem::take(&mut inner.map);
        for entry in map.into_values() {
            self.detach(&entry);
        }
        drop(inner);
        self.drained.notify_all();
    }

    /// Reinstates pages the log knew dirty at its last checkpoint as
    /// bufferless entries. Content loads lazily on first access.
    pub fn fill_dirty_pages(&self, file_id: u64) {
        let Some(wal) = &self.wal else { return };

        let mut inner = self.inner.lock();
        for dirty in wal.checkpoint_dirty_pages() {
            if dirty.file_id != file_id {
                continue;
            }
            let key = PageKey::new(dirty.file_id, dirty.page_index);
            if inner.map.contains_key(&key) {
                continue;
            }

            let entry = Arc::new(CacheEntry::with_lsn(key, dirty.lsn));
            entry.set_in_write_cache(true);
            entry.set_recently_changed(true);
            entry.set_changed_at(self.now_millis());
            inner.map.insert(key, entry);
            self.directory.insert(key);
        }
    }

    /// Drops the bufferless entries `fill_dirty_pages` reinstated for a
    /// file, as truncation does.
    pub fn clear_dirty_pages(&self, file_id: u64) {
        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = Self::file_range(&inner, file_id)
            .filter(|(_, entry)| entry.is_ghost())
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let entry = inner.map.remove(&key).expect("key just enumerated");
            self.detach(&entry);
        }
    }

    /// Snapshot of all currently dirty pages, for a WAL checkpoint.
    pub fn log_dirty_pages_table(&self) -> Vec<DirtyPage> {
        self.inner
            .lock()
            .map
            .values()
            .filter(|entry| entry.recently_changed())
            .map(|entry| DirtyPage {
                file_id: entry.file_id(),
                page_index: entry.page_index(),
                lsn: entry.lsn(),
            })
            .collect()
    }

    /// Flushes (optionally) then evicts every entry of a file. The caller
    /// guarantees no outstanding pins.
    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<()> {
        if flush {
            self.flush_file(file_id)?;
        }

        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = Self::file_range(&inner, file_id)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            let entry = inner.map.remove(&key).expect("key just enumerated");
            debug_assert!(!entry.is_pinned(), "closing file with pinned page {}", key);
            self.detach(&entry);
        }
        drop(inner);
        self.drained.notify_all();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the background flusher has given up after repeated failures.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Background flusher
    // ------------------------------------------------------------------

    pub fn start_flush(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.flusher.lock();
        if handle.is_some() {
            return Ok(());
        }

        self.stop_flag.store(false, Ordering::Release);
        let cache = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("pagetide-flusher".into())
            .spawn(move || cache.flusher_loop())
            .wrap_err("failed to spawn background flusher thread")?;

        *handle = Some(thread);
        Ok(())
    }

    /// Cooperative shutdown: raises the stop flag, wakes the flusher, and
    /// waits for the current group to complete.
    pub fn stop_flush(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_all();
        self.drained.notify_all();

        if let Some(thread) = self.flusher.lock().take() {
            // The flusher itself can end up here when it drops the last
            // handle to the cache; joining the current thread would hang.
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                log::error!("background flusher thread panicked");
            }
        }
    }

    fn flusher_loop(&self) {
        let mut sleep_guard = self.sleep_lock.lock();

        while !self.stop_flag.load(Ordering::Acquire) {
            let _ = self
                .wake
                .wait_for(&mut sleep_guard, self.flush_interval);
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            match self.flush_cold_groups() {
                Ok(flushed) => {
                    self.failures.store(0, Ordering::Release);
                    if flushed > 0 {
                        log::debug!("background flusher wrote {} pages", flushed);
                    }
                }
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                    log::warn!(
                        "background flush failed ({} consecutive): {:#}",
                        failures,
                        err
                    );
                    if failures >= FLUSHER_FAILURE_LIMIT {
                        self.broken.store(true, Ordering::Release);
                        self.drained.notify_all();
                        log::error!(
                            "background flusher giving up after {} failures; \
                             the write cache no longer accepts dirty pages",
                            failures
                        );
                    }
                }
            }
        }
    }

    /// Flushes groups whose oldest entry went dirty before the hysteresis
    /// window; groups with pinned pages wait for the next tick.
    fn flush_cold_groups(&self) -> Result<usize> {
        let cutoff = self
            .now_millis()
            .saturating_sub(self.flush_hysteresis.as_millis() as u64);

        let groups = {
            let inner = self.inner.lock();
            Self::groups_older_than(&inner, cutoff)
        };

        let mut flushed = 0;
        for keys in groups {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            if self.flush_group(&keys, FlushMode::SkipPinned, self.sync_on_flush)? {
                flushed += keys.len();
            }
        }
        Ok(flushed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn mark_dirty_inner(
        &self,
        key: PageKey,
        existing: Option<Arc<CacheEntry>>,
    ) -> Result<Arc<CacheEntry>> {
        self.ensure_healthy()?;
        self.reserve_capacity(key)?;

        let mut inner = self.inner.lock();

        // Backpressure applies to new pages only; re-marking a page that is
        // already dirty adds nothing to the queue.
        while !inner.map.contains_key(&key) && inner.map.len() >= self.write_queue_length {
            self.ensure_healthy()?;
            self.drained.wait(&mut inner);
        }

        let entry = match inner.map.get(&key) {
            Some(present) => Arc::clone(present),
            None => match existing {
                Some(entry) => entry,
                None => self.read_entry(key)?,
            },
        };

        if !entry.in_write_cache() {
            entry.set_in_write_cache(true);
            inner.map.insert(key, Arc::clone(&entry));
        }
        entry.set_recently_changed(true);
        entry.set_changed_at(self.now_millis());

        if let Some(wal) = &self.wal {
            let lsn = wal.current_lsn();
            entry.set_lsn(lsn);
            wal.register_dirty(key.file_id, key.page_index, lsn);
        }

        self.directory.insert(key);
        Ok(entry)
    }

    /// Creates an entry for an uncached page, reading current content from
    /// disk. Pages beyond the end of the file come back zeroed.
    fn read_entry(&self, key: PageKey) -> Result<Arc<CacheEntry>> {
        let ptr = self.memory.allocate()?;

        let mut buf = vec![0u8; self.page_size];
        let files = self.files.read();
        let result = files
            .get(&key.file_id)
            .ok_or_else(|| eyre::eyre!("file {} is not open", key.file_id))
            .and_then(|file| file.read(key.page_index * self.page_size as u64, &mut buf));
        drop(files);

        if let Err(err) = result {
            self.memory.free(ptr);
            return Err(err);
        }
        self.memory.copy_in(ptr, &buf)?;

        let entry = Arc::new(CacheEntry::new(key));
        entry.set_data_pointer(ptr);
        Ok(entry)
    }

    /// Keeps the dirty set within the write cache's page share by force
    /// flushing the coldest groups before a new page is admitted.
    fn reserve_capacity(&self, key: PageKey) -> Result<()> {
        loop {
            let groups = {
                let inner = self.inner.lock();
                if inner.map.contains_key(&key) || inner.map.len() < self.capacity {
                    return Ok(());
                }
                Self::groups_by_age(&inner)
            };

            let mut flushed_any = false;
            for keys in groups {
                if self.flush_group(&keys, FlushMode::SkipPinned, self.sync_on_flush)? {
                    flushed_any = true;
                    let inner = self.inner.lock();
                    if inner.map.contains_key(&key) || inner.map.len() < self.capacity {
                        return Ok(());
                    }
                }
            }

            if !flushed_any {
                let resident = self.inner.lock().map.len();
                return Err(CacheFullError::new(resident).into());
            }
        }
    }

    /// Flushes one write-group under its page write locks. Returns `false`
    /// when the group was skipped because of a pinned page.
    fn flush_group(&self, keys: &[PageKey], mode: FlushMode, sync: bool) -> Result<bool> {
        if keys.is_empty() {
            return Ok(true);
        }

        // Page locks strictly before the map mutex; readers acquire in the
        // same order.
        let guards = self.locks.write_multi(keys);
        let mut inner = self.inner.lock();

        let entries: Vec<Arc<CacheEntry>> = keys
            .iter()
            .filter_map(|key| inner.map.get(key).cloned())
            .collect();

        if let Some(pinned) = entries.iter().find(|entry| entry.is_pinned()) {
            drop(inner);
            // Locks release in reverse acquisition order.
            drop(guards);
            return match mode {
                FlushMode::Abort => Err(BlockedPageError::new(pinned.key()).into()),
                FlushMode::SkipPinned => Ok(false),
            };
        }

        let files = self.files.read();
        for entry in &entries {
            let ptr = entry.data_pointer();
            if !ptr.is_null() {
                if let Some(wal) = &self.wal {
                    wal.flush_until(entry.lsn()).wrap_err_with(|| {
                        format!("failed to flush log ahead of page {}", entry.key())
                    })?;
                }

                let mut content = self.memory.copy_out(ptr)?;
                stamp_page_header(&mut content);

                let file = files
                    .get(&entry.file_id())
                    .ok_or_else(|| eyre::eyre!("file {} is not open", entry.file_id()))?;
                file.write(entry.page_index() * self.page_size as u64, &content)?;
            }

            inner.map.remove(&entry.key());
            self.detach(entry);
        }

        if sync {
            if let Some(file) = files.get(&keys[0].file_id) {
                file.synch()?;
            }
        }

        drop(files);
        drop(inner);
        drop(guards);
        self.drained.notify_all();
        Ok(true)
    }

    /// Clears membership, and frees the buffer unless the read cache still
    /// holds the descriptor.
    fn detach(&self, entry: &Arc<CacheEntry>) {
        entry.set_in_write_cache(false);
        entry.set_recently_changed(false);
        if !entry.in_read_cache() && !entry.is_pinned() {
            self.memory.free(entry.data_pointer());
            entry.set_data_pointer(PagePointer::NULL);
        }
        self.directory.remove_if_orphan(entry);
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.is_broken() {
            eyre::bail!("write cache flusher has failed; refusing new dirty pages");
        }
        Ok(())
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn file_range(
        inner: &WowState,
        file_id: u64,
    ) -> impl Iterator<Item = (&PageKey, &Arc<CacheEntry>)> {
        inner
            .map
            .range(PageKey::new(file_id, 0)..=PageKey::new(file_id, u64::MAX))
    }

    /// Write-groups of one file, each a run of keys sharing
    /// `page_index / WRITE_GROUP_SIZE`, in ascending order.
    fn groups_of_file(inner: &WowState, file_id: u64) -> Vec<Vec<PageKey>> {
        let mut groups: Vec<Vec<PageKey>> = Vec::new();
        let mut current = None;

        for (key, _) in Self::file_range(inner, file_id) {
            if current != Some(key.write_group()) {
                current = Some(key.write_group());
                groups.push(Vec::new());
            }
            groups.last_mut().expect("group pushed above").push(*key);
        }
        groups
    }

    /// All write-groups across all files whose oldest entry went dirty
    /// before `cutoff`, coldest first.
    fn groups_older_than(inner: &WowState, cutoff: u64) -> Vec<Vec<PageKey>> {
        let mut aged = Self::aged_groups(inner);
        aged.retain(|(oldest, _)| *oldest < cutoff);
        aged.into_iter().map(|(_, keys)| keys).collect()
    }

    /// All write-groups, coldest first.
    fn groups_by_age(inner: &WowState) -> Vec<Vec<PageKey>> {
        Self::aged_groups(inner)
            .into_iter()
            .map(|(_, keys)| keys)
            .collect()
    }

    fn aged_groups(inner: &WowState) -> Vec<(u64, Vec<PageKey>)> {
        let mut groups: Vec<(u64, Vec<PageKey>)> = Vec::new();
        let mut current: Option<(u64, u64)> = None;

        for (key, entry) in inner.map.iter() {
            let group_id = (key.file_id, key.write_group());
            if current != Some(group_id) {
                current = Some(group_id);
                groups.push((entry.changed_at(), Vec::new()));
            }
            let (oldest, keys) = groups.last_mut().expect("group pushed above");
            *oldest = (*oldest).min(entry.changed_at());
            keys.push(*key);
        }

        groups.sort_by_key(|(oldest, _)| *oldest);
        groups
    }
}

impl Drop for WriteCache {
    fn drop(&mut self) {
        self.stop_flush();
    }
}
