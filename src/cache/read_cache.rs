//! # 2Q Read Cache
//!
//! Clean-page residency is governed by the 2Q replacement algorithm, which
//! fixes LRU's worst database failure mode: a single sequential scan
//! evicting the whole cache. Pages prove themselves before they reach the
//! long-lived queue.
//!
//! ## The Three Queues
//!
//! ```text
//! miss ──> A1in (FIFO, max/4) ──evict──> A1out (ghost FIFO, max/2)
//!                                             │
//!                                   hit on ghost (re-reference)
//!                                             │
//!                                             v
//!                                        Am (LRU, max − max/4)
//! ```
//!
//! - **A1in** admits every miss. A scan's pages march through it once and
//!   fall off the end without touching Am.
//! - **A1out** keeps only identities (and LSNs) of pages recently evicted
//!   from A1in. A hit here is the signal that a page is re-referenced on a
//!   timescale worth caching, so the page is reloaded into Am.
//! - **Am** is a plain LRU of proven pages; hits refresh recency.
//!
//! A hit in A1in deliberately does not promote: promotion happens only
//! through the ghost queue, on access *after* eviction.
//!
//! ## Eviction Rules
//!
//! Pinned pages are never victims; the scan walks from the LRU end toward
//! MRU until it finds an unpinned entry, and reports memory pressure if
//! there is none. An A1in victim that is also in the write cache keeps its
//! buffer (the write cache still owes it to disk); otherwise the buffer is
//! freed when the page degrades to a ghost.
//!
//! ## Synchronization
//!
//! None here. The coordinator calls every method under its structural lock;
//! this type is plain data.

use std::sync::Arc;

use eyre::Result;

use crate::cache::directory::PageDirectory;
use crate::cache::entry::{CacheEntry, PageKey};
use crate::cache::errors::CacheFullError;
use crate::cache::lru::LruList;
use crate::config::{A1IN_SHARE, A1OUT_SHARE};
use crate::memory::{DirectMemory, PagePointer};
use crate::storage::PagedFile;

pub struct ReadCache {
    memory: Arc<DirectMemory>,
    directory: Arc<PageDirectory>,
    page_size: usize,
    k_in: usize,
    k_out: usize,
    k_m: usize,
    a1_in: LruList,
    a1_out: LruList,
    am: LruList,
}

impl ReadCache {
    /// `max_size` is this cache's operational page budget, i.e. the total
    /// budget minus the write cache's share.
    pub fn new(
        max_size: usize,
        page_size: usize,
        memory: Arc<DirectMemory>,
        directory: Arc<PageDirectory>,
    ) -> Self {
        let k_in = max_size / A1IN_SHARE;
        Self {
            memory,
            directory,
            page_size,
            k_in,
            k_out: max_size / A1OUT_SHARE,
            k_m: max_size - k_in,
            a1_in: LruList::new(),
            a1_out: LruList::new(),
            am: LruList::new(),
        }
    }

    /// Hit path. An Am hit refreshes recency; an A1in hit does not promote.
    pub fn get(&mut self, key: &PageKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.a1_in.get(key) {
            return Some(entry);
        }
        self.am.get_mru(key)
    }

    /// Lookup without touching recency, for release and invariant checks.
    pub fn peek(&self, key: &PageKey) -> Option<Arc<CacheEntry>> {
        self.a1_in.get(key).or_else(|| self.am.get(key))
    }

    /// Miss handler. `adopt` is the write cache's descriptor for the page
    /// when one exists; its buffer is reused so both caches keep referring
    /// to the same descriptor and the same memory.
    pub fn load(
        &mut self,
        key: PageKey,
        file: &PagedFile,
        adopt: Option<Arc<CacheEntry>>,
    ) -> Result<Arc<CacheEntry>> {
        debug_assert!(self.peek(&key).is_none(), "load on resident page {}", key);

        if let Some(ghost) = self.a1_out.remove(&key) {
            // Re-reference after A1in eviction: the page earned Am.
            let entry = adopt.unwrap_or(ghost);
            self.make_room_am()?;
            self.ensure_buffer(&entry, file)?;
            entry.set_in_read_cache(true);
            self.directory.insert(key);
            self.am.put_mru(Arc::clone(&entry));
            Ok(entry)
        } else {
            let entry = adopt.unwrap_or_else(|| Arc::new(CacheEntry::new(key)));
            self.make_room_a1_in()?;
            self.ensure_buffer(&entry, file)?;
            entry.set_in_read_cache(true);
            self.directory.insert(key);
            self.a1_in.put_mru(Arc::clone(&entry));
            Ok(entry)
        }
    }

    /// Removes every entry of one file from all three queues. The caller
    /// guarantees no outstanding pins on the file.
    pub fn close_file(&mut self, file_id: u64) {
        for key in self.a1_in.keys_of_file(file_id) {
            let entry = self.a1_in.remove(&key).expect("key just enumerated");
            self.drop_resident(&entry);
        }
        for key in self.am.keys_of_file(file_id) {
            let entry = self.am.remove(&key).expect("key just enumerated");
            self.drop_resident(&entry);
        }
        for key in self.a1_out.keys_of_file(file_id) {
            let entry = self.a1_out.remove(&key).expect("key just enumerated");
            self.drop_ghost(&entry);
        }
    }

    /// Drops everything. Buffers shared with the write cache stay alive.
    pub fn clear(&mut self) {
        for entry in self.a1_in.drain() {
            self.drop_resident(&entry);
        }
        for entry in self.am.drain() {
            self.drop_resident(&entry);
        }
        for entry in self.a1_out.drain() {
            self.drop_ghost(&entry);
        }
    }

    /// Resident pages (A1in + Am).
    pub fn size(&self) -> usize {
        self.a1_in.len() + self.am.len()
    }

    pub fn a1_in_len(&self) -> usize {
        self.a1_in.len()
    }

    pub fn a1_out_len(&self) -> usize {
        self.a1_out.len()
    }

    pub fn am_len(&self) -> usize {
        self.am.len()
    }

    pub fn a1_in_contains(&self, key: &PageKey) -> bool {
        self.a1_in.contains(key)
    }

    pub fn a1_out_contains(&self, key: &PageKey) -> bool {
        self.a1_out.contains(key)
    }

    pub fn am_contains(&self, key: &PageKey) -> bool {
        self.am.contains(key)
    }

    fn make_room_a1_in(&mut self) -> Result<()> {
        while self.a1_in.len() >= self.k_in {
            let victim = self
                .a1_in
                .remove_lru_unpinned()
                .ok_or_else(|| CacheFullError::new(self.size()))?;

            // Degrade to ghost: identity and LSN survive in A1out, the
            // buffer only survives if the write cache still owes it to
            // disk.
            victim.set_in_read_cache(false);
            if !victim.in_write_cache() {
                self.memory.free(victim.data_pointer());
                victim.set_data_pointer(PagePointer::NULL);
            }
            self.directory.remove_if_orphan(&victim);
            self.a1_out.put_mru(victim);

            while self.a1_out.len() > self.k_out {
                let dropped = self.a1_out.remove_lru().expect("a1out length checked");
                self.drop_ghost(&dropped);
            }
        }
        Ok(())
    }

    fn make_room_am(&mut self) -> Result<()> {
        while self.am.len() >= self.k_m {
            let victim = self
                .am
                .remove_lru_unpinned()
                .ok_or_else(|| CacheFullError::new(self.size()))?;
            self.drop_resident(&victim);
        }
        Ok(())
    }

    fn ensure_buffer(&self, entry: &Arc<CacheEntry>, file: &PagedFile) -> Result<()> {
        if !entry.is_ghost() {
            return Ok(());
        }

        let ptr = self.memory.allocate()?;
        let mut buf = vec![0u8; self.page_size];
        let pos = entry.page_index() * self.page_size as u64;
        if let Err(err) = file.read(pos, &mut buf) {
            self.memory.free(ptr);
            return Err(err);
        }
        self.memory.copy_in(ptr, &buf)?;
        entry.set_data_pointer(ptr);
        Ok(())
    }

    fn drop_resident(&self, entry: &Arc<CacheEntry>) {
        debug_assert!(!entry.is_pinned(), "evicting pinned page {}", entry.key());

        entry.set_in_read_cache(false);
        if !entry.in_write_cache() {
            self.memory.free(entry.data_pointer());
            entry.set_data_pointer(PagePointer::NULL);
        }
        self.directory.remove_if_orphan(entry);
    }

    fn drop_ghost(&self, entry: &Arc<CacheEntry>) {
        if !entry.in_write_cache() && !entry.data_pointer().is_null() {
            self.memory.free(entry.data_pointer());
            entry.set_data_pointer(PagePointer::NULL);
        }
        self.directory.remove_if_orphan(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 64;

    struct Fixture {
        cache: ReadCache,
        file: PagedFile,
        _dir: tempfile::TempDir,
    }

    fn fixture(max_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let memory = Arc::new(DirectMemory::new(PAGE_SIZE));
        let directory = Arc::new(PageDirectory::new());
        let mut file = PagedFile::new(dir.path().join("pages.pt"), false);
        file.create().unwrap();

        Fixture {
            cache: ReadCache::new(max_size, PAGE_SIZE, memory, directory),
            file,
            _dir: dir,
        }
    }

    fn load(fx: &mut Fixture, page_index: u64) -> Arc<CacheEntry> {
        fx.cache
            .load(PageKey::new(1, page_index), &fx.file, None)
            .unwrap()
    }

    #[test]
    fn miss_admits_into_a1_in() {
        let mut fx = fixture(16);

        let entry = load(&mut fx, 0);

        assert!(fx.cache.a1_in_contains(&PageKey::new(1, 0)));
        assert!(!entry.is_ghost());
        assert!(entry.in_read_cache());
    }

    #[test]
    fn a1_in_hit_does_not_promote() {
        let mut fx = fixture(16);
        load(&mut fx, 0);

        fx.cache.get(&PageKey::new(1, 0)).unwrap();

        assert!(fx.cache.a1_in_contains(&PageKey::new(1, 0)));
        assert_eq!(fx.cache.am_len(), 0);
    }

    #[test]
    fn a1_in_overflow_degrades_lru_to_ghost() {
        let mut fx = fixture(16); // k_in = 4

        for i in 0..5 {
            load(&mut fx, i);
        }

        assert_eq!(fx.cache.a1_in_len(), 4);
        assert!(fx.cache.a1_out_contains(&PageKey::new(1, 0)));
        let ghost = fx.cache.a1_out.get(&PageKey::new(1, 0)).unwrap();
        assert!(ghost.is_ghost());
        assert!(!ghost.in_read_cache());
    }

    #[test]
    fn ghost_hit_promotes_to_am() {
        let mut fx = fixture(16);
        for i in 0..5 {
            load(&mut fx, i);
        }
        assert!(fx.cache.a1_out_contains(&PageKey::new(1, 0)));

        let entry = load(&mut fx, 0);

        assert!(fx.cache.am_contains(&PageKey::new(1, 0)));
        assert!(!fx.cache.a1_out_contains(&PageKey::new(1, 0)));
        assert!(!entry.is_ghost());
    }

    #[test]
    fn queue_capacities_hold_under_load() {
        let mut fx = fixture(16); // k_in = 4, k_out = 8, k_m = 12

        for i in 0..64 {
            load(&mut fx, i);
        }
        // Second pass generates ghost hits.
        for i in 0..64 {
            if fx.cache.peek(&PageKey::new(1, i)).is_none() {
                load(&mut fx, i);
            }
        }

        assert!(fx.cache.a1_in_len() <= 4);
        assert!(fx.cache.a1_out_len() <= 8);
        assert!(fx.cache.am_len() <= 12);
    }

    #[test]
    fn pinned_pages_survive_eviction_pressure() {
        let mut fx = fixture(16);

        let pinned = load(&mut fx, 0);
        pinned.pin();

        for i in 1..12 {
            load(&mut fx, i);
        }

        assert!(fx.cache.peek(&PageKey::new(1, 0)).is_some());
        pinned.unpin();
    }

    #[test]
    fn all_pinned_a1_in_reports_memory_pressure() {
        let mut fx = fixture(16); // k_in = 4

        let mut pins = Vec::new();
        for i in 0..4 {
            let entry = load(&mut fx, i);
            entry.pin();
            pins.push(entry);
        }

        let err = fx
            .cache
            .load(PageKey::new(1, 99), &fx.file, None)
            .unwrap_err();
        assert!(err.downcast_ref::<CacheFullError>().is_some());

        for entry in pins {
            entry.unpin();
        }
    }

    #[test]
    fn eviction_keeps_buffer_of_write_cache_pages() {
        let mut fx = fixture(16);
        let memory = Arc::clone(&fx.cache.memory);

        let dirty = load(&mut fx, 0);
        dirty.set_in_write_cache(true);
        let ptr = dirty.data_pointer();

        for i in 1..6 {
            load(&mut fx, i);
        }

        assert!(fx.cache.a1_out_contains(&PageKey::new(1, 0)));
        assert_eq!(dirty.data_pointer(), ptr);
        assert_eq!(memory.read(ptr, 0, 1).unwrap().len(), 1);
        dirty.set_in_write_cache(false);
    }

    #[test]
    fn load_adopts_write_cache_descriptor() {
        let mut fx = fixture(16);
        let memory = Arc::clone(&fx.cache.memory);

        let dirty = Arc::new(CacheEntry::new(PageKey::new(1, 0)));
        let ptr = memory.allocate().unwrap();
        memory.write(ptr, 12, &[42, 43]).unwrap();
        dirty.set_data_pointer(ptr);
        dirty.set_in_write_cache(true);

        let loaded = fx
            .cache
            .load(PageKey::new(1, 0), &fx.file, Some(Arc::clone(&dirty)))
            .unwrap();

        assert!(Arc::ptr_eq(&loaded, &dirty));
        assert_eq!(loaded.data_pointer(), ptr);
        assert_eq!(memory.read(ptr, 12, 2).unwrap(), vec![42, 43]);
    }

    #[test]
    fn close_file_empties_every_queue() {
        let mut fx = fixture(16);
        for i in 0..8 {
            load(&mut fx, i);
        }

        fx.cache.close_file(1);

        assert_eq!(fx.cache.size(), 0);
        assert_eq!(fx.cache.a1_out_len(), 0);
        assert_eq!(fx.cache.memory.allocated(), 0);
    }

    #[test]
    fn clear_frees_buffers_not_owned_by_write_cache() {
        let mut fx = fixture(16);
        let memory = Arc::clone(&fx.cache.memory);

        let keep = load(&mut fx, 0);
        keep.set_in_write_cache(true);
        load(&mut fx, 1);

        fx.cache.clear();

        assert_eq!(fx.cache.size(), 0);
        assert_eq!(memory.allocated(), 1);
        assert!(!keep.is_ghost());
        keep.set_in_write_cache(false);
    }
}
