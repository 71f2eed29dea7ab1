//! Resident-page directory.
//!
//! Tracks, per open file, every page index currently resident in either
//! cache — clean or dirty. The coordinator consults it when truncating or
//! closing a file; both caches report membership changes here. A page is
//! dropped from the directory only once its descriptor has left both
//! caches, which the membership bits on the entry encode.

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::cache::entry::{CacheEntry, PageKey};

/// Per-file index of resident pages.
#[derive(Default)]
pub struct PageDirectory {
    inner: Mutex<HashMap<u64, HashSet<u64>>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file with no resident pages.
    pub fn init_file(&self, file_id: u64) {
        self.inner.lock().entry(file_id).or_default();
    }

    /// Records a page as resident.
    pub fn insert(&self, key: PageKey) {
        self.inner
            .lock()
            .entry(key.file_id)
            .or_default()
            .insert(key.page_index);
    }

    /// Drops the page if its descriptor has left both caches.
    pub fn remove_if_orphan(&self, entry: &CacheEntry) {
        if entry.in_read_cache() || entry.in_write_cache() {
            return;
        }
        if let Some(pages) = self.inner.lock().get_mut(&entry.file_id()) {
            pages.remove(&entry.page_index());
        }
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.inner
            .lock()
            .get(&key.file_id)
            .is_some_and(|pages| pages.contains(&key.page_index))
    }

    /// Resident page indices of one file, ascending.
    pub fn pages_of(&self, file_id: u64) -> Vec<u64> {
        let mut pages: Vec<u64> = self
            .inner
            .lock()
            .get(&file_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        pages.sort_unstable();
        pages
    }

    /// Empties a file's page set but keeps the file registered.
    pub fn clear_file(&self, file_id: u64) {
        if let Some(pages) = self.inner.lock().get_mut(&file_id) {
            pages.clear();
        }
    }

    /// Unregisters a file entirely.
    pub fn drop_file(&self, file_id: u64) {
        self.inner.lock().remove(&file_id);
    }

    pub fn resident_count(&self, file_id: u64) -> usize {
        self.inner
            .lock()
            .get(&file_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}
