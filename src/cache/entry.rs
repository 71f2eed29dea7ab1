//! # Cache Entry Descriptor
//!
//! One [`CacheEntry`] describes one cached page. The same descriptor is
//! referenced from up to three containers at once (the A1in or Am queue,
//! the write cache map, transiently the A1out ghost queue) plus caller
//! pins, so it is shared as `Arc<CacheEntry>` and all mutable state is
//! atomic. The containers never copy descriptors: whatever the read cache
//! and the write cache return for a key is the same allocation, which is
//! what keeps a page's buffer unified across both sides.
//!
//! ## Membership Bits
//!
//! `in_read_cache` and `in_write_cache` record which sides currently hold
//! the descriptor. They drive the buffer lifecycle: the buffer is freed
//! exactly when both bits are clear and the pin count is zero. A descriptor
//! with a null `data_pointer` is a ghost — identity and LSN only.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::WRITE_GROUP_SIZE;
use crate::memory::PagePointer;
use crate::storage::Lsn;

/// Identity of one page: file and zero-based page index.
///
/// Ordering is `(file_id, page_index)`, which both the write cache map and
/// multi-page lock acquisition rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: u64,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: u64, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }

    /// Index of the write-group this page belongs to within its file.
    pub fn write_group(&self) -> u64 {
        self.page_index / WRITE_GROUP_SIZE
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.file_id, self.page_index)
    }
}

/// Descriptor for one cached page.
#[derive(Debug)]
pub struct CacheEntry {
    key: PageKey,
    data_pointer: AtomicU64,
    usage_counter: AtomicU32,
    recently_changed: AtomicBool,
    in_write_cache: AtomicBool,
    in_read_cache: AtomicBool,
    lsn: AtomicU64,
    changed_at: AtomicU64,
}

impl CacheEntry {
    pub fn new(key: PageKey) -> Self {
        Self::with_lsn(key, 0)
    }

    pub fn with_lsn(key: PageKey, lsn: Lsn) -> Self {
        Self {
            key,
            data_pointer: AtomicU64::new(PagePointer::NULL.into_raw()),
            usage_counter: AtomicU32::new(0),
            recently_changed: AtomicBool::new(false),
            in_write_cache: AtomicBool::new(false),
            in_read_cache: AtomicBool::new(false),
            lsn: AtomicU64::new(lsn),
            changed_at: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn file_id(&self) -> u64 {
        self.key.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.key.page_index
    }

    pub fn data_pointer(&self) -> PagePointer {
        PagePointer::from_raw(self.data_pointer.load(Ordering::Acquire))
    }

    pub fn set_data_pointer(&self, ptr: PagePointer) {
        self.data_pointer.store(ptr.into_raw(), Ordering::Release);
    }

    /// Whether the descriptor is identity-only, with no buffer.
    pub fn is_ghost(&self) -> bool {
        self.data_pointer().is_null()
    }

    pub fn usage_counter(&self) -> u32 {
        self.usage_counter.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.usage_counter() > 0
    }

    pub fn pin(&self) {
        self.usage_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.usage_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    pub fn recently_changed(&self) -> bool {
        self.recently_changed.load(Ordering::Acquire)
    }

    pub fn set_recently_changed(&self, changed: bool) {
        self.recently_changed.store(changed, Ordering::Release);
    }

    pub fn in_write_cache(&self) -> bool {
        self.in_write_cache.load(Ordering::Acquire)
    }

    pub fn set_in_write_cache(&self, present: bool) {
        self.in_write_cache.store(present, Ordering::Release);
    }

    pub fn in_read_cache(&self) -> bool {
        self.in_read_cache.load(Ordering::Acquire)
    }

    pub fn set_in_read_cache(&self, present: bool) {
        self.in_read_cache.store(present, Ordering::Release);
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn, Ordering::Release);
    }

    /// Milliseconds since the owning cache's epoch at which this entry was
    /// last marked dirty. Drives the background flusher's hysteresis.
    pub fn changed_at(&self) -> u64 {
        self.changed_at.load(Ordering::Acquire)
    }

    pub fn set_changed_at(&self, millis: u64) {
        self.changed_at.store(millis, Ordering::Release);
    }
}
