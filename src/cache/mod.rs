//! # Cache Module
//!
//! The caching core: entry descriptors shared between both cache sides,
//! the 2Q read cache, the write-ordered write cache with its background
//! flusher, per-page reader/writer locks, and the coordinator that fronts
//! them all.
//!
//! ## Component Map
//!
//! ```text
//! ReadWriteCache (coordinator, structural lock)
//! ├── ReadCache        2Q replacement: A1in / A1out / Am
//! ├── WriteCache       ordered dirty map, write-groups, flusher thread
//! ├── PageLockTable    sharded per-page RwLocks, refcounted cleanup
//! ├── PageDirectory    resident pages per file
//! └── FileRegistry     file-id → PagedFile, shared with the flusher
//! ```
//!
//! One descriptor per page, shared: whatever side holds a page — either
//! queue, the dirty map, a caller pin — it holds the same `Arc<CacheEntry>`
//! and therefore the same buffer. The membership bits on the descriptor
//! decide when the buffer finally frees.

mod coordinator;
mod directory;
mod entry;
mod errors;
mod lru;
mod page_locks;
mod read_cache;
mod write_cache;

pub use coordinator::{PageVerificationError, ProgressListener, ReadWriteCache};
pub use directory::PageDirectory;
pub use entry::{CacheEntry, PageKey};
pub use errors::{BlockedPageError, CacheFullError, NotInCacheError};
pub use page_locks::{PageLockSet, PageLockTable, PageReadGuard, PageWriteGuard};
pub use read_cache::ReadCache;
pub use write_cache::WriteCache;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::storage::PagedFile;

/// Open files by cache-wide file id, shared between the coordinator and
/// the background flusher.
pub type FileRegistry = RwLock<HashMap<u64, PagedFile>>;
