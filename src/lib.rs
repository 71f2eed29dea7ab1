//! # pagetide — Paged Buffer Cache
//!
//! pagetide is the buffer cache of a disk-backed storage engine, extracted
//! as a standalone crate. It keeps fixed-size pages resident in buffers
//! outside the managed containers, runs 2Q replacement on the read side and
//! a write-ordered dirty buffer on the write side, and cooperates with a
//! write-ahead log so that no dirty page reaches disk before its describing
//! log record.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagetide::{CacheConfig, ReadWriteCache};
//!
//! let cache = ReadWriteCache::new(CacheConfig::default(), "./storage", None)?;
//!
//! let file_id = cache.open_file("users.pt")?;
//! let ptr = cache.load(file_id, 0)?;
//! cache.memory().write(ptr, 12, b"hello")?;
//! cache.mark_dirty(file_id, 0)?;
//! cache.release(file_id, 0)?;
//! cache.flush_buffer()?;
//! cache.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │       ReadWriteCache (coordinator)        │
//! │  structural lock · per-page RwLocks       │
//! ├─────────────────────┬─────────────────────┤
//! │  ReadCache (2Q)     │  WriteCache (WoW)   │
//! │  A1in / A1out / Am  │  write-groups,      │
//! │  clean residency    │  background flusher │
//! ├─────────────────────┴─────────────────────┤
//! │   DirectMemory (page buffers by handle)   │
//! ├───────────────────────────────────────────┤
//! │   PagedFile I/O         WriteAheadLog     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Reads consult the 2Q queues first, then the dirty map (a dirty page is
//! the freshest copy), and only then disk. Writes mutate the loaded buffer
//! in place and `mark_dirty` hands the page to the write cache, which
//! groups consecutive pages into write-groups and flushes them in the
//! background — each page's log prefix first, then the page.
//!
//! ## On-Disk Format
//!
//! Every page is exactly `page_size` bytes, starting with an 8-byte
//! big-endian magic number and a CRC32 over the payload.
//! [`ReadWriteCache::check_stored_pages`] verifies both across every open
//! file.
//!
//! ## Module Overview
//!
//! - [`config`]: constants and [`CacheConfig`]
//! - [`memory`]: page buffer allocator addressed by opaque handles
//! - [`storage`]: paged file I/O, page integrity header, WAL contract
//! - [`cache`]: entries, 2Q read cache, write cache, page locks,
//!   coordinator

pub mod cache;
pub mod config;
pub mod memory;
pub mod storage;

pub use cache::{
    BlockedPageError, CacheEntry, CacheFullError, NotInCacheError, PageKey,
    PageVerificationError, ProgressListener, ReadWriteCache, WriteCache,
};
pub use config::CacheConfig;
pub use memory::{AllocationError, DirectMemory, PagePointer};
pub use storage::{DirtyPage, InMemoryWal, Lsn, PagedFile, WriteAheadLog};
