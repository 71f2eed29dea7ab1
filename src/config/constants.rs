//! # Cache Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> SYSTEM_HEADER_SIZE (12 bytes: 8-byte magic + 4-byte CRC32)
//!       │     Every on-disk page starts with this header; the CRC covers
//!       │     bytes [SYSTEM_HEADER_SIZE .. page_size).
//!       │
//!       └─> page_size config must be > SYSTEM_HEADER_SIZE
//!
//! MIN_CACHE_PAGES (16)
//!       │
//!       ├─> WRITE_CACHE_SHARE_SHIFT (4): write cache owns max_size >> 4
//!       │     With the 16-page floor the write cache always gets at least
//!       │     one page.
//!       │
//!       ├─> A1IN_SHARE (4): admission FIFO holds read_budget / 4
//!       │
//!       └─> A1OUT_SHARE (2): ghost FIFO holds read_budget / 2
//!
//! WRITE_GROUP_SIZE (16)
//!       │
//!       └─> Pages with consecutive indices are flushed together in runs of
//!           this length to exploit sequential I/O. Lock guards per group
//!           are stack-allocated, so keep this small.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `SYSTEM_HEADER_SIZE == MAGIC_SIZE + CRC_SIZE`
//! 2. `MIN_CACHE_PAGES >= 1 << WRITE_CACHE_SHARE_SHIFT` (the write cache
//!    share never rounds down to zero pages)

// ============================================================================
// ON-DISK PAGE LAYOUT
// These define the system header present on every page
// ============================================================================

/// Sentinel value at the start of every page on disk (stored big-endian).
pub const MAGIC_NUMBER: u64 = 0xFACB03FE;

/// Size of the magic number field in bytes.
pub const MAGIC_SIZE: usize = 8;

/// Byte offset of the CRC32 field within a page.
pub const CRC_OFFSET: usize = MAGIC_SIZE;

/// Size of the CRC32 field in bytes.
pub const CRC_SIZE: usize = 4;

/// Total size of the per-page system header. The CRC is computed over
/// bytes `[SYSTEM_HEADER_SIZE .. page_size)`.
pub const SYSTEM_HEADER_SIZE: usize = MAGIC_SIZE + CRC_SIZE;

/// Default page size in bytes (16KB).
pub const DEFAULT_PAGE_SIZE: usize = 16384;

const _: () = assert!(
    SYSTEM_HEADER_SIZE == MAGIC_SIZE + CRC_SIZE,
    "SYSTEM_HEADER_SIZE derivation mismatch"
);

// ============================================================================
// CACHE SIZING
// These control how the page budget is split between the caches
// ============================================================================

/// Minimum number of pages the cache will operate with. The page budget
/// derived from `max_memory_bytes / page_size` is clamped to at least this.
pub const MIN_CACHE_PAGES: usize = 16;

/// The write cache owns `max_size >> WRITE_CACHE_SHARE_SHIFT` pages; the
/// read cache gets the rest.
pub const WRITE_CACHE_SHARE_SHIFT: u32 = 4;

/// The admission FIFO (A1in) holds `read_budget / A1IN_SHARE` pages.
pub const A1IN_SHARE: usize = 4;

/// The ghost FIFO (A1out) tracks `read_budget / A1OUT_SHARE` identities.
pub const A1OUT_SHARE: usize = 2;

const _: () = assert!(
    MIN_CACHE_PAGES >= 1 << WRITE_CACHE_SHARE_SHIFT,
    "page floor too small: the write cache share would round down to zero"
);

// ============================================================================
// WRITE CACHE / FLUSHER
// ============================================================================

/// Number of consecutive page indices grouped into one write-group.
pub const WRITE_GROUP_SIZE: u64 = 16;

/// Default backpressure threshold: dirty pages above this block new
/// `mark_dirty` calls until the flusher drains the cache.
pub const DEFAULT_WRITE_QUEUE_LENGTH: usize = 15_000;

/// Default sleep interval between background flusher ticks, in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;

/// Write-groups younger than this are left alone by the background flusher
/// so that hot pages absorb repeated writes in memory, in milliseconds.
pub const DEFAULT_FLUSH_HYSTERESIS_MS: u64 = 1_000;

/// Consecutive flusher failures tolerated before the write cache is marked
/// unhealthy and `mark_dirty` starts failing fast.
pub const FLUSHER_FAILURE_LIMIT: u32 = 3;

// ============================================================================
// FILE OPERATIONS
// ============================================================================

/// Maximum rename attempts before giving up. Open handles can transiently
/// block rename on some platforms, so the first failures are retried.
pub const RENAME_RETRY_LIMIT: u32 = 10;

/// Initial backoff between rename attempts, in milliseconds. Doubles per
/// attempt.
pub const RENAME_RETRY_BACKOFF_MS: u64 = 50;

// ============================================================================
// VERIFICATION
// ============================================================================

/// Minimum interval between progress messages emitted by the stored-page
/// verification scan, in milliseconds.
pub const VERIFY_PROGRESS_INTERVAL_MS: u64 = 5_000;
