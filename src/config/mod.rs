//! # Configuration Module
//!
//! Centralizes the cache's numeric constants and the runtime configuration
//! struct. Constants live in [`constants`] with their interdependencies
//! documented and enforced through compile-time assertions; [`CacheConfig`]
//! carries the per-instance knobs.

pub mod constants;
pub use constants::*;

use std::time::Duration;

use eyre::{ensure, Result};

/// Runtime configuration for a [`crate::ReadWriteCache`].
///
/// Defaults match a small embedded deployment; tests typically lower
/// `max_memory_bytes` and disable `start_flush` and `file_lock`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total buffer budget in bytes. The page budget is
    /// `max_memory_bytes / page_size`, clamped to `[16, i32::MAX]`.
    pub max_memory_bytes: u64,
    /// Fixed page size in bytes. Must accommodate the 12-byte system header.
    pub page_size: usize,
    /// Dirty-page backpressure threshold.
    pub write_queue_length: usize,
    /// Whether to fsync a file after each flushed write-group.
    pub sync_on_page_flush: bool,
    /// Whether to start the background flusher at construction.
    pub start_flush: bool,
    /// Whether files take OS advisory locks on open.
    pub file_lock: bool,
    /// Sleep interval between background flusher ticks.
    pub flush_interval: Duration,
    /// Write-groups dirtied more recently than this are skipped by the
    /// background flusher.
    pub flush_hysteresis: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            write_queue_length: DEFAULT_WRITE_QUEUE_LENGTH,
            sync_on_page_flush: false,
            start_flush: true,
            file_lock: true,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            flush_hysteresis: Duration::from_millis(DEFAULT_FLUSH_HYSTERESIS_MS),
        }
    }
}

impl CacheConfig {
    pub fn new(max_memory_bytes: u64, page_size: usize) -> Self {
        Self {
            max_memory_bytes,
            page_size,
            ..Self::default()
        }
    }

    pub fn with_write_queue_length(mut self, length: usize) -> Self {
        self.write_queue_length = length;
        self
    }

    pub fn with_sync_on_page_flush(mut self, sync: bool) -> Self {
        self.sync_on_page_flush = sync;
        self
    }

    pub fn with_start_flush(mut self, start: bool) -> Self {
        self.start_flush = start;
        self
    }

    pub fn with_file_lock(mut self, lock: bool) -> Self {
        self.file_lock = lock;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_flush_hysteresis(mut self, hysteresis: Duration) -> Self {
        self.flush_hysteresis = hysteresis;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size > SYSTEM_HEADER_SIZE,
            "page size {} cannot accommodate the {}-byte system header",
            self.page_size,
            SYSTEM_HEADER_SIZE
        );
        ensure!(
            self.write_queue_length > 0,
            "write queue length must be positive"
        );
        Ok(())
    }

    /// Page budget derived from the memory budget, clamped to
    /// `[MIN_CACHE_PAGES, i32::MAX]`.
    pub fn max_size(&self) -> usize {
        let pages = self.max_memory_bytes / self.page_size as u64;
        (pages.min(i32::MAX as u64) as usize).max(MIN_CACHE_PAGES)
    }

    /// Pages owned by the write cache.
    pub fn write_cache_size(&self) -> usize {
        self.max_size() >> WRITE_CACHE_SHARE_SHIFT
    }

    /// Pages owned by the read cache.
    pub fn read_cache_size(&self) -> usize {
        self.max_size() - self.write_cache_size()
    }
}
