//! Domain errors callers need to tell apart.
//!
//! Everything else propagates as a plain `eyre::Report` with context. These
//! three carry meaning a caller reacts to programmatically: a blocked flush
//! can be retried after releasing pins, a not-in-cache release is a contract
//! violation on the caller's side, and a full cache calls for backing off.
//! All of them implement `std::error::Error`, so `Report::downcast_ref`
//! recovers the typed value.

use crate::cache::entry::PageKey;

/// A flush ran into a pinned page. Release the page and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedPageError {
    pub key: PageKey,
}

impl BlockedPageError {
    pub fn new(key: PageKey) -> Self {
        Self { key }
    }
}

impl std::fmt::Display for BlockedPageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unable to perform flush because page {} is in use",
            self.key
        )
    }
}

impl std::error::Error for BlockedPageError {}

/// A release or mark-dirty was issued for a page no cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotInCacheError {
    pub key: Option<PageKey>,
}

impl NotInCacheError {
    pub fn new(key: PageKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn unknown() -> Self {
        Self { key: None }
    }
}

impl std::fmt::Display for NotInCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.key {
            Some(key) => write!(f, "requested page {} is not in cache", key),
            None => write!(f, "requested page is not in cache"),
        }
    }
}

impl std::error::Error for NotInCacheError {}

/// Every page the eviction policy could sacrifice is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFullError {
    pub resident: usize,
}

impl CacheFullError {
    pub fn new(resident: usize) -> Self {
        Self { resident }
    }
}

impl std::fmt::Display for CacheFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all {} cached pages are in use, no eviction candidate",
            self.resident
        )
    }
}

impl std::error::Error for CacheFullError {}
