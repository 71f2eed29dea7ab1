//! # Write-Ahead Log Contract
//!
//! The cache never defines the log's record format or recovery protocol; it
//! only needs four promises from whatever log the storage engine runs:
//!
//! 1. `current_lsn` — the LSN of the most recently appended record, so
//!    `mark_dirty` can stamp each dirty page with the record describing its
//!    latest mutation.
//! 2. `flush_until` — make every record up to an LSN durable. The flusher
//!    calls this before writing a dirty page, which is the whole of the
//!    WAL-before-data ordering guarantee.
//! 3. `register_dirty` / `checkpoint_dirty_pages` — the log's dirty page
//!    table. The cache feeds it on `mark_dirty` and reads it back when a
//!    file is opened, so pages that were dirty at the last checkpoint are
//!    reinstated before anyone reads stale disk content around them.
//!
//! A cache constructed without a log skips all four calls; ordering is then
//! the embedder's problem.
//!
//! [`InMemoryWal`] implements the contract with plain counters. It exists
//! for tests and for embedders that want the cache's behavior without
//! durability, and it deliberately has no I/O at all.

use hashbrown::HashMap;
use parking_lot::Mutex;

use eyre::{ensure, Result};

/// Monotone log sequence number.
pub type Lsn = u64;

/// One row of the dirty page table: the page and the LSN of the record
/// describing its oldest unflushed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPage {
    pub file_id: u64,
    pub page_index: u64,
    pub lsn: Lsn,
}

/// The log operations the cache consumes.
pub trait WriteAheadLog: Send + Sync {
    /// LSN of the most recently appended record (the log tail).
    fn current_lsn(&self) -> Lsn;

    /// Durably persists every record with LSN at most `lsn`.
    fn flush_until(&self, lsn: Lsn) -> Result<()>;

    /// Highest LSN known to be durable.
    fn last_flushed_lsn(&self) -> Lsn;

    /// Records a page in the log's dirty page table.
    fn register_dirty(&self, file_id: u64, page_index: u64, lsn: Lsn);

    /// The dirty page table as of the last checkpoint.
    fn checkpoint_dirty_pages(&self) -> Vec<DirtyPage>;
}

#[derive(Default)]
struct WalState {
    current: Lsn,
    flushed: Lsn,
    dirty: HashMap<(u64, u64), Lsn>,
}

/// In-memory reference implementation of [`WriteAheadLog`].
#[derive(Default)]
pub struct InMemoryWal {
    state: Mutex<WalState>,
}

impl InMemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, advancing the log tail, and returns its LSN.
    pub fn append(&self) -> Lsn {
        let mut state = self.state.lock();
        state.current += 1;
        state.current
    }

    /// Drops a page from the dirty table, as a checkpoint would after
    /// observing the page clean on disk.
    pub fn forget_dirty(&self, file_id: u64, page_index: u64) {
        self.state.lock().dirty.remove(&(file_id, page_index));
    }
}

impl WriteAheadLog for InMemoryWal {
    fn current_lsn(&self) -> Lsn {
        self.state.lock().current
    }

    fn flush_until(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            lsn <= state.current,
            "cannot flush up to lsn {} past the log tail {}",
            lsn,
            state.current
        );
        state.flushed = state.flushed.max(lsn);
        Ok(())
    }

    fn last_flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }

    fn register_dirty(&self, file_id: u64, page_index: u64, lsn: Lsn) {
        let mut state = self.state.lock();
        // Keep the oldest LSN: recovery must start from the first
        // unflushed mutation of the page.
        state.dirty.entry((file_id, page_index)).or_insert(lsn);
    }

    fn checkpoint_dirty_pages(&self) -> Vec<DirtyPage> {
        let state = self.state.lock();
        let mut pages: Vec<DirtyPage> = state
            .dirty
            .iter()
            .map(|(&(file_id, page_index), &lsn)| DirtyPage {
                file_id,
                page_index,
                lsn,
            })
            .collect();
        pages.sort_by_key(|p| (p.file_id, p.page_index));
        pages
    }
}
