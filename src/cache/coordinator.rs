//! # Cache Coordinator
//!
//! [`ReadWriteCache`] is the public face of the cache: file lifecycle, page
//! load/release/mark-dirty, flushing, and the stored-page integrity scan.
//! It wires the 2Q read cache and the write-ordered write cache around one
//! structural lock and keeps the two sides agreeing on which descriptor
//! represents which page.
//!
//! ## Locking
//!
//! One coarse structural lock protects the coordinator state (file
//! counter and the 2Q queues) for the full duration of every public
//! operation. Per-page reader/writer locks sit underneath it: `load` holds
//! a page's read lock around the miss handling, flushes hold write locks
//! on whole write-groups. The background flusher never takes the
//! structural lock, only page locks and the write cache's own mutex, so a
//! caller blocked in a flush or on backpressure cannot deadlock against
//! it.
//!
//! Lock order, outermost first: structural lock, page locks (ascending by
//! key), write cache map, file registry.
//!
//! ## Read Path
//!
//! `load` consults the read cache; on a miss the write cache may satisfy
//! the read (a dirty page is the freshest copy), and the read cache adopts
//! that descriptor rather than duplicating it. On a double miss the page
//! comes from disk through 2Q admission. The entry is pinned until
//! `release`.
//!
//! ## Write Path
//!
//! Callers mutate the loaded buffer in place, then `mark_dirty` hands the
//! read cache's descriptor to the write cache, which stamps the log
//! position and schedules the page's write-group for flushing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::cache::directory::PageDirectory;
use crate::cache::entry::{CacheEntry, PageKey};
use crate::cache::errors::NotInCacheError;
use crate::cache::page_locks::PageLockTable;
use crate::cache::read_cache::ReadCache;
use crate::cache::write_cache::WriteCache;
use crate::cache::FileRegistry;
use crate::config::{
    CacheConfig, RENAME_RETRY_BACKOFF_MS, RENAME_RETRY_LIMIT, VERIFY_PROGRESS_INTERVAL_MS,
};
use crate::memory::{DirectMemory, PagePointer};
use crate::storage::{verify_page_header, DirtyPage, PagedFile, WriteAheadLog};

/// Receives progress messages from long-running maintenance operations.
pub trait ProgressListener {
    fn on_message(&self, message: &str);
}

/// One bad page found by [`ReadWriteCache::check_stored_pages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageVerificationError {
    pub magic_mismatch: bool,
    pub crc_mismatch: bool,
    pub io_failure: bool,
    pub page_index: u64,
    pub file_name: String,
}

struct CacheState {
    file_counter: u64,
    read_cache: ReadCache,
}

/// The paged buffer cache facade.
pub struct ReadWriteCache {
    config: CacheConfig,
    page_size: usize,
    base_dir: PathBuf,
    memory: Arc<DirectMemory>,
    files: Arc<FileRegistry>,
    directory: Arc<PageDirectory>,
    locks: Arc<PageLockTable>,
    write_cache: Arc<WriteCache>,
    state: Mutex<CacheState>,
}

impl ReadWriteCache {
    pub fn new<P: AsRef<Path>>(
        config: CacheConfig,
        base_dir: P,
        wal: Option<Arc<dyn WriteAheadLog>>,
    ) -> Result<Self> {
        config.validate()?;

        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).wrap_err_with(|| {
            format!("failed to create storage directory '{}'", base_dir.display())
        })?;

        let page_size = config.page_size;
        let memory = Arc::new(DirectMemory::new(page_size));
        let files: Arc<FileRegistry> = Arc::new(RwLock::new(HashMap::new()));
        let directory = Arc::new(PageDirectory::new());
        let locks = Arc::new(PageLockTable::new());

        let write_cache = Arc::new(WriteCache::new(
            &config,
            Arc::clone(&memory),
            Arc::clone(&files),
            Arc::clone(&locks),
            Arc::clone(&directory),
            wal,
        ));

        if config.start_flush {
            write_cache.start_flush()?;
        }

        let read_cache = ReadCache::new(
            config.read_cache_size(),
            page_size,
            Arc::clone(&memory),
            Arc::clone(&directory),
        );

        Ok(Self {
            config,
            page_size,
            base_dir,
            memory,
            files,
            directory,
            locks,
            write_cache,
            state: Mutex::new(CacheState {
                file_counter: 0,
                read_cache,
            }),
        })
    }

    /// Opens (or creates) a file and assigns it a cache-wide id. Pages the
    /// log knew dirty at its last checkpoint are reinstated.
    pub fn open_file(&self, name: &str) -> Result<u64> {
        let mut state = self.state.lock();

        state.file_counter += 1;
        let file_id = state.file_counter;

        let mut file = PagedFile::new(self.base_dir.join(name), self.config.file_lock);
        if file.exists() {
            file.open()?;
        } else {
            file.create()?;
        }

        self.files.write().insert(file_id, file);
        self.directory.init_file(file_id);
        self.write_cache.fill_dirty_pages(file_id);

        Ok(file_id)
    }

    /// Loads a page and pins it. The returned pointer addresses a buffer of
    /// exactly `page_size` bytes through [`ReadWriteCache::memory`]; the
    /// pin holds until [`ReadWriteCache::release`].
    pub fn load(&self, file_id: u64, page_index: u64) -> Result<PagePointer> {
        let mut state = self.state.lock();
        let key = PageKey::new(file_id, page_index);
        let _page_guard = self.locks.read(key);

        let entry = match state.read_cache.get(&key) {
            Some(entry) => entry,
            None => {
                // A dirty page is the freshest copy; adopt it instead of
                // re-reading stale disk content.
                let dirty = self.write_cache.get(file_id, page_index);
                let files = self.files.read();
                let file = files
                    .get(&file_id)
                    .filter(|f| f.is_open())
                    .ok_or_else(|| eyre::eyre!("file {} is not open", file_id))?;
                state.read_cache.load(key, file, dirty)?
            }
        };

        entry.pin();
        Ok(entry.data_pointer())
    }

    /// Releases one pin taken by `load`.
    pub fn release(&self, file_id: u64, page_index: u64) -> Result<()> {
        let state = self.state.lock();
        let key = PageKey::new(file_id, page_index);

        let entry = state
            .read_cache
            .peek(&key)
            .or_else(|| self.write_cache.get(file_id, page_index))
            .ok_or_else(|| NotInCacheError::new(key))?;

        entry.unpin();
        Ok(())
    }

    /// Marks a loaded page dirty, stamping the current log position.
    pub fn mark_dirty(&self, file_id: u64, page_index: u64) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.read_cache.get(&PageKey::new(file_id, page_index));
        self.write_cache.mark_dirty_entry(entry)?;
        Ok(())
    }

    /// Flushes every dirty page of a file, honoring the configured
    /// sync-on-flush policy.
    pub fn flush_file(&self, file_id: u64) -> Result<()> {
        let _state = self.state.lock();
        self.write_cache.flush_file(file_id)
    }

    /// Flushes every dirty page of a file with an explicit sync policy.
    pub fn flush_file_with_sync(&self, file_id: u64, sync: bool) -> Result<()> {
        let _state = self.state.lock();
        self.write_cache.flush_file_with_sync(file_id, sync)
    }

    /// Flushes every open file, ascending by file id.
    pub fn flush_buffer(&self) -> Result<()> {
        let _state = self.state.lock();
        for file_id in self.open_file_ids() {
            self.write_cache.flush_file(file_id)?;
        }
        Ok(())
    }

    /// Closes a file, flushing first when `flush` is set and discarding
    /// dirty pages otherwise. The caller guarantees no outstanding pins.
    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<()> {
        let mut state = self.state.lock();

        {
            let files = self.files.read();
            match files.get(&file_id) {
                Some(file) if file.is_open() => {}
                _ => return Ok(()),
            }
        }

        state.read_cache.close_file(file_id);
        self.write_cache.close_file(file_id, flush)?;

        if let Some(file) = self.files.write().get_mut(&file_id) {
            file.close();
        }
        Ok(())
    }

    /// Truncates a file to zero pages, discarding everything cached for it.
    pub fn truncate_file(&self, file_id: u64) -> Result<()> {
        let mut state = self.state.lock();

        for page_index in self.directory.pages_of(file_id) {
            self.write_cache.remove(file_id, page_index);
        }
        self.write_cache.clear_dirty_pages(file_id);
        state.read_cache.close_file(file_id);
        self.directory.clear_file(file_id);

        let mut files = self.files.write();
        let file = files
            .get_mut(&file_id)
            .ok_or_else(|| eyre::eyre!("file {} is not open", file_id))?;
        file.shrink(0)
    }

    /// Deletes a file from disk, truncating it first if open.
    pub fn delete_file(&self, file_id: u64) -> Result<()> {
        {
            let files = self.files.read();
            if !files.contains_key(&file_id) {
                return Ok(());
            }
        }

        if self.is_open(file_id) {
            self.truncate_file(file_id)?;
        }

        let _state = self.state.lock();
        if let Some(mut file) = self.files.write().remove(&file_id) {
            file.delete()?;
        }
        self.directory.drop_file(file_id);
        Ok(())
    }

    /// Renames a file whose name starts with `old_name`, substituting
    /// `new_name` for that prefix. Transient failures back off and retry a
    /// bounded number of times.
    pub fn rename_file(&self, file_id: u64, old_name: &str, new_name: &str) -> Result<()> {
        let _state = self.state.lock();
        let mut files = self.files.write();
        let Some(file) = files.get_mut(&file_id) else {
            return Ok(());
        };

        let current = file.name();
        let Some(suffix) = current.strip_prefix(old_name) else {
            return Ok(());
        };
        let new_path = self.base_dir.join(format!("{new_name}{suffix}"));

        let mut backoff = Duration::from_millis(RENAME_RETRY_BACKOFF_MS);
        for attempt in 1..=RENAME_RETRY_LIMIT {
            match file.rename_to(&new_path) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RENAME_RETRY_LIMIT => {
                    log::warn!(
                        "rename of '{}' failed (attempt {}), retrying: {:#}",
                        current,
                        attempt,
                        err
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => {
                    return Err(err).wrap_err_with(|| {
                        format!("rename retry budget exhausted after {} attempts", attempt)
                    });
                }
            }
        }
        unreachable!("retry loop returns on the final attempt");
    }

    pub fn is_open(&self, file_id: u64) -> bool {
        let _state = self.state.lock();
        self.files
            .read()
            .get(&file_id)
            .map(|file| file.is_open())
            .unwrap_or(false)
    }

    /// Page count of the file, derived from its high-water mark.
    pub fn filled_up_to(&self, file_id: u64) -> Result<u64> {
        let _state = self.state.lock();
        let files = self.files.read();
        let file = files
            .get(&file_id)
            .ok_or_else(|| eyre::eyre!("file {} is not open", file_id))?;
        Ok(file.filled_up_to() / self.page_size as u64)
    }

    pub fn was_softly_closed(&self, file_id: u64) -> bool {
        let _state = self.state.lock();
        self.files
            .read()
            .get(&file_id)
            .map(|file| file.was_softly_closed())
            .unwrap_or(false)
    }

    pub fn set_softly_closed(&self, file_id: u64, softly_closed: bool) -> Result<()> {
        let _state = self.state.lock();
        let files = self.files.read();
        if let Some(file) = files.get(&file_id) {
            if file.is_open() {
                file.set_softly_closed(softly_closed)?;
            }
        }
        Ok(())
    }

    /// Verifies the magic number and CRC of every page of every open file,
    /// flushing dirty pages first. I/O failures during a file's scan are
    /// reported for that file and the scan continues with the next one.
    pub fn check_stored_pages(
        &self,
        listener: Option<&dyn ProgressListener>,
    ) -> Vec<PageVerificationError> {
        let _state = self.state.lock();
        let mut errors = Vec::new();

        for file_id in self.open_file_ids() {
            let name = {
                let files = self.files.read();
                match files.get(&file_id) {
                    Some(file) => file.name(),
                    None => continue,
                }
            };

            notify(listener, &format!("flushing file '{}'...", name));
            if let Err(err) = self.write_cache.flush_file(file_id) {
                notify(
                    listener,
                    &format!("error: failed to flush file '{}': {:#}", name, err),
                );
                errors.push(PageVerificationError {
                    magic_mismatch: false,
                    crc_mismatch: false,
                    io_failure: true,
                    page_index: 0,
                    file_name: name,
                });
                continue;
            }

            notify(
                listener,
                &format!("started verification of file '{}'...", name),
            );
            let file_errors = self.scan_file(file_id, &name, listener);
            let file_ok = file_errors.is_empty();
            errors.extend(file_errors);

            if file_ok {
                notify(
                    listener,
                    &format!("verification of file '{}' finished without errors", name),
                );
            } else {
                notify(
                    listener,
                    &format!("verification of file '{}' finished with errors", name),
                );
            }
        }

        errors
    }

    fn scan_file(
        &self,
        file_id: u64,
        name: &str,
        listener: Option<&dyn ProgressListener>,
    ) -> Vec<PageVerificationError> {
        let mut errors = Vec::new();
        let files = self.files.read();
        let Some(file) = files.get(&file_id) else {
            return errors;
        };

        let page_count = file.filled_up_to() / self.page_size as u64;
        let mut buf = vec![0u8; self.page_size];
        let mut last_progress = Instant::now();

        for page_index in 0..page_count {
            if let Err(err) = file.read(page_index * self.page_size as u64, &mut buf) {
                notify(
                    listener,
                    &format!("error: failed to read page {} of '{}': {:#}", page_index, name, err),
                );
                errors.push(PageVerificationError {
                    magic_mismatch: false,
                    crc_mismatch: false,
                    io_failure: true,
                    page_index,
                    file_name: name.to_string(),
                });
                break;
            }

            let check = verify_page_header(&buf);
            if !check.magic_ok {
                notify(
                    listener,
                    &format!(
                        "error: magic number of page {} in file '{}' does not match",
                        page_index, name
                    ),
                );
            }
            if !check.crc_ok {
                notify(
                    listener,
                    &format!(
                        "error: checksum of page {} in file '{}' is incorrect",
                        page_index, name
                    ),
                );
            }
            if !check.is_ok() {
                errors.push(PageVerificationError {
                    magic_mismatch: !check.magic_ok,
                    crc_mismatch: !check.crc_ok,
                    io_failure: false,
                    page_index,
                    file_name: name.to_string(),
                });
            }

            if listener.is_some()
                && last_progress.elapsed() >= Duration::from_millis(VERIFY_PROGRESS_INTERVAL_MS)
            {
                notify(listener, &format!("{} pages were processed...", page_index + 1));
                last_progress = Instant::now();
            }
        }

        errors
    }

    /// Snapshot of all currently dirty pages, for a WAL checkpoint.
    pub fn log_dirty_pages_table(&self) -> Vec<DirtyPage> {
        let _state = self.state.lock();
        self.write_cache.log_dirty_pages_table()
    }

    /// Syncs every open file to stable storage.
    pub fn force_sync_stored_changes(&self) -> Result<()> {
        let _state = self.state.lock();
        let files = self.files.read();
        for file in files.values() {
            if file.is_open() {
                file.synch()?;
            }
        }
        Ok(())
    }

    /// Flushes everything, then drops both caches' content.
    pub fn clear(&self) -> Result<()> {
        self.flush_buffer()?;
        let mut state = self.state.lock();
        self.write_cache.clear();
        state.read_cache.clear();
        Ok(())
    }

    /// Flushes, stops the background flusher, and syncs and closes every
    /// file with its soft-close flag set.
    pub fn close(&self) -> Result<()> {
        self.clear()?;
        self.write_cache.stop_flush();

        let _state = self.state.lock();
        let mut files = self.files.write();
        for file in files.values_mut() {
            if file.is_open() {
                file.set_softly_closed(true)?;
                file.synch()?;
                file.close();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection, intended for tests and diagnostics
    // ------------------------------------------------------------------

    /// The allocator backing every page buffer; pointers returned by
    /// `load` dereference through it.
    pub fn memory(&self) -> &Arc<DirectMemory> {
        &self.memory
    }

    pub fn write_cache(&self) -> &Arc<WriteCache> {
        &self.write_cache
    }

    /// Pages resident in the read cache (A1in + Am).
    pub fn read_cache_size(&self) -> usize {
        self.state.lock().read_cache.size()
    }

    /// Lengths of the A1in, A1out, and Am queues.
    pub fn read_queue_lens(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.read_cache.a1_in_len(),
            state.read_cache.a1_out_len(),
            state.read_cache.am_len(),
        )
    }

    /// The read cache's descriptor for a page, without touching recency.
    pub fn read_cache_entry(&self, file_id: u64, page_index: u64) -> Option<Arc<CacheEntry>> {
        self.state
            .lock()
            .read_cache
            .peek(&PageKey::new(file_id, page_index))
    }

    /// Drops everything from the read cache. The caller guarantees no
    /// outstanding pins.
    pub fn clear_read_cache(&self) {
        self.state.lock().read_cache.clear();
    }

    fn open_file_ids(&self) -> Vec<u64> {
        let files = self.files.read();
        let mut ids: Vec<u64> = files
            .iter()
            .filter(|(_, file)| file.is_open())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for ReadWriteCache {
    fn drop(&mut self) {
        self.write_cache.stop_flush();
    }
}

fn notify(listener: Option<&dyn ProgressListener>, message: &str) {
    if let Some(listener) = listener {
        listener.on_message(message);
    }
}
