//! # Stored Page Integrity Tests
//!
//! Verifies the on-disk format end to end: flushed pages carry a valid
//! magic number and payload CRC, the verification scan finds exactly the
//! corruption that was planted, and the progress listener hears about it.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use tempfile::{tempdir, TempDir};

use pagetide::storage::FILE_HEADER_SIZE;
use pagetide::{CacheConfig, ProgressListener, ReadWriteCache};

const PAGE_SIZE: usize = 64;
const PAYLOAD_OFFSET: usize = 12;

fn config() -> CacheConfig {
    CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_start_flush(false)
        .with_file_lock(false)
}

fn new_cache(dir: &TempDir) -> ReadWriteCache {
    ReadWriteCache::new(config(), dir.path(), None).unwrap()
}

fn write_pages(cache: &ReadWriteCache, file_id: u64, pages: u64) {
    for page_index in 0..pages {
        let ptr = cache.load(file_id, page_index).unwrap();
        cache.mark_dirty(file_id, page_index).unwrap();
        cache
            .memory()
            .write(ptr, PAYLOAD_OFFSET, &[page_index as u8 + 1; 8])
            .unwrap();
        cache.release(file_id, page_index).unwrap();
    }
}

/// Flips one byte of a stored page behind the cache's back.
fn corrupt_byte(path: &Path, page_index: u64, offset_in_page: u64) {
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let pos = FILE_HEADER_SIZE + page_index * PAGE_SIZE as u64 + offset_in_page;

    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, pos).unwrap();
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, pos).unwrap();
    file.sync_all().unwrap();
}

#[derive(Default)]
struct CollectingListener {
    messages: Mutex<Vec<String>>,
}

impl ProgressListener for CollectingListener {
    fn on_message(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

#[test]
fn clean_files_scan_without_errors() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);

    let a = cache.open_file("a.pt").unwrap();
    let b = cache.open_file("b.pt").unwrap();
    write_pages(&cache, a, 6);
    write_pages(&cache, b, 3);
    cache.flush_buffer().unwrap();

    let errors = cache.check_stored_pages(None);

    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
}

#[test]
fn payload_flip_yields_exactly_one_crc_error() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    write_pages(&cache, file_id, 6);
    cache.flush_buffer().unwrap();

    corrupt_byte(&dir.path().join("t.pt"), 2, PAYLOAD_OFFSET as u64 + 5);

    let errors = cache.check_stored_pages(None);

    assert_eq!(errors.len(), 1);
    let error = &errors[0];
    assert!(error.crc_mismatch);
    assert!(!error.magic_mismatch);
    assert!(!error.io_failure);
    assert_eq!(error.page_index, 2);
    assert_eq!(error.file_name, "t.pt");
}

#[test]
fn magic_corruption_yields_a_magic_error() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    write_pages(&cache, file_id, 4);
    cache.flush_buffer().unwrap();

    corrupt_byte(&dir.path().join("t.pt"), 1, 0);

    let errors = cache.check_stored_pages(None);

    assert_eq!(errors.len(), 1);
    assert!(errors[0].magic_mismatch);
    assert!(!errors[0].crc_mismatch);
    assert_eq!(errors[0].page_index, 1);
}

#[test]
fn listener_hears_about_the_scan() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    write_pages(&cache, file_id, 4);
    cache.flush_buffer().unwrap();

    corrupt_byte(&dir.path().join("t.pt"), 3, PAYLOAD_OFFSET as u64);

    let listener = CollectingListener::default();
    let errors = cache.check_stored_pages(Some(&listener));
    assert_eq!(errors.len(), 1);

    let messages = listener.messages.lock().unwrap();
    assert!(messages.iter().any(|m| m.contains("verification")));
    assert!(messages.iter().any(|m| m.contains("checksum of page 3")));
    assert!(messages.iter().any(|m| m.contains("finished with errors")));
}

#[test]
fn round_trip_through_close_and_reopen() {
    let dir = tempdir().unwrap();
    let payload = *b"territor";

    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    // Pages 0..2 get filler so the file has no unstamped holes.
    write_pages(&cache, file_id, 3);
    let ptr = cache.load(file_id, 3).unwrap();
    cache.mark_dirty(file_id, 3).unwrap();
    cache
        .memory()
        .set(ptr, PAYLOAD_OFFSET, &payload, 0, payload.len())
        .unwrap();
    cache.release(file_id, 3).unwrap();
    cache.flush_buffer().unwrap();
    cache.close().unwrap();

    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 4);

    let ptr = cache.load(file_id, 3).unwrap();
    let stored = cache.memory().read(ptr, PAYLOAD_OFFSET, payload.len()).unwrap();
    assert_eq!(stored, payload);
    cache.release(file_id, 3).unwrap();

    assert!(cache.check_stored_pages(None).is_empty());
}

#[test]
fn dirty_pages_are_flushed_before_the_scan() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    write_pages(&cache, file_id, 2);

    // No explicit flush: the scan must flush before verifying.
    let errors = cache.check_stored_pages(None);

    assert!(errors.is_empty());
    assert_eq!(cache.write_cache().size(), 0);
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 2);
}
