//! # Background Flusher and Backpressure Tests
//!
//! The flusher thread drains cold write-groups on its own; backpressure
//! throttles writers once the dirty set outgrows the queue limit. These
//! tests use real threads and small time budgets, polling with generous
//! deadlines to stay robust on slow machines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use pagetide::{CacheConfig, ReadWriteCache};

const PAGE_SIZE: usize = 64;
const PAYLOAD_OFFSET: usize = 12;

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn background_flusher_drains_cold_pages() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_file_lock(false)
        .with_start_flush(true)
        .with_flush_interval(Duration::from_millis(20))
        .with_flush_hysteresis(Duration::from_millis(0));
    let cache = ReadWriteCache::new(config, dir.path(), None).unwrap();
    let file_id = cache.open_file("t.pt").unwrap();

    let ptr = cache.load(file_id, 0).unwrap();
    cache.mark_dirty(file_id, 0).unwrap();
    cache.memory().write(ptr, PAYLOAD_OFFSET, &[9, 9, 9]).unwrap();
    cache.release(file_id, 0).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || cache.write_cache().size() == 0),
        "flusher never drained the dirty page"
    );
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 1);

    cache.close().unwrap();
}

#[test]
fn flusher_leaves_pinned_pages_for_later() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_file_lock(false)
        .with_start_flush(true)
        .with_flush_interval(Duration::from_millis(20))
        .with_flush_hysteresis(Duration::from_millis(0));
    let cache = ReadWriteCache::new(config, dir.path(), None).unwrap();
    let file_id = cache.open_file("t.pt").unwrap();

    // Pinned for the whole first phase: the flusher must skip its group.
    cache.load(file_id, 0).unwrap();
    cache.mark_dirty(file_id, 0).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(cache.write_cache().size(), 1);

    cache.release(file_id, 0).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || cache.write_cache().size() == 0),
        "flusher never picked the group back up after release"
    );

    cache.close().unwrap();
}

#[test]
fn hysteresis_delays_young_groups() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_file_lock(false)
        .with_start_flush(true)
        .with_flush_interval(Duration::from_millis(10))
        .with_flush_hysteresis(Duration::from_secs(3600));
    let cache = ReadWriteCache::new(config, dir.path(), None).unwrap();
    let file_id = cache.open_file("t.pt").unwrap();

    cache.write_cache().mark_dirty(file_id, 0).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(cache.write_cache().size(), 1, "young group flushed too early");

    cache.close().unwrap();
    assert_eq!(cache.write_cache().size(), 0);
}

#[test]
fn stop_flush_is_cooperative_and_idempotent() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_file_lock(false)
        .with_start_flush(true)
        .with_flush_interval(Duration::from_millis(10));
    let cache = ReadWriteCache::new(config, dir.path(), None).unwrap();

    cache.write_cache().stop_flush();
    cache.write_cache().stop_flush();
    cache.close().unwrap();
}

#[test]
fn backpressure_blocks_new_pages_until_a_flush() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_file_lock(false)
        .with_start_flush(false)
        .with_write_queue_length(2);
    let cache = Arc::new(ReadWriteCache::new(config, dir.path(), None).unwrap());
    let file_id = cache.open_file("t.pt").unwrap();

    cache.write_cache().mark_dirty(file_id, 0).unwrap();
    cache.write_cache().mark_dirty(file_id, 1).unwrap();

    // Re-marking an already-dirty page never blocks.
    cache.write_cache().mark_dirty(file_id, 0).unwrap();

    let blocked = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || cache.write_cache().mark_dirty(file_id, 2).map(|_| ()))
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished(), "marker was not backpressured");

    cache.write_cache().flush_file(file_id).unwrap();

    blocked.join().unwrap().unwrap();
    assert_eq!(cache.write_cache().size(), 1);
}
