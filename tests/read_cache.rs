//! # 2Q Read Cache Behavior Tests
//!
//! Drives the replacement policy through the public facade: admission,
//! ghost promotion, descriptor unification between the cache sides, and
//! the capacity/pin-safety properties under a randomized workload.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

use pagetide::{CacheConfig, ReadWriteCache};

const PAGE_SIZE: usize = 64;

// 64-page budget: write cache owns 4 pages, the read side 60, so the
// queues clamp at A1in 15, A1out 30, Am 45.
const K_IN: usize = 15;
const K_OUT: usize = 30;
const K_M: usize = 45;

fn config() -> CacheConfig {
    CacheConfig::new(64 * PAGE_SIZE as u64, PAGE_SIZE)
        .with_start_flush(false)
        .with_file_lock(false)
}

fn new_cache(dir: &TempDir) -> ReadWriteCache {
    ReadWriteCache::new(config(), dir.path(), None).unwrap()
}

#[test]
fn first_access_lands_in_the_admission_queue() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    cache.load(file_id, 0).unwrap();
    cache.release(file_id, 0).unwrap();

    let (a1_in, a1_out, am) = cache.read_queue_lens();
    assert_eq!((a1_in, a1_out, am), (1, 0, 0));
}

#[test]
fn admission_queue_overflow_leaves_ghosts() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    for page_index in 0..(K_IN as u64 + 3) {
        cache.load(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();
    }

    let (a1_in, a1_out, am) = cache.read_queue_lens();
    assert_eq!(a1_in, K_IN);
    assert_eq!(a1_out, 3);
    assert_eq!(am, 0);
}

#[test]
fn re_reference_after_eviction_promotes_to_am() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    // Push page 0 through A1in and off its end.
    for page_index in 0..(K_IN as u64 + 1) {
        cache.load(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();
    }
    let (_, a1_out, am) = cache.read_queue_lens();
    assert_eq!(a1_out, 1);
    assert_eq!(am, 0);

    // The ghost hit is the re-reference signal.
    cache.load(file_id, 0).unwrap();
    cache.release(file_id, 0).unwrap();

    let (_, a1_out, am) = cache.read_queue_lens();
    assert_eq!(a1_out, 0);
    assert_eq!(am, 1);
}

#[test]
fn loaded_page_reads_back_file_content() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    // Write through the cache, flush, evict, then fault the page back in.
    let ptr = cache.load(file_id, 0).unwrap();
    cache.mark_dirty(file_id, 0).unwrap();
    cache.memory().write(ptr, 20, &[11, 22, 33]).unwrap();
    cache.release(file_id, 0).unwrap();
    cache.flush_buffer().unwrap();
    cache.clear_read_cache();

    let ptr = cache.load(file_id, 0).unwrap();
    assert_eq!(cache.memory().read(ptr, 20, 3).unwrap(), vec![11, 22, 33]);
    cache.release(file_id, 0).unwrap();
}

#[test]
fn read_and_write_cache_agree_on_one_descriptor() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    for page_index in 0..8u64 {
        cache.load(file_id, page_index).unwrap();
        cache.mark_dirty(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();
    }

    for page_index in 0..8u64 {
        let from_read = cache.read_cache_entry(file_id, page_index).unwrap();
        let from_write = cache.write_cache().get(file_id, page_index).unwrap();
        assert!(
            Arc::ptr_eq(&from_read, &from_write),
            "page {} has two descriptors",
            page_index
        );
        assert_eq!(from_read.data_pointer(), from_write.data_pointer());
    }
}

#[test]
fn queue_capacities_hold_under_randomized_load() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    let mut rng = StdRng::seed_from_u64(7331);

    for _ in 0..2_000 {
        let page_index = rng.gen_range(0..200u64);
        cache.load(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();

        let (a1_in, a1_out, am) = cache.read_queue_lens();
        assert!(a1_in <= K_IN, "A1in grew to {}", a1_in);
        assert!(a1_out <= K_OUT, "A1out grew to {}", a1_out);
        assert!(am <= K_M, "Am grew to {}", am);
    }
}

#[test]
fn pinned_pages_survive_randomized_eviction_pressure() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    // Keep three pages pinned while the rest of the workload churns.
    let pinned: Vec<u64> = vec![500, 501, 502];
    for &page_index in &pinned {
        let ptr = cache.load(file_id, page_index).unwrap();
        cache.memory().write(ptr, 16, &[page_index as u8]).unwrap();
    }

    for _ in 0..1_000 {
        let page_index = rng.gen_range(0..100u64);
        cache.load(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();
    }

    for &page_index in &pinned {
        let entry = cache.read_cache_entry(file_id, page_index).unwrap();
        assert!(entry.is_pinned());
        assert_eq!(
            cache
                .memory()
                .read(entry.data_pointer(), 16, 1)
                .unwrap(),
            vec![page_index as u8]
        );
        cache.release(file_id, page_index).unwrap();
    }
}

#[test]
fn buffers_are_freed_once_pages_leave_both_caches() {
    let dir = tempdir().unwrap();
    let cache = new_cache(&dir);
    let file_id = cache.open_file("t.pt").unwrap();

    for page_index in 0..100u64 {
        cache.load(file_id, page_index).unwrap();
        cache.release(file_id, page_index).unwrap();
    }

    // Only resident pages may hold buffers; ghosts must not.
    let (a1_in, _, am) = cache.read_queue_lens();
    assert_eq!(cache.memory().allocated(), a1_in + am);

    cache.clear_read_cache();
    assert_eq!(cache.memory().allocated(), 0);
}
