//! # Fixed-Size Page Buffer Allocator
//!
//! This module implements the off-heap buffer store backing every cached
//! page. Buffers are boxed slices of exactly `page_size` bytes, owned by the
//! allocator and addressed by opaque [`PagePointer`] handles instead of
//! references.
//!
//! ## Why Handles Instead of References?
//!
//! A cached page is referenced from up to three containers (the two read
//! queues and the write cache map) plus transiently from caller pins.
//! Handing out `&[u8]` borrows from any one container would tie the buffer
//! lifetime to that container's borrow, which the cache cannot express: an
//! entry may migrate between queues while a caller still holds the page.
//! Opaque handles break that coupling. The cache guarantees validity through
//! pinning: a buffer is only freed once the page has left both caches and
//! its pin count is zero.
//!
//! ## Null Sentinel
//!
//! `PagePointer::NULL` denotes "no buffer". Ghost entries in the A1out
//! queue carry it, as do dirty-table entries reinstated from a WAL
//! checkpoint before their first access.
//!
//! ## Accounting
//!
//! An optional capacity cap bounds the number of live buffers; exceeding it
//! surfaces [`AllocationError`]. Tests use a small cap to provoke the
//! exhaustion path deterministically.
//!
//! ## Thread Safety
//!
//! `DirectMemory` is `Send + Sync`; the buffer table sits behind a
//! `parking_lot::Mutex` and is shared as `Arc<DirectMemory>` between the
//! caches and the background flusher.

use hashbrown::HashMap;
use parking_lot::Mutex;

use eyre::{ensure, Result};

/// Opaque handle to one allocated page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PagePointer(u64);

impl PagePointer {
    /// The "no buffer" sentinel.
    pub const NULL: PagePointer = PagePointer(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        PagePointer(raw)
    }

    pub(crate) fn into_raw(self) -> u64 {
        self.0
    }
}

/// Buffer allocation failed because the configured capacity is exhausted.
#[derive(Debug)]
pub struct AllocationError {
    pub requested_pages: usize,
    pub capacity: usize,
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "direct memory exhausted: {} page buffers live, capacity is {}",
            self.requested_pages, self.capacity
        )
    }
}

impl std::error::Error for AllocationError {}

struct Buffers {
    table: HashMap<u64, Box<[u8]>>,
    next_id: u64,
}

/// Allocator of fixed-size page buffers addressed by [`PagePointer`].
pub struct DirectMemory {
    page_size: usize,
    capacity: Option<usize>,
    buffers: Mutex<Buffers>,
}

impl DirectMemory {
    pub fn new(page_size: usize) -> Self {
        Self::with_capacity(page_size, None)
    }

    /// Creates an allocator that refuses to hold more than `capacity` live
    /// buffers at once.
    pub fn with_capacity(page_size: usize, capacity: Option<usize>) -> Self {
        Self {
            page_size,
            capacity,
            buffers: Mutex::new(Buffers {
                table: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates a zeroed buffer of exactly `page_size` bytes.
    pub fn allocate(&self) -> Result<PagePointer> {
        let mut buffers = self.buffers.lock();

        if let Some(capacity) = self.capacity {
            if buffers.table.len() >= capacity {
                return Err(AllocationError {
                    requested_pages: buffers.table.len() + 1,
                    capacity,
                }
                .into());
            }
        }

        let id = buffers.next_id;
        buffers.next_id += 1;
        buffers
            .table
            .insert(id, vec![0u8; self.page_size].into_boxed_slice());

        Ok(PagePointer(id))
    }

    /// Releases the buffer behind `ptr`. Freeing `NULL` is a no-op; freeing
    /// a pointer that was never allocated (or already freed) is a logic
    /// error in the caller.
    pub fn free(&self, ptr: PagePointer) {
        if ptr.is_null() {
            return;
        }
        let removed = self.buffers.lock().table.remove(&ptr.0);
        debug_assert!(removed.is_some(), "freed a pointer that was not live");
    }

    /// Reads `len` bytes at `offset` within the buffer.
    pub fn read(&self, ptr: PagePointer, offset: usize, len: usize) -> Result<Vec<u8>> {
        let buffers = self.buffers.lock();
        let buf = Self::resolve(&buffers, ptr)?;
        ensure!(
            offset + len <= buf.len(),
            "read of {} bytes at offset {} exceeds page size {}",
            len,
            offset,
            buf.len()
        );
        Ok(buf[offset..offset + len].to_vec())
    }

    /// Writes `data` at `offset` within the buffer.
    pub fn write(&self, ptr: PagePointer, offset: usize, data: &[u8]) -> Result<()> {
        self.set(ptr, offset, data, 0, data.len())
    }

    /// Copies `len` bytes from `src[src_offset..]` into the buffer at
    /// `offset`.
    pub fn set(
        &self,
        ptr: PagePointer,
        offset: usize,
        src: &[u8],
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let buf = Self::resolve_mut(&mut buffers, ptr)?;
        ensure!(
            offset + len <= buf.len(),
            "write of {} bytes at offset {} exceeds page size {}",
            len,
            offset,
            buf.len()
        );
        ensure!(
            src_offset + len <= src.len(),
            "source range {}..{} exceeds source length {}",
            src_offset,
            src_offset + len,
            src.len()
        );
        buf[offset..offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
        Ok(())
    }

    /// Copies the whole page out of the buffer.
    pub fn copy_out(&self, ptr: PagePointer) -> Result<Vec<u8>> {
        self.read(ptr, 0, self.page_size)
    }

    /// Replaces the whole page content.
    pub fn copy_in(&self, ptr: PagePointer, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.page_size,
            "page content must be exactly {} bytes, got {}",
            self.page_size,
            data.len()
        );
        self.write(ptr, 0, data)
    }

    /// Number of live buffers.
    pub fn allocated(&self) -> usize {
        self.buffers.lock().table.len()
    }

    fn resolve<'a>(buffers: &'a Buffers, ptr: PagePointer) -> Result<&'a [u8]> {
        ensure!(!ptr.is_null(), "null page pointer dereferenced");
        buffers
            .table
            .get(&ptr.0)
            .map(|buf| buf.as_ref())
            .ok_or_else(|| eyre::eyre!("dangling page pointer {:#x}", ptr.0))
    }

    fn resolve_mut<'a>(buffers: &'a mut Buffers, ptr: PagePointer) -> Result<&'a mut [u8]> {
        ensure!(!ptr.is_null(), "null page pointer dereferenced");
        buffers
            .table
            .get_mut(&ptr.0)
            .map(|buf| buf.as_mut())
            .ok_or_else(|| eyre::eyre!("dangling page pointer {:#x}", ptr.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_zeroed_buffer() {
        let memory = DirectMemory::new(64);
        let ptr = memory.allocate().unwrap();

        assert!(!ptr.is_null());
        assert_eq!(memory.read(ptr, 0, 64).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let memory = DirectMemory::new(64);
        let ptr = memory.allocate().unwrap();

        memory.write(ptr, 12, &[1, 2, 3, 99]).unwrap();

        assert_eq!(memory.read(ptr, 12, 4).unwrap(), vec![1, 2, 3, 99]);
        assert_eq!(memory.read(ptr, 0, 12).unwrap(), vec![0u8; 12]);
    }

    #[test]
    fn set_copies_subrange_of_source() {
        let memory = DirectMemory::new(32);
        let ptr = memory.allocate().unwrap();

        memory.set(ptr, 4, &[9, 8, 7, 6, 5], 1, 3).unwrap();

        assert_eq!(memory.read(ptr, 4, 3).unwrap(), vec![8, 7, 6]);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let memory = DirectMemory::new(16);
        let ptr = memory.allocate().unwrap();

        assert!(memory.write(ptr, 10, &[0u8; 8]).is_err());
    }

    #[test]
    fn free_releases_accounting() {
        let memory = DirectMemory::new(16);
        let ptr = memory.allocate().unwrap();
        assert_eq!(memory.allocated(), 1);

        memory.free(ptr);
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn free_null_is_noop() {
        let memory = DirectMemory::new(16);
        memory.free(PagePointer::NULL);
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn capacity_cap_surfaces_allocation_error() {
        let memory = DirectMemory::with_capacity(16, Some(2));
        let _a = memory.allocate().unwrap();
        let _b = memory.allocate().unwrap();

        let err = memory.allocate().unwrap_err();
        assert!(err.downcast_ref::<AllocationError>().is_some());
    }

    #[test]
    fn dangling_pointer_read_fails() {
        let memory = DirectMemory::new(16);
        let ptr = memory.allocate().unwrap();
        memory.free(ptr);

        assert!(memory.read(ptr, 0, 1).is_err());
    }
}
