//! # Storage Module
//!
//! The file-facing layer of the cache: raw page I/O against append-growable
//! files, the on-disk page integrity header, and the write-ahead log
//! contract the cache coordinates with.
//!
//! ## On-Disk Page Layout
//!
//! Every page on disk is exactly `page_size` bytes and begins with a
//! 12-byte system header:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ---------------------------------------
//! 0       8     magic         0xFACB03FE, big-endian
//! 8       4     crc32         CRC32 over bytes [12 .. page_size)
//! 12      ...   payload       Opaque to the cache
//! ```
//!
//! The header is stamped by the flusher immediately before a page buffer is
//! written out, and verified by the stored-page scan. The payload is never
//! interpreted here.
//!
//! ## Files
//!
//! [`PagedFile`] wraps one file. Pages are addressed by byte position;
//! reading past the high-water mark yields zeros and writing past it grows
//! the file. A small file-manager header at physical offset 0 carries the
//! soft-close flag, so page `i` lives at physical offset
//! `FILE_HEADER_SIZE + i * page_size`; the cache itself defines no
//! superblock and no sidecar files.
//!
//! ## WAL Coordination
//!
//! The cache consumes a write-ahead log through the [`WriteAheadLog`]
//! trait: before any dirty page buffer reaches disk, the log must have
//! durably persisted every record up to that page's LSN. The trait is the
//! full extent of the coupling; [`InMemoryWal`] is a reference
//! implementation for tests and embedders without a real log.

mod page_io;
mod page_store;
mod wal;

pub use page_io::{page_crc, stamp_page_header, verify_page_header, PageCheck};
pub use page_store::{PagedFile, FILE_HEADER_SIZE};
pub use wal::{DirtyPage, InMemoryWal, Lsn, WriteAheadLog};
