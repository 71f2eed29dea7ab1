//! # Paged File Store
//!
//! [`PagedFile`] is the cache's uniform handle over one append-growable
//! file. It does no caching and no locking beyond the optional OS advisory
//! lock; errors propagate as I/O failures with context.
//!
//! ## Physical Layout
//!
//! ```text
//! Offset                     Size        Description
//! ------                     ----        -----------------------------
//! 0                          16          File-manager header
//! 16 + i * page_size         page_size   Data page i
//! ```
//!
//! The 16-byte header carries a magic, a format version, and the soft-close
//! flag. All positions in the public API are *data* positions: position 0
//! is the first byte after the header, so callers address pages without
//! knowing the header exists.
//!
//! ## High-Water Mark
//!
//! `filled_up_to` is the number of data bytes ever written. Reads past it
//! return zeros; writes past it grow the file. This matches the contract
//! the write cache relies on when it zero-initializes pages beyond the end
//! of the file.
//!
//! ## Concurrency
//!
//! Reads and writes take `&self` (positional I/O via `FileExt`), so the
//! background flusher can write pages while the coordinator holds only a
//! read lock on the file registry. Lifecycle operations (open, close,
//! rename, shrink, delete) take `&mut self` and go through the registry's
//! write lock.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of the file-manager header block at physical offset 0.
pub const FILE_HEADER_SIZE: u64 = 16;

const FILE_MAGIC: [u8; 8] = *b"PGTD\x00\x00\x00\x01";
const FILE_VERSION: u16 = 1;
const FLAG_SOFTLY_CLOSED: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FileHeader {
    magic: [u8; 8],
    version: u16,
    flags: u8,
    _reserved: [u8; 5],
}

impl FileHeader {
    fn new(softly_closed: bool) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            flags: if softly_closed { FLAG_SOFTLY_CLOSED } else { 0 },
            _reserved: [0; 5],
        }
    }
}

/// One file of fixed-size pages, addressed by data byte position.
#[derive(Debug)]
pub struct PagedFile {
    path: PathBuf,
    file: Option<File>,
    filled: AtomicU64,
    softly_closed: AtomicBool,
    use_lock: bool,
}

impl PagedFile {
    pub fn new<P: AsRef<Path>>(path: P, use_lock: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            filled: AtomicU64::new(0),
            softly_closed: AtomicBool::new(false),
            use_lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, for diagnostics and verification reports.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Opens an existing file and reads its header.
    pub fn open(&mut self) -> Result<()> {
        ensure!(!self.is_open(), "file '{}' is already open", self.name());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open file '{}'", self.path.display()))?;

        if self.use_lock {
            file.lock()
                .wrap_err_with(|| format!("failed to lock file '{}'", self.path.display()))?;
        }

        let mut header_bytes = [0u8; FILE_HEADER_SIZE as usize];
        file.read_exact_at(&mut header_bytes, 0)
            .wrap_err_with(|| format!("failed to read header of '{}'", self.path.display()))?;

        let header = FileHeader::read_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("malformed file header in '{}': {:?}", self.path.display(), e))?;

        if header.magic != FILE_MAGIC {
            bail!("file '{}' is not a page store file", self.path.display());
        }
        ensure!(
            header.version == FILE_VERSION,
            "file '{}' has unsupported version {}",
            self.path.display(),
            header.version
        );

        let len = file
            .metadata()
            .wrap_err("failed to stat file")?
            .len()
            .saturating_sub(FILE_HEADER_SIZE);

        self.filled.store(len, Ordering::Release);
        self.softly_closed
            .store(header.flags & FLAG_SOFTLY_CLOSED != 0, Ordering::Release);
        self.file = Some(file);

        log::debug!("opened page store file '{}' ({} data bytes)", self.name(), len);
        Ok(())
    }

    /// Creates a fresh file with an empty data region.
    pub fn create(&mut self) -> Result<()> {
        ensure!(!self.is_open(), "file '{}' is already open", self.name());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to create file '{}'", self.path.display()))?;

        if self.use_lock {
            file.lock()
                .wrap_err_with(|| format!("failed to lock file '{}'", self.path.display()))?;
        }

        let header = FileHeader::new(false);
        file.write_all_at(header.as_bytes(), 0)
            .wrap_err_with(|| format!("failed to write header of '{}'", self.path.display()))?;

        self.filled.store(0, Ordering::Release);
        self.softly_closed.store(false, Ordering::Release);
        self.file = Some(file);

        log::debug!("created page store file '{}'", self.name());
        Ok(())
    }

    /// Reads `buf.len()` bytes at data position `pos`, zero-filling any
    /// part that lies beyond the high-water mark.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.handle()?;
        let filled = self.filled.load(Ordering::Acquire);

        let available = filled.saturating_sub(pos).min(buf.len() as u64) as usize;
        if available > 0 {
            file.read_exact_at(&mut buf[..available], FILE_HEADER_SIZE + pos)
                .wrap_err_with(|| {
                    format!(
                        "failed to read {} bytes at position {} of '{}'",
                        available,
                        pos,
                        self.name()
                    )
                })?;
        }
        buf[available..].fill(0);
        Ok(())
    }

    /// Writes `data` at data position `pos`, growing the file as needed.
    pub fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        let file = self.handle()?;

        file.write_all_at(data, FILE_HEADER_SIZE + pos).wrap_err_with(|| {
            format!(
                "failed to write {} bytes at position {} of '{}'",
                data.len(),
                pos,
                self.name()
            )
        })?;

        self.filled.fetch_max(pos + data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Truncates the data region to `size` bytes.
    pub fn shrink(&mut self, size: u64) -> Result<()> {
        let file = self.handle()?;

        file.set_len(FILE_HEADER_SIZE + size)
            .wrap_err_with(|| format!("failed to shrink '{}' to {} bytes", self.name(), size))?;

        self.filled.store(size, Ordering::Release);
        Ok(())
    }

    /// High-water mark of the data region in bytes.
    pub fn filled_up_to(&self) -> u64 {
        self.filled.load(Ordering::Acquire)
    }

    /// Forces file content to stable storage.
    pub fn synch(&self) -> Result<()> {
        self.handle()?
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.name()))
    }

    pub fn close(&mut self) {
        if self.file.take().is_some() {
            log::debug!("closed page store file '{}'", self.name());
        }
    }

    /// Closes and removes the file from disk.
    pub fn delete(&mut self) -> Result<()> {
        self.close();
        if self.path.exists() {
            fs::remove_file(&self.path)
                .wrap_err_with(|| format!("failed to delete '{}'", self.path.display()))?;
        }
        Ok(())
    }

    /// Renames the underlying file. The open handle stays valid.
    pub fn rename_to<P: AsRef<Path>>(&mut self, new_path: P) -> Result<()> {
        let new_path = new_path.as_ref();
        fs::rename(&self.path, new_path).wrap_err_with(|| {
            format!(
                "failed to rename '{}' to '{}'",
                self.path.display(),
                new_path.display()
            )
        })?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    /// Whether the last shutdown wrote the header with the soft-close flag.
    pub fn was_softly_closed(&self) -> bool {
        self.softly_closed.load(Ordering::Acquire)
    }

    /// Persists the soft-close flag in the file header.
    pub fn set_softly_closed(&self, softly_closed: bool) -> Result<()> {
        let file = self.handle()?;

        let header = FileHeader::new(softly_closed);
        file.write_all_at(header.as_bytes(), 0)
            .wrap_err_with(|| format!("failed to update header of '{}'", self.name()))?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync header of '{}'", self.name()))?;

        self.softly_closed.store(softly_closed, Ordering::Release);
        Ok(())
    }

    fn handle(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| eyre::eyre!("file '{}' is not open", self.name()))
    }
}
