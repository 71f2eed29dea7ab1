//! Page system-header stamping and verification.
//!
//! The magic number is stored big-endian in the first 8 bytes; the CRC32
//! (ISO HDLC polynomial) in the following 4 covers everything after the
//! header. Verification reports magic and checksum independently so the
//! stored-page scan can distinguish a clobbered header from a corrupted
//! payload.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::{CRC_OFFSET, MAGIC_NUMBER, MAGIC_SIZE, SYSTEM_HEADER_SIZE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Outcome of verifying one page's system header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCheck {
    pub magic_ok: bool,
    pub crc_ok: bool,
}

impl PageCheck {
    pub fn is_ok(&self) -> bool {
        self.magic_ok && self.crc_ok
    }
}

/// CRC32 over the page payload, i.e. bytes `[12 .. page_size)`.
pub fn page_crc(page: &[u8]) -> u32 {
    CRC32.checksum(&page[SYSTEM_HEADER_SIZE..])
}

/// Writes the magic number and payload CRC into the first 12 bytes.
pub fn stamp_page_header(page: &mut [u8]) {
    debug_assert!(page.len() > SYSTEM_HEADER_SIZE);

    page[..MAGIC_SIZE].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
    let crc = page_crc(page);
    page[CRC_OFFSET..SYSTEM_HEADER_SIZE].copy_from_slice(&crc.to_be_bytes());
}

/// Checks the magic number and payload CRC of a stored page.
pub fn verify_page_header(page: &[u8]) -> PageCheck {
    let mut magic_bytes = [0u8; MAGIC_SIZE];
    magic_bytes.copy_from_slice(&page[..MAGIC_SIZE]);
    let magic_ok = u64::from_be_bytes(magic_bytes) == MAGIC_NUMBER;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&page[CRC_OFFSET..SYSTEM_HEADER_SIZE]);
    let crc_ok = u32::from_be_bytes(crc_bytes) == page_crc(page);

    PageCheck { magic_ok, crc_ok }
}
