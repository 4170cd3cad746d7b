//! Page checksums.
//!
//! CRC32 over the whole page except the checksum field itself. Checksums
//! are computed when dirty pages are flushed and verified when pages are
//! loaded; in-memory mutation does not maintain them.

/// Byte offset of the 4-byte checksum field in the page header.
pub const CHECKSUM_OFFSET: usize = 12;

/// Computes the checksum of a page, skipping the checksum field.
pub fn compute_page_checksum(page: &[u8]) -> u32 {
    debug_assert!(page.len() > CHECKSUM_OFFSET + 4);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}
