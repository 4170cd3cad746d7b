//! System-wide constants for StrataDB.

// =============================================================================
// Page geometry
// =============================================================================

/// Size of a disk block in bytes (8 KB).
///
/// Every page in a relation file is exactly this size, including the
/// metapage. Matches the common SSD block size.
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Size of the fixed page header at the start of every page.
///
/// The header contains: magic (2), version (1), flags (1), lower (2),
/// upper (2), special (2), nslots (2), checksum (4) = 16 bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of each entry in the page slot array: offset (2), length (2).
pub const SLOT_SIZE: usize = 4;

/// Size of the B-tree opaque area at the tail of every tree page.
///
/// Contains: attno (2), flags (2), next (4), lokey (8), hikey (8),
/// level (2), reserved (12), page_id (2) = 40 bytes.
pub const BTREE_OPAQUE_SIZE: usize = 40;

/// Size of the minimal opaque area (just the page_id tag) on non-tree pages.
pub const TAG_OPAQUE_SIZE: usize = 2;

/// Magic number stored in every page header.
pub const PAGE_MAGIC: u16 = 0x5354; // "ST"

/// Current page format version.
pub const PAGE_VERSION: u8 = 1;

/// Magic number stored in the metapage body.
pub const META_MAGIC: u32 = 0x5354_5244; // "STRD"

// =============================================================================
// Identifier limits
// =============================================================================

/// Highest valid block number. `u32::MAX` is reserved as invalid.
pub const MAX_BLOCK_NUMBER: u32 = 0xFFFF_FFFE;

/// Maximum number of user columns in a relation.
///
/// Bounded by the metapage root directory: one root slot per attribute
/// tree plus one for the TID tree must fit on a single page.
pub const MAX_COLUMNS: usize = 1024;

// =============================================================================
// Maintenance and layout tuning
// =============================================================================

/// Default memory budget for one vacuum round's dead-TID set (64 MB).
pub const DEFAULT_MAINTENANCE_WORK_MEM: usize = 64 * 1024 * 1024;

/// Estimated bytes of bookkeeping per entry in the dead-TID set.
pub const DEAD_TID_ENTRY_BYTES: usize = 48;

/// Default target size for an attribute array item's uncompressed payload.
///
/// Several items per page keeps repacking and vacuum granular without
/// drowning in per-item headers.
pub const DEFAULT_ATTR_ITEM_TARGET_SIZE: usize = 2048;

/// Fraction of leftover free space spread over the non-rightmost pages
/// when splitting the rightmost leaf. The remaining ~90% stays on the
/// tail page, where append-heavy workloads will use it.
pub const RIGHTMOST_SPLIT_FREE_FRACTION: f64 = 0.10;

/// Minimum payload size worth offering to the compressor.
pub const MIN_COMPRESS_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_geometry() {
        assert!(BLOCK_SIZE.is_power_of_two());
        assert!(PAGE_HEADER_SIZE + BTREE_OPAQUE_SIZE < BLOCK_SIZE);
        assert_eq!(PAGE_HEADER_SIZE % 4, 0);
        assert_eq!(BTREE_OPAQUE_SIZE % 4, 0);
    }

    #[test]
    fn test_metapage_capacity() {
        // One u32 root slot per column plus the TID tree, after the
        // metapage's own fields (magic, natts, undo high-water), must
        // fit on one page.
        let body = BLOCK_SIZE - PAGE_HEADER_SIZE - TAG_OPAQUE_SIZE - 16;
        assert!((MAX_COLUMNS + 1) * 4 <= body);
    }
}
