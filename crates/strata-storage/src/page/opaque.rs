//! Page self-identification and the B-tree opaque area.
//!
//! The last two bytes of every initialized page hold a page-kind tag.
//! Tree pages extend this to a 40-byte opaque structure at the page tail:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   attno
//!   2       2   flags
//!   4       4   next (right sibling block)
//!   8       8   lokey
//!  16       8   hikey (exclusive)
//!  24       2   level (0 = leaf)
//!  26      12   reserved
//!  38       2   page_id tag
//! ```

use bitflags::bitflags;

use strata_common::constants::{BTREE_OPAQUE_SIZE, TAG_OPAQUE_SIZE};
use strata_common::types::{AttrNumber, BlockNumber, Tid};

use super::header::PageHeader;

/// What a page is used for, per its tail tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// The metapage (block 0).
    Meta,
    /// A B-tree page (leaf or internal).
    Btree,
    /// Out-of-line datum storage.
    Toast,
    /// Undo log storage.
    Undo,
    /// Free-space map.
    FreeMap,
    /// Unused page, available for reallocation.
    Free,
    /// Never initialized (all zeroes), or unrecognized.
    Uninit,
}

impl PageKind {
    const META_TAG: u16 = 0xF001;
    const BTREE_TAG: u16 = 0xF002;
    const TOAST_TAG: u16 = 0xF003;
    const UNDO_TAG: u16 = 0xF004;
    const FREE_MAP_TAG: u16 = 0xF005;
    const FREE_TAG: u16 = 0xF006;

    /// Returns the on-page tag for this kind.
    #[must_use]
    pub fn tag(self) -> u16 {
        match self {
            Self::Meta => Self::META_TAG,
            Self::Btree => Self::BTREE_TAG,
            Self::Toast => Self::TOAST_TAG,
            Self::Undo => Self::UNDO_TAG,
            Self::FreeMap => Self::FREE_MAP_TAG,
            Self::Free => Self::FREE_TAG,
            Self::Uninit => 0,
        }
    }

    /// Decodes a tag.
    #[must_use]
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            Self::META_TAG => Self::Meta,
            Self::BTREE_TAG => Self::Btree,
            Self::TOAST_TAG => Self::Toast,
            Self::UNDO_TAG => Self::Undo,
            Self::FREE_MAP_TAG => Self::FreeMap,
            Self::FREE_TAG => Self::Free,
            _ => Self::Uninit,
        }
    }
}

/// Reads the page-kind tag from the last two bytes of a page.
#[must_use]
pub fn page_kind(page: &[u8]) -> PageKind {
    let n = page.len();
    PageKind::from_tag(u16::from_le_bytes([page[n - 2], page[n - 1]]))
}

bitflags! {
    /// Flags in the B-tree opaque area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BtreeFlags: u16 {
        /// This page is the root of its tree. Exactly one page per tree
        /// carries it.
        const ROOT = 0x0001;
    }
}

/// The opaque structure at the tail of every B-tree page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeOpaque {
    /// Which tree this page belongs to.
    pub attno: AttrNumber,
    /// Page flags.
    pub flags: BtreeFlags,
    /// Right sibling at the same level, INVALID at the right edge.
    pub next: BlockNumber,
    /// Smallest key this page may hold.
    pub lokey: Tid,
    /// Exclusive upper bound; equals the right sibling's lokey.
    pub hikey: Tid,
    /// Level in the tree, 0 for leaves.
    pub level: u16,
}

impl BtreeOpaque {
    /// Opaque for a fresh leaf covering the whole keyspace.
    #[must_use]
    pub fn new_root_leaf(attno: AttrNumber) -> Self {
        Self {
            attno,
            flags: BtreeFlags::ROOT,
            next: BlockNumber::INVALID,
            lokey: Tid::MIN,
            hikey: Tid::MAX_PLUS_ONE,
            level: 0,
        }
    }

    /// True if this page is its tree's root.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags.contains(BtreeFlags::ROOT)
    }

    /// True for leaf pages.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Reads the opaque area from a tree page.
    #[must_use]
    pub fn read_from(page: &[u8]) -> Self {
        debug_assert_eq!(page_kind(page), PageKind::Btree);
        let base = page.len() - BTREE_OPAQUE_SIZE;
        let read_u16 =
            |off: usize| u16::from_le_bytes([page[base + off], page[base + off + 1]]);
        let read_u32 = |off: usize| {
            u32::from_le_bytes([
                page[base + off],
                page[base + off + 1],
                page[base + off + 2],
                page[base + off + 3],
            ])
        };
        let read_u64 = |off: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&page[base + off..base + off + 8]);
            u64::from_le_bytes(bytes)
        };
        Self {
            attno: AttrNumber::new(read_u16(0)),
            flags: BtreeFlags::from_bits_truncate(read_u16(2)),
            next: BlockNumber::new(read_u32(4)),
            lokey: Tid::new(read_u64(8)),
            hikey: Tid::new(read_u64(16)),
            level: read_u16(24),
        }
    }

    /// Writes the opaque area onto a tree page.
    pub fn write_to(&self, page: &mut [u8]) {
        let base = page.len() - BTREE_OPAQUE_SIZE;
        page[base..base + 2].copy_from_slice(&self.attno.as_u16().to_le_bytes());
        page[base + 2..base + 4].copy_from_slice(&self.flags.bits().to_le_bytes());
        page[base + 4..base + 8].copy_from_slice(&self.next.as_u32().to_le_bytes());
        page[base + 8..base + 16].copy_from_slice(&self.lokey.to_le_bytes());
        page[base + 16..base + 24].copy_from_slice(&self.hikey.to_le_bytes());
        page[base + 24..base + 26].copy_from_slice(&self.level.to_le_bytes());
        page[base + 26..base + 38].fill(0);
        page[base + 38..base + 40].copy_from_slice(&PageKind::Btree.tag().to_le_bytes());
    }
}

/// Initializes a page as an empty B-tree page with the given opaque.
pub fn init_btree_page(page: &mut [u8], opaque: &BtreeOpaque) {
    let special = (page.len() - BTREE_OPAQUE_SIZE) as u16;
    PageHeader::new(page).initialize(special);
    opaque.write_to(page);
}

/// Initializes a page that carries only the page-kind tag (metapage,
/// freed pages).
pub fn init_tag_page(page: &mut [u8], kind: PageKind) {
    let special = (page.len() - TAG_OPAQUE_SIZE) as u16;
    PageHeader::new(page).initialize(special);
    let n = page.len();
    page[n - 2..].copy_from_slice(&kind.tag().to_le_bytes());
}
