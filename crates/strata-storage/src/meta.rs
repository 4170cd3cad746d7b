//! The metapage.
//!
//! Block 0 of every relation is the metapage. After the page header it
//! carries a magic word, the column count, and the root directory: one
//! root block number per tree (the TID tree at index 0, then one per
//! attribute).
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!  16       4   meta magic
//!  20       4   natts (user columns)
//!  24       8   undo high-water mark at last flush
//!  32     4*n   root block of tree attno, for attno in 0..=natts
//! ```
//!
//! Roots are created lazily: the first descent that needs to write into
//! a tree allocates an empty leaf covering the whole TID range and
//! records it here.

use strata_common::constants::{META_MAGIC, PAGE_HEADER_SIZE};
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, BlockNumber};

use crate::buffer::BufferPool;
use crate::page::{
    init_btree_page, init_tag_page, page_kind, BtreeOpaque, PageKind,
};

const MAGIC_OFFSET: usize = PAGE_HEADER_SIZE;
const NATTS_OFFSET: usize = MAGIC_OFFSET + 4;
const UNDO_HIGH_OFFSET: usize = NATTS_OFFSET + 4;
const ROOTS_OFFSET: usize = UNDO_HIGH_OFFSET + 8;

#[inline]
fn root_slot(attno: AttrNumber) -> usize {
    ROOTS_OFFSET + attno.as_u16() as usize * 4
}

/// Initializes metapage contents for a relation with `natts` columns.
/// Every root starts out invalid.
pub(crate) fn init_metapage(page: &mut [u8], natts: u32) {
    init_tag_page(page, PageKind::Meta);
    page[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&META_MAGIC.to_le_bytes());
    page[NATTS_OFFSET..NATTS_OFFSET + 4].copy_from_slice(&natts.to_le_bytes());
    for attno in 0..=natts {
        let off = root_slot(AttrNumber::new(attno as u16));
        page[off..off + 4].copy_from_slice(&BlockNumber::INVALID.as_u32().to_le_bytes());
    }
}

/// Validates the metapage and returns the column count.
pub(crate) fn metapage_natts(page: &[u8]) -> StrataResult<u32> {
    if page_kind(page) != PageKind::Meta {
        return Err(StrataError::corruption("block 0 is not a metapage"));
    }
    let magic = u32::from_le_bytes(page[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap());
    if magic != META_MAGIC {
        return Err(StrataError::corruption(format!(
            "bad metapage magic {magic:#010x}"
        )));
    }
    Ok(u32::from_le_bytes(
        page[NATTS_OFFSET..NATTS_OFFSET + 4].try_into().unwrap(),
    ))
}

/// Reads the undo high-water mark recorded at the last flush.
pub(crate) fn read_undo_high(page: &[u8]) -> u64 {
    u64::from_le_bytes(page[UNDO_HIGH_OFFSET..UNDO_HIGH_OFFSET + 8].try_into().unwrap())
}

/// Records the undo high-water mark; called at flush time so a reopened
/// relation starts its undo pointers above everything persisted.
pub(crate) fn write_undo_high(page: &mut [u8], high: u64) {
    page[UNDO_HIGH_OFFSET..UNDO_HIGH_OFFSET + 8].copy_from_slice(&high.to_le_bytes());
}

/// Reads the root block of a tree from metapage bytes.
pub(crate) fn read_root(page: &[u8], attno: AttrNumber) -> BlockNumber {
    let off = root_slot(attno);
    BlockNumber::new(u32::from_le_bytes(page[off..off + 4].try_into().unwrap()))
}

/// Writes the root block of a tree into metapage bytes. Used both
/// directly (lazy root creation) and on split-stack images (`newroot`).
pub(crate) fn write_root(page: &mut [u8], attno: AttrNumber, root: BlockNumber) {
    let off = root_slot(attno);
    page[off..off + 4].copy_from_slice(&root.as_u32().to_le_bytes());
}

/// Returns the root block of the given tree.
///
/// With `create` set, a missing root is created: an empty leaf covering
/// `[Tid::MIN, Tid::MAX_PLUS_ONE)` is allocated and recorded, all under
/// the metapage lock. Without it, a missing root yields `None` (the tree
/// is empty).
pub(crate) fn btree_root(
    pool: &BufferPool,
    attno: AttrNumber,
    create: bool,
) -> StrataResult<Option<BlockNumber>> {
    let metabuf = pool.pin(BlockNumber::METAPAGE)?;

    {
        let guard = metabuf.read();
        let natts = metapage_natts(&guard)?;
        if attno.as_u16() as u32 > natts {
            return Err(StrataError::invalid_argument(format!(
                "attribute {attno} out of range (relation has {natts} columns)"
            )));
        }
        let root = read_root(&guard, attno);
        if root.is_valid() {
            return Ok(Some(root));
        }
    }

    if !create {
        return Ok(None);
    }

    let mut guard = metabuf.write();
    // Re-check: another writer may have created the root while we
    // held no lock.
    let root = read_root(&guard, attno);
    if root.is_valid() {
        return Ok(Some(root));
    }

    let rootbuf = pool.allocate()?;
    {
        let mut root_guard = rootbuf.write();
        init_btree_page(
            root_guard.as_mut_slice(),
            &BtreeOpaque::new_root_leaf(attno),
        );
    }
    rootbuf.mark_dirty();

    write_root(guard.as_mut_slice(), attno, rootbuf.block());
    metabuf.mark_dirty();
    Ok(Some(rootbuf.block()))
}
