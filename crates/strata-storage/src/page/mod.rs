//! Page layout and disk format.
//!
//! Every page in a relation file is [`BLOCK_SIZE`] bytes:
//!
//! ```text
//! +--------------------+
//! |    Page Header     |  16 bytes
//! +--------------------+
//! |    Slot Array      |  4 bytes per slot, grows downward
//! |         ↓          |
//! +--------------------+
//! |    Free Space      |
//! +--------------------+
//! |         ↑          |
//! |    Item Data       |  grows upward
//! +--------------------+
//! |    Opaque Area     |  tree pages: 40-byte BtreeOpaque
//! +--------------------+  others: 2-byte page-kind tag
//! ```
//!
//! The last two bytes of every initialized page are a page-kind tag, so a
//! page identifies itself no matter how it is reached. Tree pages carry a
//! full [`BtreeOpaque`] whose final field is that tag.
//!
//! Unlike a heap page, a tree page's slot array is *ordered*: slot `i`
//! holds the item with the `i`-th smallest first-TID. There are no
//! tombstones; removal shifts the slot array, and the orphaned item bytes
//! are reclaimed by the next repack of the page.

mod checksum;
mod header;
mod opaque;
mod slotted;

pub use checksum::{compute_page_checksum, CHECKSUM_OFFSET};
pub use header::{PageHeader, PageHeaderRef};
pub use opaque::{
    init_btree_page, init_tag_page, page_kind, BtreeFlags, BtreeOpaque, PageKind,
};
pub use slotted::{TreePage, TreePageRef};

/// Size of every page, re-exported for convenience.
pub use strata_common::constants::BLOCK_SIZE;

/// Usable item space on an empty tree page (header, opaque excluded).
pub const EMPTY_TREE_PAGE_SPACE: usize = BLOCK_SIZE
    - strata_common::constants::PAGE_HEADER_SIZE
    - strata_common::constants::BTREE_OPAQUE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_page_space() {
        assert!(EMPTY_TREE_PAGE_SPACE > BLOCK_SIZE / 2);
        assert!(EMPTY_TREE_PAGE_SPACE < BLOCK_SIZE);
    }
}
