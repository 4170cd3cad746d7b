//! B-tree descent and structural operations.
//!
//! Both tree kinds (TID tree and attribute trees) share this machinery:
//! root-to-leaf descent keyed by TID, right-link pursuit to survive
//! concurrent splits, and the structural operations that reshape a tree -
//! `newroot`, `insert_downlinks`, `unlink_page`. Structural operations
//! never write pages directly; they build [`SplitStack`]s that the caller
//! applies atomically.
//!
//! Locking order is child before parent and left sibling before right;
//! `unlink_page` is the one place that would have to violate it and uses
//! a non-blocking acquire instead.

pub mod repack;
pub mod splitstack;

use strata_common::constants::SLOT_SIZE;
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, BlockNumber, Tid};

use crate::buffer::{Buffer, BufferPool, PageWriteGuard};
use crate::meta;
use crate::page::{
    init_btree_page, init_tag_page, page_kind, BtreeFlags, BtreeOpaque, PageKind, TreePage,
    TreePageRef, BLOCK_SIZE, EMPTY_TREE_PAGE_SPACE,
};

use splitstack::SplitStack;

/// Encoded size of one internal-page downlink item.
pub(crate) const INTERNAL_ITEM_SIZE: usize = 12;

/// Upper bound on pages visited in one descent before declaring the
/// right-link chain cyclic.
const MAX_DESCEND_STEPS: usize = 1 << 20;

/// Upper bound on relock-and-revalidate retries for writers.
const MAX_RELOCK_RETRIES: usize = 10_000;

/// A downlink on an internal page: the child's lokey and its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalItem {
    /// The child page's lokey.
    pub key: Tid,
    /// The child page's block number.
    pub child: BlockNumber,
}

impl InternalItem {
    /// Encodes the downlink for on-page storage.
    #[must_use]
    pub fn encode(&self) -> [u8; INTERNAL_ITEM_SIZE] {
        let mut bytes = [0u8; INTERNAL_ITEM_SIZE];
        bytes[0..8].copy_from_slice(&self.key.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.child.as_u32().to_le_bytes());
        bytes
    }

    /// Decodes a downlink from its on-page bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), INTERNAL_ITEM_SIZE, "bad internal item length");
        let mut key = [0u8; 8];
        key.copy_from_slice(&bytes[0..8]);
        let mut child = [0u8; 4];
        child.copy_from_slice(&bytes[8..12]);
        Self {
            key: Tid::from_le_bytes(key),
            child: BlockNumber::new(u32::from_le_bytes(child)),
        }
    }
}

/// Finds the greatest downlink index whose key is `<= key`.
fn binsrch_internal(page: &TreePageRef<'_>, key: Tid) -> Option<usize> {
    let mut low = 0usize;
    let mut high = page.nitems();
    while high > low {
        let mid = low + (high - low) / 2;
        let item = InternalItem::decode(page.item(mid));
        if key >= item.key {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low.checked_sub(1)
}

/// Checks a locked page against the target a caller descended for.
///
/// Required after every relock: the page may have been split, emptied, or
/// recycled between the descent's unlock and the caller's lock.
#[must_use]
pub fn page_is_expected(page: &[u8], attno: AttrNumber, key: Tid, level: u16) -> bool {
    if page_kind(page) != PageKind::Btree {
        return false;
    }
    let opaque = BtreeOpaque::read_from(page);
    opaque.attno == attno && opaque.level == level && opaque.lokey <= key && key < opaque.hikey
}

/// Descends from the root to the page covering `key` at `level`.
///
/// Returns the page **pinned but unlocked**; callers relock in the mode
/// they need and must re-validate with [`page_is_expected`]. Concurrent
/// splits are survived by following right-links; a page that stopped
/// being part of this tree sends the descent back to the root.
///
/// With `readonly` set, an empty tree yields `None`; otherwise the root
/// is created on demand.
pub fn descend(
    pool: &BufferPool,
    attno: AttrNumber,
    key: Tid,
    level: u16,
    readonly: bool,
) -> StrataResult<Option<Buffer>> {
    let Some(root) = meta::btree_root(pool, attno, !readonly)? else {
        return Ok(None);
    };
    let mut next = root;
    let mut steps = 0usize;

    loop {
        steps += 1;
        if steps > MAX_DESCEND_STEPS {
            return Err(StrataError::corruption(format!(
                "descent in attribute {attno} did not terminate; right-link cycle?"
            )));
        }

        let buf = pool.pin(next)?;
        let guard = buf.read();

        let stale = page_kind(&guard) != PageKind::Btree || {
            let opaque = BtreeOpaque::read_from(&guard);
            opaque.attno != attno || opaque.level < level || key < opaque.lokey
        };
        if stale {
            // Recycled or repurposed under us; restart from the root.
            drop(guard);
            match meta::btree_root(pool, attno, false)? {
                Some(block) => {
                    next = block;
                    continue;
                }
                None => return Ok(None),
            }
        }

        let opaque = BtreeOpaque::read_from(&guard);
        if key >= opaque.hikey {
            // Split concurrently; the key moved right.
            if opaque.next == buf.block() {
                return Err(StrataError::corruption(format!(
                    "block {} of attribute {attno} links to itself",
                    buf.block()
                )));
            }
            if !opaque.next.is_valid() {
                return Err(StrataError::UnexpectedPage {
                    attno,
                    block: buf.block(),
                    reason: format!("key {key} beyond hikey on rightmost page"),
                });
            }
            next = opaque.next;
            continue;
        }

        if opaque.level == level {
            drop(guard);
            return Ok(Some(buf));
        }

        // Internal page: follow the downlink.
        let page = TreePageRef::new(&guard);
        if page.nitems() == 0 {
            return Err(StrataError::corruption(format!(
                "internal block {} of attribute {attno} has no downlinks",
                buf.block()
            )));
        }
        let Some(idx) = binsrch_internal(&page, key) else {
            return Err(StrataError::ItemOrdering {
                attno,
                block: buf.block(),
            });
        };
        next = InternalItem::decode(page.item(idx)).child;
    }
}

/// Descends, exclusive-locks, and re-validates, retrying until the locked
/// page really covers `key` at `level`. This is how every writer obtains
/// its target page; it also resolves the race between locking a leaf and
/// a concurrent split of that leaf.
pub(crate) fn descend_and_lock_exclusive(
    pool: &BufferPool,
    attno: AttrNumber,
    key: Tid,
    level: u16,
) -> StrataResult<(Buffer, PageWriteGuard)> {
    for _ in 0..MAX_RELOCK_RETRIES {
        let buf = descend(pool, attno, key, level, false)?.ok_or_else(|| {
            StrataError::internal(format!("could not create root of attribute {attno}"))
        })?;
        let guard = buf.write();
        if page_is_expected(&guard, attno, key, level) {
            return Ok((buf, guard));
        }
    }
    Err(StrataError::corruption(format!(
        "could not obtain a stable page for key {key} in attribute {attno}"
    )))
}

/// Builds a new root holding `downlinks`, plus the metapage update that
/// points the tree at it. Returned as a stack fragment to be applied with
/// the rest of the structural change.
pub(crate) fn newroot(
    pool: &BufferPool,
    attno: AttrNumber,
    level: u16,
    downlinks: &[InternalItem],
) -> StrataResult<SplitStack> {
    let rootbuf = pool.allocate()?;
    let root_guard = rootbuf.write();

    let mut image = vec![0u8; BLOCK_SIZE];
    init_btree_page(
        &mut image,
        &BtreeOpaque {
            attno,
            flags: BtreeFlags::ROOT,
            next: BlockNumber::INVALID,
            lokey: Tid::MIN,
            hikey: Tid::MAX_PLUS_ONE,
            level,
        },
    );
    {
        let mut page = TreePage::new(&mut image);
        for downlink in downlinks {
            if !page.append_item(&downlink.encode()) {
                return Err(StrataError::internal(format!(
                    "{} downlinks do not fit on a new root",
                    downlinks.len()
                )));
            }
        }
    }

    let metabuf = pool.pin(BlockNumber::METAPAGE)?;
    let meta_guard = metabuf.write();
    let mut meta_image = (*meta_guard).clone();
    meta::write_root(&mut meta_image, attno, rootbuf.block());

    let mut stack = SplitStack::new();
    stack.push(rootbuf, root_guard, image);
    stack.push(metabuf, meta_guard, meta_image);
    Ok(stack)
}

/// Inserts downlinks for freshly split children into the parent level.
///
/// `lokey`/`left_block` name the page that was split (the parent already
/// has its downlink); the new entries go right after it. If the parent
/// overflows it is split as well, recursing upward, growing a new root
/// when the old root itself splits.
pub(crate) fn insert_downlinks(
    pool: &BufferPool,
    attno: AttrNumber,
    lokey: Tid,
    left_block: BlockNumber,
    level: u16,
    downlinks: Vec<InternalItem>,
) -> StrataResult<SplitStack> {
    debug_assert!(!downlinks.is_empty());
    let (buf, guard) = descend_and_lock_exclusive(pool, attno, lokey, level)?;
    let opaque = BtreeOpaque::read_from(&guard);

    let idx = {
        let page = TreePageRef::new(&guard);
        let mut found = None;
        if let Some(i) = binsrch_internal(&page, lokey) {
            if InternalItem::decode(page.item(i)).child == left_block {
                found = Some(i);
            }
        }
        if found.is_none() {
            found = (0..page.nitems())
                .find(|&i| InternalItem::decode(page.item(i)).child == left_block);
        }
        found.ok_or_else(|| {
            StrataError::corruption(format!(
                "no downlink for split child {left_block} on block {} of attribute {attno}",
                buf.block()
            ))
        })?
    };

    let need = downlinks.len() * (INTERNAL_ITEM_SIZE + SLOT_SIZE);
    if TreePageRef::new(&guard).free_space() >= need {
        let mut image = (*guard).clone();
        {
            let mut page = TreePage::new(&mut image);
            for (i, downlink) in downlinks.iter().enumerate() {
                let ok = page.insert_item(idx + 1 + i, &downlink.encode());
                debug_assert!(ok);
            }
        }
        let mut stack = SplitStack::new();
        stack.push(buf, guard, image);
        return Ok(stack);
    }

    // The parent overflows: rebuild it as a chain of internal pages.
    let mut spliced: Vec<InternalItem> = Vec::new();
    {
        let page = TreePageRef::new(&guard);
        for i in 0..page.nitems() {
            spliced.push(InternalItem::decode(page.item(i)));
            if i == idx {
                spliced.extend(downlinks.iter().copied());
            }
        }
    }

    let per_item = INTERNAL_ITEM_SIZE + SLOT_SIZE;
    let max_per_page = EMPTY_TREE_PAGE_SPACE / per_item;
    let num_pages = spliced.len().div_ceil(max_per_page);
    let per_page = spliced.len().div_ceil(num_pages);
    let chunks: Vec<&[InternalItem]> = spliced.chunks(per_page).collect();
    let npages = chunks.len();

    let was_root = opaque.is_root();
    let mut images = Vec::with_capacity(npages);
    let mut first_keys = Vec::with_capacity(npages);
    for (i, chunk) in chunks.iter().enumerate() {
        let page_lokey = if i == 0 { opaque.lokey } else { chunk[0].key };
        let page_hikey = if i + 1 < npages {
            chunks[i + 1][0].key
        } else {
            opaque.hikey
        };
        // Dead bytes from earlier downlink removals can make a full-
        // looking page that still rewrites into one fresh page; the ROOT
        // flag survives in that case.
        let flags = if i == 0 && was_root && npages == 1 {
            BtreeFlags::ROOT
        } else {
            BtreeFlags::empty()
        };
        let mut image = vec![0u8; BLOCK_SIZE];
        init_btree_page(
            &mut image,
            &BtreeOpaque {
                attno,
                flags,
                next: BlockNumber::INVALID,
                lokey: page_lokey,
                hikey: page_hikey,
                level,
            },
        );
        {
            let mut page = TreePage::new(&mut image);
            for item in *chunk {
                let ok = page.append_item(&item.encode());
                debug_assert!(ok);
            }
        }
        images.push(image);
        first_keys.push(page_lokey);
    }

    // Allocate (and lock) buffers for the new pages before anything is
    // overwritten.
    let mut bufs = vec![buf];
    let mut guards = vec![guard];
    for _ in 1..npages {
        let newbuf = pool.allocate()?;
        let newguard = newbuf.write();
        bufs.push(newbuf);
        guards.push(newguard);
    }
    for i in 0..npages {
        let next = if i + 1 < npages {
            bufs[i + 1].block()
        } else {
            opaque.next
        };
        let mut o = BtreeOpaque::read_from(&images[i]);
        o.next = next;
        o.write_to(&mut images[i]);
    }

    let new_downlinks: Vec<InternalItem> = (1..npages)
        .map(|i| InternalItem {
            key: first_keys[i],
            child: bufs[i].block(),
        })
        .collect();

    let upper = if npages == 1 {
        SplitStack::new()
    } else if was_root {
        let mut all = vec![InternalItem {
            key: first_keys[0],
            child: bufs[0].block(),
        }];
        all.extend(new_downlinks);
        newroot(pool, attno, level + 1, &all)?
    } else {
        insert_downlinks(pool, attno, opaque.lokey, bufs[0].block(), level + 1, new_downlinks)?
    };

    let mut stack = SplitStack::new();
    for ((b, g), image) in bufs.into_iter().zip(guards).zip(images) {
        stack.push(b, g, image);
    }
    stack.append(upper);
    Ok(stack)
}

/// Outcome of an unlink attempt.
pub(crate) enum UnlinkOutcome {
    /// The stack removes the page; apply it.
    Unlinked(SplitStack),
    /// The page cannot be unlinked right now; the caller keeps it empty
    /// (vacuum retries later). The leaf guard is handed back.
    Declined(PageWriteGuard),
}

/// Tries to remove an empty page from its tree: the left sibling takes
/// over its key range and right-link, the parent loses its downlink, and
/// the block is freed.
///
/// Declines when the page is the root, the leftmost child of its parent
/// (the left sibling lives under a different parent), or the sibling's
/// lock cannot be taken without waiting (lock-order inversion).
pub(crate) fn unlink_page(
    pool: &BufferPool,
    attno: AttrNumber,
    buf: &Buffer,
    guard: PageWriteGuard,
    level: u16,
) -> StrataResult<UnlinkOutcome> {
    let opaque = BtreeOpaque::read_from(&guard);
    if opaque.is_root() {
        return Ok(UnlinkOutcome::Declined(guard));
    }

    let Some(parentbuf) = descend(pool, attno, opaque.lokey, level + 1, true)? else {
        return Ok(UnlinkOutcome::Declined(guard));
    };
    let parent_guard = parentbuf.write();
    if !page_is_expected(&parent_guard, attno, opaque.lokey, level + 1) {
        return Ok(UnlinkOutcome::Declined(guard));
    }

    let (idx, left_block) = {
        let page = TreePageRef::new(&parent_guard);
        let Some(i) =
            (0..page.nitems()).find(|&i| InternalItem::decode(page.item(i)).child == buf.block())
        else {
            return Ok(UnlinkOutcome::Declined(guard));
        };
        if i == 0 {
            return Ok(UnlinkOutcome::Declined(guard));
        }
        (i, InternalItem::decode(page.item(i - 1)).child)
    };

    let leftbuf = pool.pin(left_block)?;
    // Locking a child while holding its parent inverts the usual order;
    // never wait here.
    let Some(left_guard) = leftbuf.try_write() else {
        return Ok(UnlinkOutcome::Declined(guard));
    };
    if page_kind(&left_guard) != PageKind::Btree {
        return Ok(UnlinkOutcome::Declined(guard));
    }
    let left_opaque = BtreeOpaque::read_from(&left_guard);
    if left_opaque.attno != attno
        || left_opaque.level != level
        || left_opaque.next != buf.block()
    {
        return Ok(UnlinkOutcome::Declined(guard));
    }

    // The left sibling absorbs the removed page's key range and link.
    let mut left_image = (*left_guard).clone();
    {
        let mut o = left_opaque;
        o.next = opaque.next;
        o.hikey = opaque.hikey;
        o.write_to(&mut left_image);
    }
    let mut parent_image = (*parent_guard).clone();
    TreePage::new(&mut parent_image).remove_item(idx);
    let mut leaf_image = vec![0u8; BLOCK_SIZE];
    init_tag_page(&mut leaf_image, PageKind::Free);

    let mut stack = SplitStack::new();
    stack.push(Buffer::clone(&leftbuf), left_guard, left_image);
    stack.push(Buffer::clone(buf), guard, leaf_image);
    stack.push(parentbuf, parent_guard, parent_image);
    stack.add_freed(buf.block());
    Ok(UnlinkOutcome::Unlinked(stack))
}

/// Rewrites a leaf in place as empty, keeping its identity (keys, links,
/// flags). Used when an unlink is declined.
pub(crate) fn write_empty_leaf(buf: &Buffer, mut guard: PageWriteGuard) {
    let opaque = BtreeOpaque::read_from(&guard);
    init_btree_page(guard.as_mut_slice(), &opaque);
    buf.mark_dirty();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_meta(natts: u32) -> BufferPool {
        let pool = BufferPool::new_in_memory();
        let metabuf = pool.allocate().unwrap();
        {
            let mut g = metabuf.write();
            meta::init_metapage(g.as_mut_slice(), natts);
        }
        metabuf.mark_dirty();
        pool
    }

    #[test]
    fn test_internal_item_round_trip() {
        let item = InternalItem {
            key: Tid::new(0x1234_5678_9ABC),
            child: BlockNumber::new(77),
        };
        assert_eq!(InternalItem::decode(&item.encode()), item);
    }

    #[test]
    fn test_descend_empty_tree() {
        let pool = pool_with_meta(0);
        assert!(descend(&pool, AttrNumber::TID_TREE, Tid::MIN, 0, true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_descend_creates_root_for_writes() {
        let pool = pool_with_meta(0);
        let buf = descend(&pool, AttrNumber::TID_TREE, Tid::MIN, 0, false)
            .unwrap()
            .unwrap();
        let guard = buf.read();
        assert!(page_is_expected(&guard, AttrNumber::TID_TREE, Tid::MIN, 0));
        assert!(page_is_expected(&guard, AttrNumber::TID_TREE, Tid::MAX, 0));
        assert!(!page_is_expected(&guard, AttrNumber::TID_TREE, Tid::MIN, 1));
        assert!(!page_is_expected(&guard, AttrNumber::FIRST, Tid::MIN, 0));
    }

    #[test]
    fn test_binsrch_internal() {
        let pool = pool_with_meta(0);
        let buf = pool.allocate().unwrap();
        let mut guard = buf.write();
        let mut opaque = BtreeOpaque::new_root_leaf(AttrNumber::TID_TREE);
        opaque.level = 1;
        init_btree_page(guard.as_mut_slice(), &opaque);
        {
            let mut page = TreePage::new(guard.as_mut_slice());
            for key in [1u64, 100, 200] {
                let item = InternalItem {
                    key: Tid::new(key),
                    child: BlockNumber::new(key as u32),
                };
                assert!(page.append_item(&item.encode()));
            }
        }
        let page_bytes: &[u8] = &guard;
        let page = TreePageRef::new(page_bytes);
        assert_eq!(binsrch_internal(&page, Tid::new(1)), Some(0));
        assert_eq!(binsrch_internal(&page, Tid::new(99)), Some(0));
        assert_eq!(binsrch_internal(&page, Tid::new(100)), Some(1));
        assert_eq!(binsrch_internal(&page, Tid::new(5000)), Some(2));
    }

    #[test]
    fn test_newroot_updates_metapage() {
        let pool = pool_with_meta(0);
        // Materialize a leaf so the tree exists.
        let leaf = descend(&pool, AttrNumber::TID_TREE, Tid::MIN, 0, false)
            .unwrap()
            .unwrap();
        let downlinks = vec![
            InternalItem {
                key: Tid::MIN,
                child: leaf.block(),
            },
            InternalItem {
                key: Tid::new(1000),
                child: BlockNumber::new(99),
            },
        ];
        let stack = newroot(&pool, AttrNumber::TID_TREE, 1, &downlinks).unwrap();
        stack.apply(&pool);

        let root = meta::btree_root(&pool, AttrNumber::TID_TREE, false)
            .unwrap()
            .unwrap();
        let rootbuf = pool.pin(root).unwrap();
        let guard = rootbuf.read();
        let opaque = BtreeOpaque::read_from(&guard);
        assert!(opaque.is_root());
        assert_eq!(opaque.level, 1);
        assert_eq!(TreePageRef::new(&guard).nitems(), 2);
    }
}
