//! The repacker: rewrites one leaf's items into a chain of new pages.
//!
//! Both trees feed their (ordered, non-overlapping) item lists through a
//! [`RepackContext`]: items are laid onto fresh page images, a new page
//! opening whenever the current one reaches its planned fill; the first
//! image replaces the original buffer and the rest get newly allocated
//! blocks. Downlinks for the new pages batch into `insert_downlinks`, or
//! into `newroot` when the original page was the root.
//!
//! Split sizing: everything on one page when it fits. Otherwise, if the
//! original page is the rightmost of its tree, ~90% of the leftover free
//! space is left on the tail page (append-heavy workloads will fill it)
//! by reserving only a small slice on the earlier pages; anywhere else
//! the leftover spreads evenly.

use strata_common::constants::{RIGHTMOST_SPLIT_FREE_FRACTION, SLOT_SIZE};
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, BlockNumber, Tid};

use crate::buffer::{Buffer, BufferPool, PageWriteGuard};
use crate::page::{
    init_btree_page, BtreeFlags, BtreeOpaque, TreePage, TreePageRef, BLOCK_SIZE,
    EMPTY_TREE_PAGE_SPACE,
};

use super::splitstack::SplitStack;
use super::{insert_downlinks, newroot, InternalItem};

/// Builds the replacement page chain for one leaf (or internal) rewrite.
pub(crate) struct RepackContext {
    attno: AttrNumber,
    level: u16,
    hikey: Tid,
    old_lokey: Tid,
    was_root: bool,
    reserve: usize,
    images: Vec<Vec<u8>>,
    first_keys: Vec<Tid>,
}

impl RepackContext {
    /// Starts a rewrite of a page with the given identity.
    ///
    /// `total_bytes` is the encoded size of all items *including* their
    /// slot cost; it drives the split plan.
    pub fn new(
        attno: AttrNumber,
        level: u16,
        lokey: Tid,
        hikey: Tid,
        was_root: bool,
        total_bytes: usize,
    ) -> Self {
        let space = EMPTY_TREE_PAGE_SPACE;
        let num_pages = total_bytes.div_ceil(space).max(1);
        let reserve = if num_pages == 1 {
            0
        } else if hikey == Tid::MAX_PLUS_ONE {
            // Rightmost page: reserve only a sliver on the earlier pages,
            // leaving the bulk of the free space at the tail.
            let total_free = (space * num_pages - total_bytes) as f64;
            (total_free * RIGHTMOST_SPLIT_FREE_FRACTION / (num_pages - 1) as f64) as usize
        } else {
            (space * num_pages - total_bytes) / num_pages
        };

        let mut cxt = Self {
            attno,
            level,
            hikey,
            old_lokey: lokey,
            was_root,
            reserve,
            images: Vec::new(),
            first_keys: Vec::new(),
        };
        cxt.open_page(lokey, was_root);
        cxt
    }

    fn open_page(&mut self, first_key: Tid, root: bool) {
        if let Some(prev) = self.images.last_mut() {
            let mut opaque = BtreeOpaque::read_from(prev);
            opaque.hikey = first_key;
            opaque.write_to(prev);
        }
        let mut image = vec![0u8; BLOCK_SIZE];
        init_btree_page(
            &mut image,
            &BtreeOpaque {
                attno: self.attno,
                flags: if root { BtreeFlags::ROOT } else { BtreeFlags::empty() },
                next: BlockNumber::INVALID,
                lokey: first_key,
                hikey: self.hikey,
                level: self.level,
            },
        );
        self.images.push(image);
        self.first_keys.push(first_key);
    }

    /// Adds the next item (in key order). Opens a new page when the
    /// current one is full or has only its planned reserve left.
    pub fn add_item(&mut self, first_key: Tid, item: &[u8]) -> StrataResult<()> {
        let need = item.len() + SLOT_SIZE;
        let free = TreePageRef::new(self.images.last().expect("context has a page")).free_space();
        if free < need || free < self.reserve {
            self.open_page(first_key, false);
        }
        let image = self.images.last_mut().expect("context has a page");
        if !TreePage::new(image).append_item(item) {
            return Err(StrataError::internal(format!(
                "item of {} bytes does not fit on an empty page",
                item.len()
            )));
        }
        Ok(())
    }

    /// Assigns buffers, chains right-links, inserts downlinks (or grows a
    /// new root), and returns the complete stack. The caller applies it.
    pub fn finish(
        self,
        pool: &BufferPool,
        oldbuf: Buffer,
        old_guard: PageWriteGuard,
        orig_next: BlockNumber,
    ) -> StrataResult<SplitStack> {
        let mut images = self.images;
        let npages = images.len();

        // First page writes over the old buffer; the rest get fresh,
        // exclusively locked buffers, allocated before anything is
        // overwritten so allocation failure leaves the tree untouched.
        let mut bufs = vec![oldbuf];
        let mut guards = vec![old_guard];
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
                orig_next
            };
            let mut opaque = BtreeOpaque::read_from(&images[i]);
            opaque.next = next;
            opaque.write_to(&mut images[i]);
        }

        let upper = if npages > 1 {
            let downlinks: Vec<InternalItem> = (1..npages)
                .map(|i| InternalItem {
                    key: self.first_keys[i],
                    child: bufs[i].block(),
                })
                .collect();
            if self.was_root {
                // The old root is root no longer.
                let mut opaque = BtreeOpaque::read_from(&images[0]);
                opaque.flags.remove(BtreeFlags::ROOT);
                opaque.write_to(&mut images[0]);

                let mut all = vec![InternalItem {
                    key: self.first_keys[0],
                    child: bufs[0].block(),
                }];
                all.extend(downlinks);
                newroot(pool, self.attno, self.level + 1, &all)?
            } else {
                insert_downlinks(
                    pool,
                    self.attno,
                    self.old_lokey,
                    bufs[0].block(),
                    self.level + 1,
                    downlinks,
                )?
            }
        } else {
            SplitStack::new()
        };

        let mut stack = SplitStack::new();
        for ((buf, guard), image) in bufs.into_iter().zip(guards).zip(images) {
            stack.push(buf, guard, image);
        }
        stack.append(upper);
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::descend;
    use crate::meta;

    fn pool_with_tree() -> (BufferPool, Buffer) {
        let pool = BufferPool::new_in_memory();
        let metabuf = pool.allocate().unwrap();
        {
            let mut g = metabuf.write();
            meta::init_metapage(g.as_mut_slice(), 0);
        }
        let leaf = descend(&pool, AttrNumber::TID_TREE, Tid::MIN, 0, false)
            .unwrap()
            .unwrap();
        (pool, leaf)
    }

    #[test]
    fn test_single_page_rewrite() {
        let (pool, leaf) = pool_with_tree();
        let guard = leaf.write();
        let opaque = BtreeOpaque::read_from(&guard);

        let items: Vec<[u8; 16]> = (0..10u64)
            .map(|i| {
                let mut b = [0u8; 16];
                b[..8].copy_from_slice(&(i + 1).to_le_bytes());
                b
            })
            .collect();
        let total = items.len() * (16 + SLOT_SIZE);
        let mut cxt = RepackContext::new(
            AttrNumber::TID_TREE,
            0,
            opaque.lokey,
            opaque.hikey,
            opaque.is_root(),
            total,
        );
        for (i, item) in items.iter().enumerate() {
            cxt.add_item(Tid::new(i as u64 + 1), item).unwrap();
        }
        let stack = cxt.finish(&pool, Buffer::clone(&leaf), guard, opaque.next).unwrap();
        assert_eq!(stack.len(), 1);
        stack.apply(&pool);

        let guard = leaf.read();
        assert_eq!(TreePageRef::new(&guard).nitems(), 10);
        let reread = BtreeOpaque::read_from(&guard);
        assert!(reread.is_root());
        assert_eq!(reread.hikey, Tid::MAX_PLUS_ONE);
    }

    #[test]
    fn test_multi_page_split_grows_root() {
        let (pool, leaf) = pool_with_tree();
        let guard = leaf.write();
        let opaque = BtreeOpaque::read_from(&guard);

        // Enough 512-byte items to need three pages.
        let item = [0u8; 512];
        let count = 3 * (EMPTY_TREE_PAGE_SPACE / (512 + SLOT_SIZE));
        let total = count * (512 + SLOT_SIZE);
        let mut cxt = RepackContext::new(
            AttrNumber::TID_TREE,
            0,
            opaque.lokey,
            opaque.hikey,
            opaque.is_root(),
            total,
        );
        for i in 0..count {
            cxt.add_item(Tid::new(i as u64 + 1), &item).unwrap();
        }
        let stack = cxt.finish(&pool, Buffer::clone(&leaf), guard, opaque.next).unwrap();
        stack.apply(&pool);

        // The old leaf lost its ROOT flag; a new root took over.
        let root = meta::btree_root(&pool, AttrNumber::TID_TREE, false)
            .unwrap()
            .unwrap();
        assert_ne!(root, leaf.block());
        {
            let guard = leaf.read();
            assert!(!BtreeOpaque::read_from(&guard).is_root());
        }

        // Walking right-links visits every item exactly once, in order.
        let mut seen = 0usize;
        let mut block = leaf.block();
        let mut last_hikey = Tid::MIN;
        loop {
            let buf = pool.pin(block).unwrap();
            let guard = buf.read();
            let op = BtreeOpaque::read_from(&guard);
            assert_eq!(op.lokey, last_hikey.max(Tid::MIN));
            seen += TreePageRef::new(&guard).nitems();
            last_hikey = op.hikey;
            if !op.next.is_valid() {
                break;
            }
            block = op.next;
        }
        assert_eq!(seen, count);
        assert_eq!(last_hikey, Tid::MAX_PLUS_ONE);
    }

    #[test]
    fn test_rightmost_split_reserves_tail_space() {
        let (pool, leaf) = pool_with_tree();
        let guard = leaf.write();
        let opaque = BtreeOpaque::read_from(&guard);

        let item = [0u8; 256];
        let per = 256 + SLOT_SIZE;
        let count = 2 * (EMPTY_TREE_PAGE_SPACE / per);
        let mut cxt = RepackContext::new(
            AttrNumber::TID_TREE,
            0,
            opaque.lokey,
            opaque.hikey,
            opaque.is_root(),
            count * per,
        );
        for i in 0..count {
            cxt.add_item(Tid::new(i as u64 + 1), &item).unwrap();
        }
        let stack = cxt.finish(&pool, Buffer::clone(&leaf), guard, opaque.next).unwrap();
        stack.apply(&pool);

        // The non-last page is nearly full; the tail page keeps the bulk
        // of the free space.
        let first_free = TreePageRef::new(&leaf.read()).free_space();
        assert!(first_free < EMPTY_TREE_PAGE_SPACE / 4);
    }
}
