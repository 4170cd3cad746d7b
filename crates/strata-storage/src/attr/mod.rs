//! Attribute trees: one B-tree of column values per attribute.
//!
//! Leaf items are [`PackedAttrItem`]s covering disjoint TID ranges. A
//! given TID appears in at most one item; a TID with no element reads
//! back as NULL. Insertion resolves range overlaps by splitting items in
//! memory; vacuum explodes affected items and drops the dead TIDs; both
//! paths hand the resulting item list to the repacker, which merges
//! undersized neighbors and re-attempts compression.

mod item;
pub mod scan;

pub use item::{
    build_items, AttrItem, AttrItemFlags, ExplodedItem, PackedAttrItem,
    ATTR_ITEM_HEADER_SIZE, MAX_ATTR_ITEM_SIZE, MAX_DATUM_SIZE,
};
pub use scan::AttrTreeScan;

use std::collections::{BTreeSet, VecDeque};

use bytes::Bytes;

use strata_common::constants::SLOT_SIZE;
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::{AttrNumber, BlockNumber, Tid};
use strata_common::EngineConfig;

use crate::btree::repack::RepackContext;
use crate::btree::{
    descend, descend_and_lock_exclusive, page_is_expected, unlink_page, write_empty_leaf,
    UnlinkOutcome,
};
use crate::buffer::{Buffer, PageWriteGuard};
use crate::page::{BtreeOpaque, TreePage, TreePageRef};
use crate::rel::Relation;

/// Largest number of new items handed to one `add_items` call. Bounds
/// the downlink fan-out of a single leaf rewrite; larger batches simply
/// re-descend per slice.
const ADD_ITEMS_BATCH: usize = 64;

fn check_attno(rel: &Relation, attno: AttrNumber) -> StrataResult<()> {
    let n = rel.natts() as u16;
    if attno.is_tid_tree() || attno.as_u16() > n {
        return Err(StrataError::invalid_argument(format!(
            "attribute {attno} is not a column of this relation"
        )));
    }
    Ok(())
}

/// Inserts a batch of values (ascending TIDs) into an attribute tree.
///
/// The batch may span leaf boundaries: each round descends to the first
/// pending TID, takes the items that fall inside that leaf's key range
/// (splitting an item that straddles the high key), and hands them to
/// `add_items`.
pub fn multi_insert(
    rel: &Relation,
    attno: AttrNumber,
    tids: &[Tid],
    datums: &[Bytes],
    isnulls: &[bool],
) -> StrataResult<()> {
    check_attno(rel, attno)?;
    if tids.is_empty() {
        return Ok(());
    }
    if tids.len() != datums.len() || tids.len() != isnulls.len() {
        return Err(StrataError::invalid_argument(
            "tids, datums, and isnulls must have equal lengths",
        ));
    }

    let mut queue: VecDeque<AttrItem> =
        build_items(rel.config(), tids, datums, isnulls)?.into();
    while !queue.is_empty() {
        let first = queue.front().expect("queue is non-empty").first();
        let (buf, guard) = descend_and_lock_exclusive(rel.pool(), attno, first, 0)?;
        let hikey = BtreeOpaque::read_from(&guard).hikey;

        let mut batch = Vec::new();
        while let Some(item) = queue.pop_front() {
            if item.end() <= hikey {
                batch.push(item);
                if batch.len() >= ADD_ITEMS_BATCH {
                    break;
                }
            } else if item.first() < hikey {
                // Straddles the leaf boundary: the left half goes here,
                // the rest waits for the next descent.
                let (left, right) = item.split_at(hikey)?;
                if !left.is_empty() {
                    batch.push(AttrItem::Exploded(left));
                }
                if !right.is_empty() {
                    queue.push_front(AttrItem::Exploded(right));
                }
                break;
            } else {
                queue.push_front(item);
                break;
            }
        }
        if batch.is_empty() {
            // Descent guarantees first < hikey, so the first item always
            // contributes at least its left half.
            return Err(StrataError::internal(format!(
                "attribute insert made no progress at tid {first}"
            )));
        }
        add_items(rel, attno, buf, guard, batch)?;
    }
    Ok(())
}

/// Adds new items to a leaf, resolving overlaps with existing items.
///
/// The common case - new items strictly past everything on the page,
/// fitting in free space - appends in place. Anything else goes through
/// the lockstep overlap merge and the repacker.
fn add_items(
    rel: &Relation,
    attno: AttrNumber,
    buf: Buffer,
    mut guard: PageWriteGuard,
    newitems: Vec<AttrItem>,
) -> StrataResult<()> {
    debug_assert!(!newitems.is_empty());

    let last_existing_end = {
        let page = TreePageRef::new(&guard);
        if page.nitems() == 0 {
            Tid::INVALID
        } else {
            PackedAttrItem::decode(page.item(page.nitems() - 1))?.end
        }
    };

    if newitems[0].first() >= last_existing_end {
        let growth = newitems.iter().fold(0usize, |acc, item| {
            acc.saturating_add(match item {
                AttrItem::Packed(p) => p.encoded_len() + SLOT_SIZE,
                // Exploded items never take the in-place path.
                AttrItem::Exploded(_) => usize::MAX / 2,
            })
        });
        if growth <= TreePageRef::new(&guard).free_space() {
            let mut page = TreePage::new(guard.as_mut_slice());
            for item in &newitems {
                if let AttrItem::Packed(packed) = item {
                    let ok = page.append_item(&packed.encode());
                    debug_assert!(ok);
                }
            }
            buf.mark_dirty();
            return Ok(());
        }
    }

    let old_items = {
        let page = TreePageRef::new(&guard);
        let mut items = Vec::with_capacity(page.nitems());
        for i in 0..page.nitems() {
            items.push(PackedAttrItem::decode(page.item(i))?);
        }
        items
    };
    let merged = merge_overlapping(attno, buf.block(), old_items, newitems)?;
    repack_replace(rel, attno, buf, guard, merged)
}

/// The five-case lockstep merge of old and new item streams.
///
/// Items are emitted in TID order; an overlap splits whichever item
/// starts first at the other's first TID; two items starting at the same
/// TID mean the attribute already has a value there, which is fatal.
fn merge_overlapping(
    attno: AttrNumber,
    block: BlockNumber,
    old: Vec<PackedAttrItem>,
    new: Vec<AttrItem>,
) -> StrataResult<Vec<AttrItem>> {
    let mut old_queue: VecDeque<AttrItem> = old.into_iter().map(AttrItem::Packed).collect();
    let mut new_queue: VecDeque<AttrItem> = new.into();
    let mut old_cur = old_queue.pop_front();
    let mut new_cur = new_queue.pop_front();
    let mut result = Vec::new();

    loop {
        match (new_cur.take(), old_cur.take()) {
            (None, None) => break,
            (Some(n), None) => {
                result.push(n);
                new_cur = new_queue.pop_front();
            }
            (None, Some(o)) => {
                result.push(o);
                old_cur = old_queue.pop_front();
            }
            (Some(n), Some(o)) => {
                if n.first() == o.first() {
                    return Err(StrataError::DuplicateAttrValue {
                        attno,
                        tid: n.first(),
                        block,
                    });
                }
                if n.end() <= o.first() {
                    result.push(n);
                    new_cur = new_queue.pop_front();
                    old_cur = Some(o);
                } else if o.end() <= n.first() {
                    result.push(o);
                    old_cur = old_queue.pop_front();
                    new_cur = Some(n);
                } else if n.first() < o.first() {
                    let (left, right) = n.split_at(o.first())?;
                    if !left.is_empty() {
                        result.push(AttrItem::Exploded(left));
                    }
                    new_cur = if right.is_empty() {
                        new_queue.pop_front()
                    } else {
                        Some(AttrItem::Exploded(right))
                    };
                    old_cur = Some(o);
                } else {
                    let (left, right) = o.split_at(n.first())?;
                    if !left.is_empty() {
                        result.push(AttrItem::Exploded(left));
                    }
                    old_cur = if right.is_empty() {
                        old_queue.pop_front()
                    } else {
                        Some(AttrItem::Exploded(right))
                    };
                    new_cur = Some(n);
                }
            }
        }
    }
    Ok(result)
}

/// Merges undersized neighbors and packs everything for storage.
/// Compression is per item, never spanning item boundaries.
fn recompress_items(
    config: &EngineConfig,
    items: Vec<AttrItem>,
) -> StrataResult<Vec<PackedAttrItem>> {
    let mut out = Vec::new();
    let mut pending: Option<ExplodedItem> = None;

    for item in items {
        let small = match &item {
            AttrItem::Exploded(_) => true,
            AttrItem::Packed(packed) => {
                (packed.datasz as usize) < config.attr_item_target_size / 2
            }
        };
        if !small {
            if let Some(p) = pending.take() {
                out.push(p.pack(config));
            }
            match item {
                AttrItem::Packed(packed) => out.push(packed),
                AttrItem::Exploded(_) => unreachable!("exploded items are always small"),
            }
            continue;
        }

        let exploded = item.explode()?;
        if exploded.is_empty() {
            continue;
        }
        match pending.take() {
            None => pending = Some(exploded),
            Some(mut p) => {
                if p.payload_estimate() + exploded.payload_estimate()
                    <= config.attr_item_target_size
                    && p.len() + exploded.len() <= u16::MAX as usize
                {
                    p.extend(exploded);
                    pending = Some(p);
                } else {
                    out.push(p.pack(config));
                    pending = Some(exploded);
                }
            }
        }
    }
    if let Some(p) = pending {
        out.push(p.pack(config));
    }
    Ok(out)
}

/// Rewrites a leaf with `items` as its new content.
fn repack_replace(
    rel: &Relation,
    attno: AttrNumber,
    buf: Buffer,
    guard: PageWriteGuard,
    items: Vec<AttrItem>,
) -> StrataResult<()> {
    debug_assert!(items
        .windows(2)
        .all(|w| w[0].end() <= w[1].first()));

    let packed = recompress_items(rel.config(), items)?;
    if packed.is_empty() {
        write_empty_leaf(&buf, guard);
        return Ok(());
    }

    let opaque = BtreeOpaque::read_from(&guard);
    let total: usize = packed
        .iter()
        .map(|item| item.encoded_len() + SLOT_SIZE)
        .sum();
    let mut cxt = RepackContext::new(
        attno,
        0,
        opaque.lokey,
        opaque.hikey,
        opaque.is_root(),
        total,
    );
    for item in &packed {
        cxt.add_item(item.first, &item.encode())?;
    }
    let stack = cxt.finish(rel.pool(), buf, guard, opaque.next)?;
    stack.apply(rel.pool());
    Ok(())
}

/// Removes the datums for the given TIDs (vacuum).
///
/// Items disjoint from the target set are kept untouched; the rest are
/// exploded, filtered, and re-emitted. A target TID with no stored datum
/// only warns: an earlier interrupted vacuum may already have removed
/// it. Leaves left empty are unlinked.
pub fn remove(rel: &Relation, attno: AttrNumber, targets: &BTreeSet<Tid>) -> StrataResult<()> {
    check_attno(rel, attno)?;
    let mut iter = targets.iter().copied();
    let Some(mut nexttid) = iter.next() else {
        return Ok(());
    };

    loop {
        let (buf, guard) = descend_and_lock_exclusive(rel.pool(), attno, nexttid, 0)?;
        let opaque = BtreeOpaque::read_from(&guard);
        let hikey = opaque.hikey;
        let mut target = Some(nexttid);
        let mut newitems: Vec<AttrItem> = Vec::new();

        {
            let page = TreePageRef::new(&guard);
            for i in 0..page.nitems() {
                let packed = PackedAttrItem::decode(page.item(i))?;

                while let Some(t) = target {
                    if t < packed.first {
                        tracing::warn!(%attno, tid = %t, "no attribute data for dead tid");
                        target = iter.next();
                    } else {
                        break;
                    }
                }

                let item_end = packed.end;
                if target.map_or(true, |t| t >= item_end) {
                    newitems.push(AttrItem::Packed(packed));
                    continue;
                }

                let mut doomed = BTreeSet::new();
                while let Some(t) = target {
                    if t < item_end {
                        doomed.insert(t);
                        target = iter.next();
                    } else {
                        break;
                    }
                }
                if let Some(rest) = packed.explode()?.remove_tids(&doomed) {
                    newitems.push(AttrItem::Exploded(rest));
                }
            }
        }

        while let Some(t) = target {
            if t < hikey {
                tracing::warn!(%attno, tid = %t, "no attribute data for dead tid");
                target = iter.next();
            } else {
                break;
            }
        }

        if newitems.is_empty() {
            match unlink_page(rel.pool(), attno, &buf, guard, 0)? {
                UnlinkOutcome::Unlinked(stack) => stack.apply(rel.pool()),
                UnlinkOutcome::Declined(guard) => write_empty_leaf(&buf, guard),
            }
        } else {
            repack_replace(rel, attno, buf, guard, newitems)?;
        }

        match target {
            Some(t) => nexttid = t,
            None => break,
        }
    }
    Ok(())
}

/// Point lookup: the datum stored for `tid`, or `None` for NULL/absent.
pub fn fetch(rel: &Relation, attno: AttrNumber, tid: Tid) -> StrataResult<Option<Bytes>> {
    check_attno(rel, attno)?;
    for _ in 0..64 {
        let Some(buf) = descend(rel.pool(), attno, tid, 0, true)? else {
            return Ok(None);
        };
        let guard = buf.read();
        if !page_is_expected(&guard, attno, tid, 0) {
            continue;
        }
        let page = TreePageRef::new(&guard);
        for i in 0..page.nitems() {
            let packed = PackedAttrItem::decode(page.item(i))?;
            if tid < packed.first {
                break;
            }
            if tid < packed.end {
                let exploded = packed.explode()?;
                if let Ok(pos) = exploded.tids.binary_search(&tid) {
                    if exploded.isnulls[pos] {
                        return Ok(None);
                    }
                    return Ok(Some(exploded.datums[pos].clone()));
                }
                return Ok(None);
            }
        }
        return Ok(None);
    }
    Err(StrataError::corruption(format!(
        "could not obtain a stable page for tid {tid} in attribute {attno}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rel::Relation;
    use crate::table::ColumnMeta;

    fn test_rel() -> Relation {
        Relation::create(vec![ColumnMeta::new("c1")], EngineConfig::default()).unwrap()
    }

    fn datum(i: u64) -> Bytes {
        Bytes::from(i.to_le_bytes().to_vec())
    }

    fn insert_range(rel: &Relation, range: std::ops::Range<u64>) {
        let tids: Vec<Tid> = range.clone().map(Tid::new).collect();
        let datums: Vec<Bytes> = range.map(datum).collect();
        let isnulls = vec![false; tids.len()];
        multi_insert(rel, AttrNumber::FIRST, &tids, &datums, &isnulls).unwrap();
    }

    #[test]
    fn test_insert_fetch_round_trip() {
        let rel = test_rel();
        insert_range(&rel, 1..11);

        for i in 1..11u64 {
            assert_eq!(
                fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(),
                Some(datum(i))
            );
        }
        // Absent TID reads as NULL.
        assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(99)).unwrap(), None);
    }

    #[test]
    fn test_null_storage() {
        let rel = test_rel();
        multi_insert(
            &rel,
            AttrNumber::FIRST,
            &[Tid::new(1), Tid::new(2)],
            &[Bytes::new(), datum(2)],
            &[true, false],
        )
        .unwrap();

        assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(1)).unwrap(), None);
        assert_eq!(
            fetch(&rel, AttrNumber::FIRST, Tid::new(2)).unwrap(),
            Some(datum(2))
        );
    }

    #[test]
    fn test_duplicate_tid_is_fatal() {
        let rel = test_rel();
        insert_range(&rel, 1..6);
        let err = multi_insert(
            &rel,
            AttrNumber::FIRST,
            &[Tid::new(3)],
            &[datum(3)],
            &[false],
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::DuplicateAttrValue { .. }));
    }

    #[test]
    fn test_out_of_order_insert_with_gap() {
        let rel = test_rel();
        // Leave a hole [6, 10], then fill part of it.
        insert_range(&rel, 1..6);
        insert_range(&rel, 11..16);
        insert_range(&rel, 7..9);

        for i in (1..6).chain(7..9).chain(11..16) {
            assert_eq!(
                fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(),
                Some(datum(i)),
                "tid {i}"
            );
        }
        assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(6)).unwrap(), None);
        assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(10)).unwrap(), None);
    }

    #[test]
    fn test_remove_preserves_rest() {
        let rel = test_rel();
        insert_range(&rel, 1..21);

        let targets: BTreeSet<Tid> = (5..15).map(Tid::new).collect();
        remove(&rel, AttrNumber::FIRST, &targets).unwrap();

        for i in 1..5u64 {
            assert_eq!(
                fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(),
                Some(datum(i))
            );
        }
        for i in 5..15u64 {
            assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(), None);
        }
        for i in 15..21u64 {
            assert_eq!(
                fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(),
                Some(datum(i))
            );
        }
    }

    #[test]
    fn test_remove_missing_tid_warns_only() {
        let rel = test_rel();
        insert_range(&rel, 1..6);
        let targets: BTreeSet<Tid> = [Tid::new(3), Tid::new(100)].into_iter().collect();
        remove(&rel, AttrNumber::FIRST, &targets).unwrap();
        assert_eq!(fetch(&rel, AttrNumber::FIRST, Tid::new(3)).unwrap(), None);
    }

    #[test]
    fn test_large_insert_splits_pages() {
        let rel = test_rel();
        let n = 4000u64;
        let tids: Vec<Tid> = (1..=n).map(Tid::new).collect();
        let datums: Vec<Bytes> = (1..=n).map(|i| Bytes::from(vec![(i % 251) as u8; 16])).collect();
        let isnulls = vec![false; n as usize];
        multi_insert(&rel, AttrNumber::FIRST, &tids, &datums, &isnulls).unwrap();

        assert!(rel.pool().nblocks() > 2);
        for i in [1u64, n / 2, n] {
            assert_eq!(
                fetch(&rel, AttrNumber::FIRST, Tid::new(i)).unwrap(),
                Some(Bytes::from(vec![(i % 251) as u8; 16])),
                "tid {i}"
            );
        }
    }

    #[test]
    fn test_tid_tree_attno_rejected() {
        let rel = test_rel();
        assert!(multi_insert(&rel, AttrNumber::TID_TREE, &[], &[], &[]).is_err());
        assert!(fetch(&rel, AttrNumber::new(5), Tid::MIN).is_err());
    }
}
