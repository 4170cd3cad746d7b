//! Attribute-tree scan cursor.
//!
//! Advances lazily in TID order: [`AttrTreeScan::fetch`] serves datums
//! out of the currently decompressed item and loads the next overlapping
//! item only when the requested TID runs past it. The decompressed
//! arrays are owned by the scan; callers copy pass-by-reference datums
//! before the next advance (in practice `Bytes` clones are cheap).

use bytes::Bytes;

use strata_common::error::StrataResult;
use strata_common::types::{AttrNumber, Tid};

use crate::btree::{descend, page_is_expected};
use crate::buffer::Buffer;
use crate::page::{BtreeOpaque, TreePageRef};
use crate::rel::Relation;

use super::PackedAttrItem;

/// A scan over one attribute tree in `[starttid, endtid)`.
pub struct AttrTreeScan<'a> {
    rel: &'a Relation,
    attno: AttrNumber,
    nexttid: Tid,
    endtid: Tid,
    lastbuf: Option<Buffer>,
    active: bool,
    // Decompressed current item, filtered to the scan range.
    tids: Vec<Tid>,
    datums: Vec<Bytes>,
    isnulls: Vec<bool>,
    next_idx: usize,
}

impl<'a> AttrTreeScan<'a> {
    /// Opens a scan of `[starttid, endtid)`.
    pub fn begin(rel: &'a Relation, attno: AttrNumber, starttid: Tid, endtid: Tid) -> Self {
        Self {
            rel,
            attno,
            nexttid: starttid,
            endtid,
            lastbuf: None,
            active: true,
            tids: Vec::new(),
            datums: Vec::new(),
            isnulls: Vec::new(),
            next_idx: 0,
        }
    }

    /// Returns the datum stored at `tid`, or `None` for NULL or absent.
    ///
    /// Calls must use ascending TIDs between resets; that is what the
    /// cross-tree coordinator does, pulling TIDs from the TID tree in
    /// order.
    pub fn fetch(&mut self, tid: Tid) -> StrataResult<Option<Bytes>> {
        loop {
            while self.next_idx < self.tids.len() {
                let cur = self.tids[self.next_idx];
                if cur < tid {
                    self.next_idx += 1;
                    continue;
                }
                if cur == tid {
                    let idx = self.next_idx;
                    self.next_idx += 1;
                    return Ok(if self.isnulls[idx] {
                        None
                    } else {
                        Some(self.datums[idx].clone())
                    });
                }
                // The item skips over `tid`: no value stored.
                return Ok(None);
            }

            if !self.active {
                return Ok(None);
            }
            if tid > self.nexttid {
                self.nexttid = tid;
            }
            if !self.next_array()? {
                return Ok(None);
            }
        }
    }

    /// Loads the next item with elements at or past `nexttid` into the
    /// scan's arrays. Returns false when the range is exhausted.
    pub fn next_array(&mut self) -> StrataResult<bool> {
        if !self.active {
            return Ok(false);
        }
        loop {
            if self.nexttid >= self.endtid {
                self.deactivate();
                return Ok(false);
            }

            let buf = match self.lastbuf.take() {
                Some(buf) => buf,
                None => match descend(self.rel.pool(), self.attno, self.nexttid, 0, true)? {
                    Some(buf) => buf,
                    None => {
                        // Completely empty tree.
                        self.deactivate();
                        return Ok(false);
                    }
                },
            };

            let guard = buf.read();
            if !page_is_expected(&guard, self.attno, self.nexttid, 0) {
                // Concurrently reshaped. Follow the right-link when the
                // page still covers the previous TID, else re-descend.
                let prev = self.nexttid.prev();
                if prev.is_valid() && page_is_expected(&guard, self.attno, prev, 0) {
                    let next = BtreeOpaque::read_from(&guard).next;
                    drop(guard);
                    if next.is_valid() {
                        self.lastbuf = Some(self.rel.pool().pin(next)?);
                        continue;
                    }
                }
                continue;
            }

            let opaque = BtreeOpaque::read_from(&guard);
            let nitems = TreePageRef::new(&guard).nitems();
            let mut loaded = false;
            for i in 0..nitems {
                let packed = PackedAttrItem::decode(TreePageRef::new(&guard).item(i))?;
                if self.nexttid >= packed.end {
                    continue;
                }
                if packed.first >= self.endtid {
                    self.nexttid = self.endtid;
                    break;
                }

                let exploded = packed.explode()?;
                self.tids.clear();
                self.datums.clear();
                self.isnulls.clear();
                for ((tid, datum), isnull) in exploded
                    .tids
                    .into_iter()
                    .zip(exploded.datums)
                    .zip(exploded.isnulls)
                {
                    if tid < self.nexttid || tid >= self.endtid {
                        continue;
                    }
                    self.tids.push(tid);
                    self.datums.push(datum);
                    self.isnulls.push(isnull);
                }
                self.next_idx = 0;

                if let Some(last) = self.tids.last() {
                    self.nexttid = last.next();
                    loaded = true;
                    break;
                }
                // Every element was below nexttid; try the next item.
            }
            if loaded {
                drop(guard);
                self.lastbuf = Some(buf);
                return Ok(true);
            }

            // No more items here; walk right.
            if self.nexttid < opaque.hikey {
                self.nexttid = opaque.hikey;
            }
            let next = opaque.next;
            drop(guard);
            if !next.is_valid() || self.nexttid >= self.endtid {
                self.deactivate();
                return Ok(false);
            }
            self.lastbuf = Some(self.rel.pool().pin(next)?);
        }
    }

    /// Resets the cursor to `starttid`. Rewinding drops the cached
    /// arrays and the page pin; skipping forward is handled lazily by
    /// [`fetch`](Self::fetch).
    pub fn reset(&mut self, starttid: Tid) {
        if starttid < self.nexttid {
            self.tids.clear();
            self.datums.clear();
            self.isnulls.clear();
            self.next_idx = 0;
            self.nexttid = starttid;
            self.lastbuf = None;
            self.active = true;
        }
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.lastbuf = None;
    }
}

impl std::fmt::Debug for AttrTreeScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrTreeScan")
            .field("attno", &self.attno)
            .field("nexttid", &self.nexttid)
            .field("endtid", &self.endtid)
            .field("active", &self.active)
            .finish()
    }
}
