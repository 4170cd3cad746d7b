//! Ordered slotted item storage on a page.
//!
//! Slot `i` always refers to the item with the `i`-th smallest key, so
//! tree code binary-searches slot indexes directly. Inserting at an index
//! shifts the slot array; removing shifts it back and *leaks* the item's
//! bytes until the next repack rewrites the page. Free-space accounting
//! is therefore conservative: a page that reports "full" may still repack
//! into a single page.

use strata_common::constants::{PAGE_HEADER_SIZE, SLOT_SIZE};

use super::header::{PageHeader, PageHeaderRef};

#[inline]
fn slot_offset(idx: usize) -> usize {
    PAGE_HEADER_SIZE + idx * SLOT_SIZE
}

#[inline]
fn read_slot(data: &[u8], idx: usize) -> (usize, usize) {
    let off = slot_offset(idx);
    let item_off = u16::from_le_bytes([data[off], data[off + 1]]) as usize;
    let item_len = u16::from_le_bytes([data[off + 2], data[off + 3]]) as usize;
    (item_off, item_len)
}

#[inline]
fn write_slot(data: &mut [u8], idx: usize, item_off: u16, item_len: u16) {
    let off = slot_offset(idx);
    data[off..off + 2].copy_from_slice(&item_off.to_le_bytes());
    data[off + 2..off + 4].copy_from_slice(&item_len.to_le_bytes());
}

/// Read-only view of a page's item area.
#[derive(Debug)]
pub struct TreePageRef<'a> {
    data: &'a [u8],
}

impl<'a> TreePageRef<'a> {
    /// Creates a read-only view over a page buffer.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_HEADER_SIZE);
        Self { data }
    }

    /// Number of items on the page.
    #[inline]
    pub fn nitems(&self) -> usize {
        PageHeaderRef::new(self.data).nslots() as usize
    }

    /// Free space between the slot array and the item data.
    #[inline]
    pub fn free_space(&self) -> usize {
        PageHeaderRef::new(self.data).free_space()
    }

    /// Returns the bytes of item `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn item(&self, idx: usize) -> &'a [u8] {
        assert!(idx < self.nitems(), "item index out of bounds");
        let (off, len) = read_slot(self.data, idx);
        &self.data[off..off + len]
    }

    /// Iterates over all items in slot order.
    pub fn items(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.nitems()).map(move |i| self.item(i))
    }
}

/// Mutable view of a page's item area.
#[derive(Debug)]
pub struct TreePage<'a> {
    data: &'a mut [u8],
}

impl<'a> TreePage<'a> {
    /// Creates a mutable view over a page buffer.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_HEADER_SIZE);
        Self { data }
    }

    /// Number of items on the page.
    #[inline]
    pub fn nitems(&self) -> usize {
        PageHeaderRef::new(self.data).nslots() as usize
    }

    /// Free space between the slot array and the item data.
    #[inline]
    pub fn free_space(&self) -> usize {
        PageHeaderRef::new(self.data).free_space()
    }

    /// True if an item of `bytes` length (plus its slot) fits.
    #[inline]
    pub fn can_fit(&self, bytes: usize) -> bool {
        self.free_space() >= bytes + SLOT_SIZE
    }

    /// Returns the bytes of item `idx`.
    pub fn item(&self, idx: usize) -> &[u8] {
        assert!(idx < self.nitems(), "item index out of bounds");
        let (off, len) = read_slot(self.data, idx);
        &self.data[off..off + len]
    }

    /// Inserts an item so that it becomes item `idx`, shifting later
    /// slots right. Returns false (page unchanged) if it does not fit.
    pub fn insert_item(&mut self, idx: usize, item: &[u8]) -> bool {
        let n = self.nitems();
        assert!(idx <= n, "insert index out of bounds");
        if item.len() > u16::MAX as usize || !self.can_fit(item.len()) {
            return false;
        }

        let hdr = PageHeaderRef::new(self.data);
        let lower = hdr.lower() as usize;
        let upper = hdr.upper() as usize;

        // Item bytes grow down from `upper`.
        let new_upper = upper - item.len();
        self.data[new_upper..upper].copy_from_slice(item);

        // Open a hole in the slot array.
        let start = slot_offset(idx);
        let end = slot_offset(n);
        self.data.copy_within(start..end, start + SLOT_SIZE);
        write_slot(self.data, idx, new_upper as u16, item.len() as u16);

        let mut hdr = PageHeader::new(self.data);
        hdr.set_lower((lower + SLOT_SIZE) as u16);
        hdr.set_upper(new_upper as u16);
        hdr.set_nslots((n + 1) as u16);
        true
    }

    /// Appends an item after the current last one.
    #[inline]
    pub fn append_item(&mut self, item: &[u8]) -> bool {
        self.insert_item(self.nitems(), item)
    }

    /// Removes item `idx`, shifting later slots left. The item's bytes
    /// stay as dead space until the page is repacked.
    pub fn remove_item(&mut self, idx: usize) {
        let n = self.nitems();
        assert!(idx < n, "remove index out of bounds");

        let start = slot_offset(idx + 1);
        let end = slot_offset(n);
        self.data.copy_within(start..end, slot_offset(idx));

        let lower = PageHeaderRef::new(self.data).lower() as usize;
        let mut hdr = PageHeader::new(self.data);
        hdr.set_lower((lower - SLOT_SIZE) as u16);
        hdr.set_nslots((n - 1) as u16);
    }
}
