//! Attribute array items: (TID, datum) arrays over a contiguous range.
//!
//! The on-disk form is [`PackedAttrItem`]: a fixed header plus a payload
//! holding the element TIDs, an optional null bitmap, and the datum
//! bytes, the whole payload LZ-compressed when that wins. During repack
//! and overlap resolution items live as [`ExplodedItem`]s - parallel
//! `tids[] / datums[] / isnulls[]` vectors that never reach a page.
//!
//! # Packed encoding
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   first tid
//!   8       8   end tid (exclusive)
//!  16       2   nelements
//!  18       2   flags (COMPRESSED, HAS_NULLS)
//!  20       4   uncompressed payload size
//!  24       -   payload
//! ```
//!
//! Payload (uncompressed form): `nelements` u64 TIDs, the null bitmap if
//! HAS_NULLS, `nelements` u32 datum lengths, then the datum bytes.

use bitflags::bitflags;
use bytes::Bytes;

use strata_common::constants::{
    BTREE_OPAQUE_SIZE, MIN_COMPRESS_SIZE, PAGE_HEADER_SIZE, SLOT_SIZE,
};
use strata_common::error::{StrataError, StrataResult};
use strata_common::types::Tid;
use strata_common::EngineConfig;

use crate::compress;
use crate::page::BLOCK_SIZE;

/// Size of the packed item header.
pub const ATTR_ITEM_HEADER_SIZE: usize = 24;

/// Largest encoded item that fits on an empty page.
pub const MAX_ATTR_ITEM_SIZE: usize =
    BLOCK_SIZE - PAGE_HEADER_SIZE - BTREE_OPAQUE_SIZE - SLOT_SIZE;

/// Largest storable datum. Anything bigger would need out-of-line
/// storage, which this engine does not implement.
pub const MAX_DATUM_SIZE: usize = MAX_ATTR_ITEM_SIZE - ATTR_ITEM_HEADER_SIZE - 8 - 4 - 1;

bitflags! {
    /// Flags on a packed attribute item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrItemFlags: u16 {
        /// The payload is LZ-compressed.
        const COMPRESSED = 0x0001;
        /// The payload carries a null bitmap.
        const HAS_NULLS = 0x0002;
    }
}

/// The on-disk attribute item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedAttrItem {
    /// First TID covered by the item.
    pub first: Tid,
    /// Exclusive end of the covered range.
    pub end: Tid,
    /// Number of elements actually present in the range.
    pub nelements: u16,
    /// Item flags.
    pub flags: AttrItemFlags,
    /// Uncompressed payload size.
    pub datasz: u32,
    /// Payload, possibly compressed.
    pub payload: Bytes,
}

impl PackedAttrItem {
    /// Size of the item as stored on a page.
    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ATTR_ITEM_HEADER_SIZE + self.payload.len()
    }

    /// Encodes the item for on-page storage.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.first.to_le_bytes());
        bytes.extend_from_slice(&self.end.to_le_bytes());
        bytes.extend_from_slice(&self.nelements.to_le_bytes());
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());
        bytes.extend_from_slice(&self.datasz.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decodes an item from its on-page bytes.
    pub fn decode(bytes: &[u8]) -> StrataResult<Self> {
        if bytes.len() < ATTR_ITEM_HEADER_SIZE {
            return Err(StrataError::corruption("attribute item too short"));
        }
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[0..8]);
        let first = Tid::from_le_bytes(u64buf);
        u64buf.copy_from_slice(&bytes[8..16]);
        let end = Tid::from_le_bytes(u64buf);
        let nelements = u16::from_le_bytes([bytes[16], bytes[17]]);
        let raw_flags = u16::from_le_bytes([bytes[18], bytes[19]]);
        let Some(flags) = AttrItemFlags::from_bits(raw_flags) else {
            return Err(StrataError::corruption(format!(
                "unknown attribute item flags {raw_flags:#06x}"
            )));
        };
        let datasz = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        if nelements == 0 || first >= end {
            return Err(StrataError::corruption(
                "attribute item with empty range",
            ));
        }
        Ok(Self {
            first,
            end,
            nelements,
            flags,
            datasz,
            payload: Bytes::copy_from_slice(&bytes[ATTR_ITEM_HEADER_SIZE..]),
        })
    }

    /// Expands the item into its in-memory form, decompressing if needed.
    pub fn explode(&self) -> StrataResult<ExplodedItem> {
        let plain;
        let payload: &[u8] = if self.flags.contains(AttrItemFlags::COMPRESSED) {
            plain = compress::decompress(&self.payload, self.datasz as usize)?;
            &plain
        } else {
            &self.payload
        };

        let n = self.nelements as usize;
        let bitmap_len = if self.flags.contains(AttrItemFlags::HAS_NULLS) {
            n.div_ceil(8)
        } else {
            0
        };
        let lens_off = n * 8 + bitmap_len;
        let data_off = lens_off + n * 4;
        if payload.len() < data_off {
            return Err(StrataError::corruption("attribute item payload truncated"));
        }

        let mut tids = Vec::with_capacity(n);
        for i in 0..n {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&payload[i * 8..i * 8 + 8]);
            tids.push(Tid::from_le_bytes(buf));
        }

        let mut isnulls = vec![false; n];
        if bitmap_len > 0 {
            let bitmap = &payload[n * 8..n * 8 + bitmap_len];
            for (i, isnull) in isnulls.iter_mut().enumerate() {
                *isnull = bitmap[i / 8] & (1 << (i % 8)) != 0;
            }
        }

        let mut datums = Vec::with_capacity(n);
        let mut off = data_off;
        for i in 0..n {
            let len_pos = lens_off + i * 4;
            let len = u32::from_le_bytes([
                payload[len_pos],
                payload[len_pos + 1],
                payload[len_pos + 2],
                payload[len_pos + 3],
            ]) as usize;
            if off + len > payload.len() {
                return Err(StrataError::corruption("attribute datum out of bounds"));
            }
            datums.push(Bytes::copy_from_slice(&payload[off..off + len]));
            off += len;
        }

        Ok(ExplodedItem {
            tids,
            datums,
            isnulls,
        })
    }
}

/// The in-memory-only item form used during repack and overlap
/// resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplodedItem {
    /// Element TIDs, strictly ascending.
    pub tids: Vec<Tid>,
    /// Element datums; empty for nulls.
    pub datums: Vec<Bytes>,
    /// Element null markers.
    pub isnulls: Vec<bool>,
}

impl ExplodedItem {
    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tids.len()
    }

    /// True when the item holds no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    /// First TID. The item must be non-empty.
    #[inline]
    #[must_use]
    pub fn first(&self) -> Tid {
        self.tids[0]
    }

    /// One past the last TID. The item must be non-empty.
    #[inline]
    #[must_use]
    pub fn end(&self) -> Tid {
        self.tids[self.tids.len() - 1].next()
    }

    /// Estimated uncompressed payload size, used for chunking decisions.
    #[must_use]
    pub fn payload_estimate(&self) -> usize {
        self.len() * 13 + self.datums.iter().map(Bytes::len).sum::<usize>()
    }

    /// Appends another item's elements. The other item must start at or
    /// after this one's end.
    pub fn extend(&mut self, mut other: ExplodedItem) {
        debug_assert!(self.is_empty() || other.is_empty() || self.end() <= other.first());
        self.tids.append(&mut other.tids);
        self.datums.append(&mut other.datums);
        self.isnulls.append(&mut other.isnulls);
    }

    /// Splits at `cut`: elements below it on the left, the rest on the
    /// right. Either side may come out empty.
    #[must_use]
    pub fn split_at_tid(self, cut: Tid) -> (ExplodedItem, ExplodedItem) {
        let pos = self.tids.partition_point(|t| *t < cut);
        let mut left = self;
        let right = ExplodedItem {
            tids: left.tids.split_off(pos),
            datums: left.datums.split_off(pos),
            isnulls: left.isnulls.split_off(pos),
        };
        (left, right)
    }

    /// Drops every element whose TID is in `targets`. Returns `None`
    /// when nothing remains.
    #[must_use]
    pub fn remove_tids(self, targets: &std::collections::BTreeSet<Tid>) -> Option<ExplodedItem> {
        let mut out = ExplodedItem::default();
        for ((tid, datum), isnull) in self
            .tids
            .into_iter()
            .zip(self.datums)
            .zip(self.isnulls)
        {
            if !targets.contains(&tid) {
                out.tids.push(tid);
                out.datums.push(datum);
                out.isnulls.push(isnull);
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Packs into the on-disk form, compressing when configured and
    /// worthwhile.
    #[must_use]
    pub fn pack(&self, config: &EngineConfig) -> PackedAttrItem {
        debug_assert!(!self.is_empty());
        debug_assert!(self.len() <= u16::MAX as usize);
        let n = self.len();
        let has_nulls = self.isnulls.iter().any(|&isnull| isnull);

        let bitmap_len = if has_nulls { n.div_ceil(8) } else { 0 };
        let datum_bytes: usize = self.datums.iter().map(Bytes::len).sum();
        let mut payload = Vec::with_capacity(n * 12 + bitmap_len + datum_bytes);

        for tid in &self.tids {
            payload.extend_from_slice(&tid.to_le_bytes());
        }
        if has_nulls {
            let mut bitmap = vec![0u8; bitmap_len];
            for (i, &isnull) in self.isnulls.iter().enumerate() {
                if isnull {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            payload.extend_from_slice(&bitmap);
        }
        for datum in &self.datums {
            payload.extend_from_slice(&(datum.len() as u32).to_le_bytes());
        }
        for datum in &self.datums {
            payload.extend_from_slice(datum);
        }

        let mut flags = if has_nulls {
            AttrItemFlags::HAS_NULLS
        } else {
            AttrItemFlags::empty()
        };
        let datasz = payload.len() as u32;

        let payload = if config.enable_compression && payload.len() >= MIN_COMPRESS_SIZE {
            match compress::try_compress(&payload, payload.len() - 1) {
                Some(compressed) => {
                    flags |= AttrItemFlags::COMPRESSED;
                    Bytes::from(compressed)
                }
                None => Bytes::from(payload),
            }
        } else {
            Bytes::from(payload)
        };

        PackedAttrItem {
            first: self.first(),
            end: self.end(),
            nelements: n as u16,
            flags,
            datasz,
            payload,
        }
    }
}

/// Either form of an attribute item, during merge and repack.
#[derive(Debug, Clone)]
pub enum AttrItem {
    /// The on-disk form.
    Packed(PackedAttrItem),
    /// The in-memory form; never stored.
    Exploded(ExplodedItem),
}

impl AttrItem {
    /// First TID covered.
    #[must_use]
    pub fn first(&self) -> Tid {
        match self {
            Self::Packed(item) => item.first,
            Self::Exploded(item) => item.first(),
        }
    }

    /// Exclusive end of the covered range.
    #[must_use]
    pub fn end(&self) -> Tid {
        match self {
            Self::Packed(item) => item.end,
            Self::Exploded(item) => item.end(),
        }
    }

    /// Converts to the exploded form (decompressing a packed item).
    pub fn explode(self) -> StrataResult<ExplodedItem> {
        match self {
            Self::Packed(item) => item.explode(),
            Self::Exploded(item) => Ok(item),
        }
    }

    /// Splits at `cut` into two exploded halves.
    pub fn split_at(self, cut: Tid) -> StrataResult<(ExplodedItem, ExplodedItem)> {
        Ok(self.explode()?.split_at_tid(cut))
    }
}

/// Builds packed items for a sorted (tid, datum, isnull) batch, chunked
/// by the configured target payload size.
pub fn build_items(
    config: &EngineConfig,
    tids: &[Tid],
    datums: &[Bytes],
    isnulls: &[bool],
) -> StrataResult<Vec<AttrItem>> {
    debug_assert_eq!(tids.len(), datums.len());
    debug_assert_eq!(tids.len(), isnulls.len());
    debug_assert!(tids.windows(2).all(|w| w[0] < w[1]));

    let mut items = Vec::new();
    let mut chunk = ExplodedItem::default();
    let mut estimate = 0usize;

    for ((&tid, datum), &isnull) in tids.iter().zip(datums).zip(isnulls) {
        if datum.len() > MAX_DATUM_SIZE {
            return Err(StrataError::DatumTooLarge {
                size: datum.len(),
                max: MAX_DATUM_SIZE,
            });
        }
        let cost = 13 + datum.len();
        if !chunk.is_empty()
            && (estimate + cost > config.attr_item_target_size
                || chunk.len() >= u16::MAX as usize)
        {
            items.push(AttrItem::Packed(chunk.pack(config)));
            chunk = ExplodedItem::default();
            estimate = 0;
        }
        chunk.tids.push(tid);
        chunk.datums.push(datum.clone());
        chunk.isnulls.push(isnull);
        estimate += cost;
    }
    if !chunk.is_empty() {
        items.push(AttrItem::Packed(chunk.pack(config)));
    }
    Ok(items)
}
