//! Extent lists: ordered, disjoint byte ranges over a file.
//!
//! The block manager accounts for file space with extent lists: one
//! list each for allocated, available and discarded ranges, per
//! checkpoint. Ranges are kept sorted by offset, pairwise disjoint and
//! non-adjacent (touching ranges coalesce on insert). Lists that serve
//! allocation also maintain a by-size index so best-fit lookups don't
//! scan.
//!
//! A list's persisted form is a header plus a run of varint-packed
//! (gap, size) deltas; the serialized bytes are themselves written as a
//! block, so every non-empty on-disk list owns an extent of its own.

use crate::addr::Addr;
use shale_core::{AllocPolicy, Error, PackStream, Result, UnpackStream};
use std::collections::{BTreeMap, BTreeSet};

/// Magic value leading a serialized extent list.
const EXTLIST_MAGIC: u64 = 71_002;
/// Serialized extent list version.
const EXTLIST_VERSION: u64 = 1;

/// An ordered set of disjoint `[offset, offset + size)` ranges.
#[derive(Debug, Clone)]
pub struct ExtentList {
    /// Diagnostic name ("live.avail", "ckpt.alloc", ...)
    name: String,

    /// Ranges ordered by offset
    by_off: BTreeMap<u64, u64>,

    /// (size, offset) index, maintained only for allocation lists
    by_size: Option<BTreeSet<(u64, u64)>>,

    /// Sum of all range sizes
    bytes: u64,

    /// Where the serialized form of this list lives on disk, if written
    addr: Option<Addr>,
}

impl ExtentList {
    /// Create an empty list. `track_size` enables the by-size index
    /// needed for best-fit allocation.
    pub fn new(name: impl Into<String>, track_size: bool) -> Self {
        ExtentList {
            name: name.into(),
            by_off: BTreeMap::new(),
            by_size: track_size.then(BTreeSet::new),
            bytes: 0,
            addr: None,
        }
    }

    /// Diagnostic name of this list.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ranges.
    pub fn entries(&self) -> usize {
        self.by_off.len()
    }

    /// Sum of all range sizes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether the list holds no ranges.
    pub fn is_empty(&self) -> bool {
        self.by_off.is_empty()
    }

    /// On-disk address of the serialized list, if it has been written.
    pub fn addr(&self) -> Option<Addr> {
        self.addr
    }

    /// Record (or clear) the on-disk address of the serialized list.
    pub fn set_addr(&mut self, addr: Option<Addr>) {
        self.addr = addr;
    }

    /// Iterate ranges in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_off.iter().map(|(&off, &size)| (off, size))
    }

    /// The last range in offset order.
    pub fn last(&self) -> Option<(u64, u64)> {
        self.by_off.iter().next_back().map(|(&off, &size)| (off, size))
    }

    fn index_insert(&mut self, off: u64, size: u64) {
        self.by_off.insert(off, size);
        if let Some(idx) = self.by_size.as_mut() {
            idx.insert((size, off));
        }
        self.bytes += size;
    }

    fn index_remove(&mut self, off: u64) -> u64 {
        let size = self.by_off.remove(&off).expect("range present");
        if let Some(idx) = self.by_size.as_mut() {
            idx.remove(&(size, off));
        }
        self.bytes -= size;
        size
    }

    /// Insert a range, coalescing with adjacent ranges.
    ///
    /// Overlap with an existing range is an engine invariant violation
    /// and reported as `Panic`.
    pub fn insert(&mut self, off: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "{}: zero-length extent at {off}",
                self.name
            )));
        }
        let end = off
            .checked_add(size)
            .ok_or_else(|| Error::InvalidArgument(format!("{}: extent overflow", self.name)))?;

        let mut new_off = off;
        let mut new_size = size;

        // Predecessor: reject overlap, absorb adjacency.
        if let Some((&poff, &psize)) = self.by_off.range(..=off).next_back() {
            let pend = poff + psize;
            if pend > off {
                return Err(Error::Panic(format!(
                    "{}: extent [{off}, {end}) overlaps [{poff}, {pend})",
                    self.name
                )));
            }
            if pend == off {
                self.index_remove(poff);
                new_off = poff;
                new_size += psize;
            }
        }

        // Successor: reject overlap, absorb adjacency.
        if let Some((&noff, &nsize)) = self.by_off.range(off + 1..).next() {
            if end > noff {
                return Err(Error::Panic(format!(
                    "{}: extent [{off}, {end}) overlaps [{noff}, {})",
                    self.name,
                    noff + nsize
                )));
            }
            if end == noff {
                self.index_remove(noff);
                new_size += nsize;
            }
        }

        self.index_insert(new_off, new_size);
        Ok(())
    }

    /// Remove `[off, off + size)`, splitting a containing range into up
    /// to two pieces.
    pub fn remove_span(&mut self, off: u64, size: u64) -> Result<()> {
        let end = off + size;
        let (coff, csize) = self
            .by_off
            .range(..=off)
            .next_back()
            .map(|(&o, &s)| (o, s))
            .filter(|&(o, s)| o + s >= end)
            .ok_or_else(|| {
                Error::Panic(format!(
                    "{}: no extent containing [{off}, {end})",
                    self.name
                ))
            })?;

        self.index_remove(coff);
        if coff < off {
            self.index_insert(coff, off - coff);
        }
        let cend = coff + csize;
        if cend > end {
            self.index_insert(end, cend - end);
        }
        Ok(())
    }

    /// Allocate `size` bytes, shrinking the chosen range from its
    /// front. Returns `None` when no range is large enough.
    pub fn alloc(&mut self, size: u64, policy: AllocPolicy) -> Option<u64> {
        let (off, range_size) = match policy {
            AllocPolicy::FirstFit => self
                .by_off
                .iter()
                .find(|&(_, &s)| s >= size)
                .map(|(&o, &s)| (o, s))?,
            AllocPolicy::BestFit => match &self.by_size {
                Some(idx) => idx.range((size, 0)..).next().map(|&(s, o)| (o, s))?,
                // Without the size index fall back to a scan; ties
                // still break toward the lower offset.
                None => self
                    .by_off
                    .iter()
                    .filter(|&(_, &s)| s >= size)
                    .min_by_key(|&(&o, &s)| (s, o))
                    .map(|(&o, &s)| (o, s))?,
            },
        };

        self.index_remove(off);
        if range_size > size {
            self.index_insert(off + size, range_size - size);
        }
        Some(off)
    }

    /// Drain this list into `dst`; fails if any range intersects one
    /// already in `dst`.
    pub fn merge_into(&mut self, dst: &mut ExtentList) -> Result<()> {
        for (off, size) in std::mem::take(&mut self.by_off) {
            if let Some(idx) = self.by_size.as_mut() {
                idx.remove(&(size, off));
            }
            self.bytes -= size;
            dst.insert(off, size)?;
        }
        Ok(())
    }

    /// Delete trailing ranges that end exactly at `file_size`, returning
    /// the reduced file size. The caller issues the actual truncate.
    pub fn truncate_tail(&mut self, mut file_size: u64) -> u64 {
        while let Some((off, size)) = self.last() {
            if off + size != file_size {
                break;
            }
            self.index_remove(off);
            file_size = off;
        }
        file_size
    }

    /// Clear all ranges, keeping the name and indexing mode.
    pub fn clear(&mut self) {
        self.by_off.clear();
        if let Some(idx) = self.by_size.as_mut() {
            idx.clear();
        }
        self.bytes = 0;
        self.addr = None;
    }

    /// Serialize as header plus (gap, size) varint deltas.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::serialize_ranges(self.iter(), self.entries())
    }

    /// Serialize this list's ranges unioned with another disjoint
    /// list's, returning the bytes and the serialized range count. The
    /// live avail list is persisted this way: the current avail ranges
    /// plus the checkpoint-avail ranges that become real only once the
    /// checkpoint resolves.
    pub fn to_bytes_merged(&self, other: &ExtentList) -> (Vec<u8>, usize) {
        let mut ranges: Vec<(u64, u64)> = self.iter().chain(other.iter()).collect();
        ranges.sort_unstable();
        // The two lists are disjoint but may abut; coalesce so the
        // serialized form keeps the non-adjacency invariant.
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (off, size) in ranges {
            match merged.last_mut() {
                Some((moff, msize)) if *moff + *msize == off => *msize += size,
                _ => merged.push((off, size)),
            }
        }
        let entries = merged.len();
        (Self::serialize_ranges(merged.into_iter(), entries), entries)
    }

    fn serialize_ranges(ranges: impl Iterator<Item = (u64, u64)>, entries: usize) -> Vec<u8> {
        let mut pack = PackStream::new();
        pack.put_uint(EXTLIST_MAGIC)
            .put_uint(EXTLIST_VERSION)
            .put_uint(entries as u64);
        let mut prev_end = 0u64;
        for (off, size) in ranges {
            pack.put_uint(off - prev_end).put_uint(size);
            prev_end = off + size;
        }
        pack.into_bytes()
    }

    /// Deserialize, verifying the header and that ranges are strictly
    /// increasing, non-overlapping and inside `file_size`.
    pub fn from_bytes(name: impl Into<String>, track_size: bool, buf: &[u8], file_size: u64) -> Result<Self> {
        let mut list = ExtentList::new(name, track_size);
        let mut stream = UnpackStream::new(buf);

        let corrupt = |msg: String| Error::CorruptBlock(msg);
        let magic = stream.get_uint().map_err(Error::from)?;
        let version = stream.get_uint().map_err(Error::from)?;
        if magic != EXTLIST_MAGIC || version != EXTLIST_VERSION {
            return Err(corrupt(format!(
                "{}: bad extent list header (magic {magic}, version {version})",
                list.name
            )));
        }

        let entries = stream.get_uint().map_err(Error::from)?;
        let mut prev_end = 0u64;
        for _ in 0..entries {
            let gap = stream.get_uint().map_err(Error::from)?;
            let size = stream.get_uint().map_err(Error::from)?;
            let off = prev_end
                .checked_add(gap)
                .ok_or_else(|| corrupt(format!("{}: extent offset overflow", list.name)))?;
            let end = off
                .checked_add(size)
                .ok_or_else(|| corrupt(format!("{}: extent size overflow", list.name)))?;
            if size == 0 || (file_size != 0 && end > file_size) {
                return Err(corrupt(format!(
                    "{}: extent [{off}, {end}) past file size {file_size}",
                    list.name
                )));
            }
            list.index_insert(off, size);
            prev_end = end;
        }
        Ok(list)
    }

    /// Diagnostic: verify two lists do not intersect.
    pub fn check_disjoint(a: &ExtentList, b: &ExtentList) -> Result<()> {
        let mut ai = a.iter().peekable();
        let mut bi = b.iter().peekable();
        while let (Some(&(ao, asz)), Some(&(bo, bsz))) = (ai.peek(), bi.peek()) {
            if ao + asz <= bo {
                ai.next();
            } else if bo + bsz <= ao {
                bi.next();
            } else {
                return Err(Error::Panic(format!(
                    "{} and {} intersect at [{}, {})",
                    a.name,
                    b.name,
                    ao.max(bo),
                    (ao + asz).min(bo + bsz)
                )));
            }
        }
        Ok(())
    }

    /// Whether `[off, off + size)` intersects any range in this list.
    pub fn intersects(&self, off: u64, size: u64) -> bool {
        let end = off + size;
        if let Some((&po, &ps)) = self.by_off.range(..end).next_back() {
            if po + ps > off {
                return true;
            }
        }
        false
    }
}

/// Move every overlap between `alloc` and `discard` into `dest`.
///
/// A block both allocated and discarded within the same checkpoint was
/// created and abandoned inside it; nothing else can reference the
/// span, so it is reclaimable the moment the checkpoint resolves.
pub fn reclaim_overlaps(
    alloc: &mut ExtentList,
    discard: &mut ExtentList,
    dest: &mut ExtentList,
) -> Result<()> {
    let alloc_ranges: Vec<(u64, u64)> = alloc.iter().collect();
    for (aoff, asize) in alloc_ranges {
        let aend = aoff + asize;
        let overlaps: Vec<(u64, u64)> = discard
            .iter()
            .skip_while(|&(doff, dsize)| doff + dsize <= aoff)
            .take_while(|&(doff, _)| doff < aend)
            .map(|(doff, dsize)| {
                let start = doff.max(aoff);
                let end = (doff + dsize).min(aend);
                (start, end - start)
            })
            .collect();
        for (off, size) in overlaps {
            alloc.remove_span(off, size)?;
            discard.remove_span(off, size)?;
            dest.insert(off, size)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn avail(ranges: &[(u64, u64)]) -> ExtentList {
        let mut list = ExtentList::new("test.avail", true);
        for &(off, size) in ranges {
            list.insert(off, size).unwrap();
        }
        list
    }

    #[test]
    fn test_insert_coalesces_adjacent() {
        let mut list = avail(&[(0, 512), (1024, 512)]);
        assert_eq!(list.entries(), 2);

        // Bridges the gap: all three ranges collapse into one.
        list.insert(512, 512).unwrap();
        assert_eq!(list.entries(), 1);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![(0, 1536)]);
        assert_eq!(list.bytes(), 1536);
    }

    #[test]
    fn test_insert_overlap_is_fatal() {
        let mut list = avail(&[(0, 1024)]);
        assert!(matches!(list.insert(512, 512), Err(Error::Panic(_))));
        assert!(matches!(list.insert(1023, 2), Err(Error::Panic(_))));
    }

    #[test]
    fn test_remove_span_splits() {
        let mut list = avail(&[(0, 4096)]);
        list.remove_span(1024, 512).unwrap();
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec![(0, 1024), (1536, 2560)]
        );
        assert_eq!(list.bytes(), 4096 - 512);

        // Removing a span nothing contains is fatal.
        assert!(matches!(list.remove_span(1024, 512), Err(Error::Panic(_))));
    }

    #[test]
    fn test_alloc_first_fit_prefers_low_offset() {
        let mut list = avail(&[(4096, 512), (1024, 2048)]);
        assert_eq!(list.alloc(512, AllocPolicy::FirstFit), Some(1024));
        // Chosen range shrinks from the front.
        assert!(list.iter().any(|(off, size)| off == 1536 && size == 1536));
    }

    #[test]
    fn test_alloc_best_fit_prefers_small_range() {
        let mut list = avail(&[(1024, 2048), (4096, 512)]);
        assert_eq!(list.alloc(512, AllocPolicy::BestFit), Some(4096));
    }

    #[test]
    fn test_alloc_policies_agree_when_one_range_fits() {
        let a = avail(&[(1024, 512), (4096, 256)]);
        let mut first = a.clone();
        let mut best = a;
        assert_eq!(
            first.alloc(512, AllocPolicy::FirstFit),
            best.alloc(512, AllocPolicy::BestFit)
        );
    }

    #[test]
    fn test_alloc_exact_fit_removes_range() {
        let mut list = avail(&[(1024, 512)]);
        assert_eq!(list.alloc(512, AllocPolicy::FirstFit), Some(1024));
        assert!(list.is_empty());
        assert_eq!(list.bytes(), 0);
    }

    #[test]
    fn test_alloc_nothing_fits() {
        let mut list = avail(&[(0, 256)]);
        assert_eq!(list.alloc(512, AllocPolicy::FirstFit), None);
        assert_eq!(list.alloc(512, AllocPolicy::BestFit), None);
        assert_eq!(list.entries(), 1);
    }

    #[test]
    fn test_best_fit_tie_breaks_low_offset() {
        let mut list = avail(&[(8192, 512), (1024, 512)]);
        assert_eq!(list.alloc(512, AllocPolicy::BestFit), Some(1024));
    }

    #[test]
    fn test_merge_into_disjoint() {
        let mut a = avail(&[(0, 512), (2048, 512)]);
        let mut b = avail(&[(1024, 512)]);
        a.merge_into(&mut b).unwrap();
        assert!(a.is_empty());
        assert_eq!(b.entries(), 3);
        assert_eq!(b.bytes(), 1536);
    }

    #[test]
    fn test_merge_into_overlap_fails() {
        let mut a = avail(&[(0, 1024)]);
        let mut b = avail(&[(512, 1024)]);
        assert!(matches!(a.merge_into(&mut b), Err(Error::Panic(_))));
    }

    #[test]
    fn test_truncate_tail() {
        let mut list = avail(&[(512, 512), (2048, 1024), (3072, 1024)]);
        // Ranges (2048,1024) and (3072,1024) coalesced into (2048,2048),
        // which ends exactly at the file size.
        let new_size = list.truncate_tail(4096);
        assert_eq!(new_size, 2048);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![(512, 512)]);
        // Nothing else ends at the new size.
        assert_eq!(list.truncate_tail(new_size), new_size);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let list = avail(&[(512, 512), (2048, 4096), (65536, 512)]);
        let bytes = list.to_bytes();
        let read = ExtentList::from_bytes("test.avail", true, &bytes, 1 << 20).unwrap();
        assert_eq!(
            read.iter().collect::<Vec<_>>(),
            list.iter().collect::<Vec<_>>()
        );
        assert_eq!(read.bytes(), list.bytes());
    }

    #[test]
    fn test_deserialization_rejects_garbage() {
        let mut bad = avail(&[(512, 512)]).to_bytes();
        bad[0] ^= 0x01;
        assert!(matches!(
            ExtentList::from_bytes("x", false, &bad, 0),
            Err(Error::CorruptBlock(_))
        ));

        // Range past the stated file size.
        let list = avail(&[(512, 4096)]);
        assert!(matches!(
            ExtentList::from_bytes("x", false, &list.to_bytes(), 1024),
            Err(Error::CorruptBlock(_))
        ));
    }

    #[test]
    fn test_check_disjoint() {
        let a = avail(&[(0, 512), (2048, 512)]);
        let b = avail(&[(1024, 512)]);
        assert!(ExtentList::check_disjoint(&a, &b).is_ok());

        let c = avail(&[(2304, 512)]);
        assert!(matches!(
            ExtentList::check_disjoint(&a, &c),
            Err(Error::Panic(_))
        ));
    }

    #[test]
    fn test_reclaim_overlaps() {
        let mut alloc = avail(&[(0, 1024), (4096, 1024)]);
        let mut discard = avail(&[(512, 1024), (8192, 512)]);
        let mut dest = ExtentList::new("ckpt_avail", true);

        reclaim_overlaps(&mut alloc, &mut discard, &mut dest).unwrap();

        // Only [512, 1024) was in both lists.
        assert_eq!(dest.iter().collect::<Vec<_>>(), vec![(512, 512)]);
        assert_eq!(alloc.iter().collect::<Vec<_>>(), vec![(0, 512), (4096, 1024)]);
        assert_eq!(
            discard.iter().collect::<Vec<_>>(),
            vec![(1024, 512), (8192, 512)]
        );
    }

    proptest! {
        /// Ranges stay sorted, disjoint and correctly counted across a
        /// random insert/alloc/free workload.
        #[test]
        fn prop_invariants_hold(ops in proptest::collection::vec((0u8..3, 0u64..64, 1u64..8), 1..64)) {
            let mut list = ExtentList::new("prop", true);
            for (op, slot, units) in ops {
                let off = slot * 512;
                let size = units * 512;
                match op {
                    0 => { let _ = list.insert(off, size); }
                    1 => { let _ = list.alloc(size, AllocPolicy::FirstFit); }
                    _ => { let _ = list.alloc(size, AllocPolicy::BestFit); }
                }

                let ranges: Vec<(u64, u64)> = list.iter().collect();
                let mut total = 0;
                for window in ranges.windows(2) {
                    let (ao, asz) = window[0];
                    let (bo, _) = window[1];
                    // Strictly increasing, disjoint, non-adjacent.
                    prop_assert!(ao + asz < bo);
                }
                for &(_, size) in &ranges {
                    total += size;
                }
                prop_assert_eq!(total, list.bytes());
                prop_assert_eq!(ranges.len(), list.entries());
            }
        }

        /// Serialized form survives a round-trip for arbitrary lists.
        #[test]
        fn prop_serialization_roundtrip(slots in proptest::collection::btree_map(0u64..128, 1u64..8, 0..32)) {
            let mut list = ExtentList::new("prop", false);
            for (slot, units) in slots {
                let _ = list.insert(slot * 4096, units * 512);
            }
            let read = ExtentList::from_bytes("prop", false, &list.to_bytes(), 0).unwrap();
            prop_assert_eq!(read.iter().collect::<Vec<_>>(), list.iter().collect::<Vec<_>>());
        }
    }

    // Exercise the varint boundaries the deltas land on.
    #[test]
    fn test_serialization_large_offsets() {
        let list = avail(&[(1 << 40, 512), ((1 << 40) + 8192, 1 << 20)]);
        let bytes = list.to_bytes();
        let read = ExtentList::from_bytes("big", true, &bytes, u64::MAX).unwrap();
        assert_eq!(read.iter().collect::<Vec<_>>(), list.iter().collect::<Vec<_>>());
    }
}
