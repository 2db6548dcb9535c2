//! The range table: physical memory split by NUMA node and address band.
//!
//! Every entry covers the part of one node's extent that falls into one of
//! the architectural bands of [`ARCH_BANDS`]. Entries are chained in strictly
//! descending order of their lowest frame, starting at [`RangeTable::top`].
//!
//! Readers never lock. Hot-add initializes a free slot completely, then
//! splices it into the chain with a `Release` store of the predecessor's
//! link; readers follow links with `Acquire` loads and therefore never see a
//! partially built entry. Writers serialize on the table's writer lock.

use crate::error::{PmemError, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use kernel_info::boot::{MemNodeConfig, NodeId};
use kernel_info::memory::{ARCH_BANDS, BAND_0, BAND_4G, MAX_MEM_NODES, PFN_4G};
use kernel_memory_addresses::{MAX_PAGE_LEVELS, Pfn};
use kernel_sync::SpinLock;
use log::{debug, info};

/// Link value terminating the chain.
pub const NIL: usize = usize::MAX;

/// Highest frame of band `band` (`MEMRANGEHI`). The topmost band is open.
#[inline]
const fn band_hi(band: usize) -> u64 {
    if band == 0 { u64::MAX } else { ARCH_BANDS[band - 1] - 1 }
}

/// Lowest frame of band `band` (`MEMRANGELO`).
#[inline]
const fn band_lo(band: usize) -> u64 {
    ARCH_BANDS[band]
}

/// One `(node, band)` partition.
#[derive(Debug)]
pub struct RangeEntry {
    pfn_lo: AtomicU64,
    pfn_hi: AtomicU64,
    node: AtomicU16,
    band: AtomicUsize,
    next: AtomicUsize,
    exists: AtomicBool,
    /// Free pages per level, counted in pages of that level.
    pub(crate) free_pages: [AtomicU64; MAX_PAGE_LEVELS],
    /// Cached base pages.
    pub(crate) cache_pages: AtomicU64,
    /// Base frames on any list of this entry.
    pub(crate) total: AtomicU64,
}

impl RangeEntry {
    const fn unused() -> Self {
        Self {
            pfn_lo: AtomicU64::new(0),
            pfn_hi: AtomicU64::new(0),
            node: AtomicU16::new(0),
            band: AtomicUsize::new(0),
            next: AtomicUsize::new(NIL),
            exists: AtomicBool::new(false),
            free_pages: [const { AtomicU64::new(0) }; MAX_PAGE_LEVELS],
            cache_pages: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn pfn_lo(&self) -> Pfn {
        Pfn::new(self.pfn_lo.load(Ordering::Acquire))
    }

    #[inline]
    pub fn pfn_hi(&self) -> Pfn {
        Pfn::new(self.pfn_hi.load(Ordering::Acquire))
    }

    /// `(lo, hi)`, both inclusive.
    #[inline]
    pub fn pfn_bounds(&self) -> (Pfn, Pfn) {
        (self.pfn_lo(), self.pfn_hi())
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node.load(Ordering::Relaxed))
    }

    /// Index into [`ARCH_BANDS`].
    #[inline]
    pub fn band(&self) -> usize {
        self.band.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.exists.load(Ordering::Acquire)
    }

    #[inline]
    pub fn next(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    /// Frames of this entry currently on a free or cache list.
    #[inline]
    pub fn free_frames(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn free_pages(&self, level: usize) -> u64 {
        self.free_pages
            .get(level)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn cached_pages(&self) -> u64 {
        self.cache_pages.load(Ordering::Relaxed)
    }

    fn fill(&self, node: NodeId, band: usize, lo: u64, hi: u64) {
        self.pfn_lo.store(lo, Ordering::Relaxed);
        self.pfn_hi.store(hi, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.node.store(node.index() as u16, Ordering::Relaxed);
        self.band.store(band, Ordering::Relaxed);
        self.exists.store(true, Ordering::Release);
    }
}

/// Number of band entries of `ARCH_BANDS` kept for a machine whose highest
/// possible frame is `max_pfn`: bands above it are dropped.
#[must_use]
pub fn first_band(max_pfn: u64) -> usize {
    ARCH_BANDS[..ARCH_BANDS.len() - 1]
        .iter()
        .position(|&lo| max_pfn >= lo)
        .unwrap_or(ARCH_BANDS.len() - 1)
}

/// `(band, lo, hi)` for every band the extent intersects, highest first.
fn node_bands(first: usize, node: &MemNodeConfig) -> impl Iterator<Item = (usize, u64, u64)> {
    (first..ARCH_BANDS.len())
        .filter(move |&b| node.exists && node.max_pfn >= band_lo(b) && node.base_pfn <= band_hi(b))
        .map(move |b| (b, band_lo(b).max(node.base_pfn), band_hi(b).min(node.max_pfn)))
}

/// Number of range entries the node needs.
#[must_use]
pub fn ranges_for_node(first: usize, node: &MemNodeConfig) -> usize {
    node_bands(first, node).count()
}

/// The range table.
pub struct RangeTable {
    entries: Box<[RangeEntry]>,
    first_band: usize,
    top: AtomicUsize,
    lowest: AtomicUsize,
    writer: SpinLock<()>,
}

impl RangeTable {
    /// Builds the boot-time table.
    ///
    /// `max_pfn` is the highest frame that can ever be installed, including
    /// hot-add; `spare` extra slots are kept free for hot-add.
    ///
    /// # Errors
    /// [`PmemError::InvalidExtent`] if no entry starts at frame 0.
    pub fn build(
        nodes: &[MemNodeConfig; MAX_MEM_NODES],
        max_pfn: u64,
        spare: usize,
    ) -> Result<Self> {
        let first = first_band(max_pfn);
        let needed: usize = nodes.iter().map(|n| ranges_for_node(first, n)).sum();
        let capacity = (needed + spare).min(usize::from(u8::MAX));

        let entries: Vec<_> = (0..capacity).map(|_| RangeEntry::unused()).collect();
        let table = Self {
            entries: entries.into_boxed_slice(),
            first_band: first,
            top: AtomicUsize::new(NIL),
            lowest: AtomicUsize::new(NIL),
            writer: SpinLock::new(()),
        };

        let mut used = 0;
        for (i, node) in nodes.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let id = NodeId::new(i as u16);
            for (band, lo, hi) in node_bands(first, node) {
                let slot = table.entries.get(used).ok_or(PmemError::RangeTableFull)?;
                slot.fill(id, band, lo, hi);
                used += 1;
            }
        }

        table.link_sorted(used)?;
        info!(
            "range table: {used} entries ({capacity} slots), bands from {:#x}",
            ARCH_BANDS[first]
        );
        Ok(table)
    }

    /// Chains the first `used` slots by descending `pfn_lo`.
    ///
    /// The set is small; a selection pass per entry is enough.
    fn link_sorted(&self, used: usize) -> Result<()> {
        let e = &self.entries[..used];
        let mut last = e
            .iter()
            .position(|r| r.pfn_lo().as_u64() == 0)
            .ok_or(PmemError::InvalidExtent)?;
        self.lowest.store(last, Ordering::Relaxed);
        e[last].next.store(NIL, Ordering::Relaxed);

        for _ in 1..used {
            let floor = e[last].pfn_lo();
            let Some(hi) = e
                .iter()
                .enumerate()
                .filter(|(_, r)| r.pfn_lo() > floor)
                .min_by_key(|(_, r)| r.pfn_lo())
                .map(|(i, _)| i)
            else {
                break;
            };
            e[hi].next.store(last, Ordering::Relaxed);
            last = hi;
        }
        self.top.store(last, Ordering::Release);
        Ok(())
    }

    /// Entry heading the chain.
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Entry starting at frame 0.
    #[inline]
    pub fn lowest(&self) -> usize {
        self.lowest.load(Ordering::Relaxed)
    }

    /// First kept band; `0` means memory may exist above 4 GiB.
    #[inline]
    pub const fn first_band(&self) -> usize {
        self.first_band
    }

    /// Whether the machine can have memory above 4 GiB (`physmax4g`).
    #[inline]
    pub const fn above_4g(&self) -> bool {
        self.first_band == BAND_4G
    }

    /// Entry containing the last frame below 4 GiB.
    pub fn four_gig(&self) -> Option<usize> {
        if self.above_4g() {
            self.range_of(Pfn::new(PFN_4G - 1))
        } else {
            None
        }
    }

    #[inline]
    pub fn entry(&self, idx: usize) -> &RangeEntry {
        &self.entries[idx]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Band index of `pfn` among the kept bands.
    #[must_use]
    pub fn band_of(&self, pfn: Pfn) -> usize {
        (self.first_band..ARCH_BANDS.len() - 1)
            .find(|&b| pfn.as_u64() >= ARCH_BANDS[b])
            .unwrap_or(BAND_0)
    }

    /// Walks the chain from the top.
    pub fn iter(&self) -> RangeIter<'_> {
        RangeIter {
            table: self,
            cur: self.top(),
        }
    }

    /// Walks the chain from `start` down to `end` inclusive (or the bottom).
    pub fn iter_from(
        &self,
        start: usize,
        end: usize,
    ) -> impl Iterator<Item = (usize, &RangeEntry)> {
        let mut done = false;
        RangeIter { table: self, cur: start }.take_while(move |&(i, _)| {
            if done {
                return false;
            }
            done = i == end;
            true
        })
    }

    /// Entry containing `pfn`: the first entry from the top
    /// whose low bound is at or below `pfn`.
    pub fn range_of(&self, pfn: Pfn) -> Option<usize> {
        self.iter().find(|(_, r)| pfn >= r.pfn_lo()).map(|(i, _)| i)
    }

    /// Entries of `node`, highest first.
    pub fn node_entries(&self, node: NodeId) -> impl Iterator<Item = (usize, &RangeEntry)> {
        self.iter().filter(move |(_, r)| r.node() == node)
    }

    /// Unused slots left for hot-add.
    pub fn free_slots(&self) -> usize {
        self.entries.iter().filter(|r| !r.exists()).count()
    }

    /// Slots [`add_range`](Self::add_range) would consume for `extent`.
    pub fn slots_needed(&self, node: NodeId, extent: &MemNodeConfig) -> usize {
        node_bands(self.first_band, extent)
            .filter(|&(band, _, _)| !self.node_entries(node).any(|(_, r)| r.band() == band))
            .count()
    }

    /// Extends or adds the entries for a node's new extent.
    ///
    /// # Errors
    /// [`PmemError::RangeTableFull`] if no unused slot is left; entries
    /// published before the failure stay in place.
    pub fn add_range(&self, node: NodeId, extent: &MemNodeConfig) -> Result<()> {
        let _guard = self.writer.lock();
        debug_assert!(extent.base_pfn <= extent.max_pfn);

        for (band, lo, hi) in node_bands(self.first_band, extent) {
            if let Some((_, r)) = self.node_entries(node).find(|(_, r)| r.band() == band) {
                r.pfn_lo.store(lo, Ordering::Release);
                r.pfn_hi.store(hi, Ordering::Release);
                debug!("range table: {node:?} band {band} extended to {lo:#x}..={hi:#x}");
                continue;
            }

            let n = self
                .entries
                .iter()
                .position(|r| !r.exists())
                .ok_or(PmemError::RangeTableFull)?;
            let fresh = &self.entries[n];
            fresh.fill(node, band, lo, hi);

            // Find the link to splice into. Frame 0 is always present, so
            // the walk ends at or above the lowest entry.
            let mut prev: &AtomicUsize = &self.top;
            loop {
                let cur = prev.load(Ordering::Acquire);
                if cur == NIL || self.entries[cur].pfn_lo().as_u64() < lo {
                    break;
                }
                debug_assert!(self.entries[cur].pfn_lo().as_u64() > hi);
                prev = &self.entries[cur].next;
            }
            fresh.next.store(prev.load(Ordering::Relaxed), Ordering::Relaxed);
            prev.store(n, Ordering::Release);
            info!("range table: {node:?} band {band} added as entry {n} ({lo:#x}..={hi:#x})");
        }
        Ok(())
    }

    /// Hot-remove of a node's ranges is not supported.
    ///
    /// # Panics
    /// Always.
    pub fn del_range(&self, node: NodeId) -> ! {
        panic!("range table: removing the ranges of {node:?} is not supported");
    }
}

/// Iterator over `(slot, entry)` following the descending chain.
pub struct RangeIter<'a> {
    table: &'a RangeTable,
    cur: usize,
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = (usize, &'a RangeEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let idx = self.cur;
        let entry = self.table.entries.get(idx)?;
        self.cur = entry.next();
        Some((idx, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::{BAND_16M, BAND_2G, PFN_16M, PFN_2G};

    fn nodes(list: &[(u64, u64)]) -> [MemNodeConfig; MAX_MEM_NODES] {
        let mut n = [MemNodeConfig::ABSENT; MAX_MEM_NODES];
        for (i, &(lo, hi)) in list.iter().enumerate() {
            n[i] = MemNodeConfig::new(lo, hi);
        }
        n
    }

    #[test]
    fn bands_are_trimmed_to_installed_memory() {
        assert_eq!(first_band(0xfff), BAND_0);
        assert_eq!(first_band(PFN_16M), BAND_16M);
        assert_eq!(first_band(PFN_2G + 5), BAND_2G);
        assert_eq!(first_band(PFN_4G), BAND_4G);
    }

    #[test]
    fn node_crossing_bands_gets_one_entry_per_band() {
        let n = MemNodeConfig::new(0, PFN_16M + 0xff);
        assert_eq!(ranges_for_node(BAND_16M, &n), 2);
        assert_eq!(ranges_for_node(BAND_16M, &MemNodeConfig::ABSENT), 0);
    }

    #[test]
    fn chain_is_descending_and_lookup_walks_it() {
        // node 0 spans 16M, node 1 sits above it
        let t = RangeTable::build(
            &nodes(&[(0, PFN_16M + 0xfff), (PFN_16M + 0x1000, PFN_16M + 0x1fff)]),
            PFN_16M + 0x1fff,
            2,
        )
        .unwrap();
        let los: Vec<u64> = t.iter().map(|(_, r)| r.pfn_lo().as_u64()).collect();
        assert_eq!(los, vec![PFN_16M + 0x1000, PFN_16M, 0]);
        assert_eq!(t.entry(t.lowest()).pfn_lo(), Pfn::new(0));
        assert_eq!(t.entry(t.top()).node(), NodeId::new(1));

        let r = t.range_of(Pfn::new(PFN_16M + 5)).unwrap();
        assert_eq!(t.entry(r).band(), BAND_16M);
        assert_eq!(t.entry(r).node(), NodeId::new(0));
        assert_eq!(t.entry(r).pfn_bounds(), (Pfn::new(PFN_16M), Pfn::new(PFN_16M + 0xfff)));
        assert_eq!(t.band_of(Pfn::new(3)), BAND_0);
        assert!(t.four_gig().is_none());
    }

    #[test]
    fn missing_frame_zero_is_rejected() {
        assert!(RangeTable::build(&nodes(&[(0x10, 0xff)]), 0xff, 0).is_err());
    }

    #[test]
    fn iter_from_stops_at_end() {
        let t = RangeTable::build(&nodes(&[(0, PFN_2G + 1)]), PFN_2G + 1, 0).unwrap();
        let all: Vec<usize> = t.iter().map(|(i, _)| i).collect();
        assert_eq!(all.len(), 3);
        let part: Vec<usize> = t.iter_from(all[0], all[1]).map(|(i, _)| i).collect();
        assert_eq!(part, &all[..2]);
    }

    #[test]
    fn add_range_splices_new_top() {
        let t = RangeTable::build(&nodes(&[(0, 0xfff)]), PFN_16M + 0xfff, 1).unwrap();
        let before = t.top();
        let ext = MemNodeConfig::new(PFN_16M, PFN_16M + 0xfff);
        t.add_range(NodeId::new(1), &ext).unwrap();
        assert_ne!(t.top(), before);
        assert_eq!(t.entry(t.top()).pfn_lo(), Pfn::new(PFN_16M));
        assert_eq!(t.entry(t.top()).next(), before);
        assert_eq!(t.range_of(Pfn::new(PFN_16M + 1)), Some(t.top()));

        // no slot left for another entry
        let far = MemNodeConfig::new(PFN_16M + 0x2000, PFN_16M + 0x2fff);
        assert_eq!(t.add_range(NodeId::new(2), &far), Err(PmemError::RangeTableFull));
    }

    #[test]
    fn add_range_keeps_chain_descending_when_a_node_gains_a_band() {
        let t = RangeTable::build(&nodes(&[(0, 0x7ff), (0x800, 0x17ff)]), PFN_2G + 0xfff, 2)
            .unwrap();
        let lows = |t: &RangeTable| -> Vec<u64> {
            t.iter().map(|(_, r)| r.pfn_lo().as_u64()).collect()
        };
        assert_eq!(lows(&t), vec![PFN_16M, 0x800, 0]);

        t.add_range(NodeId::new(1), &MemNodeConfig::new(0x800, PFN_2G + 0xff)).unwrap();
        assert_eq!(lows(&t), vec![PFN_2G, PFN_16M, 0x800, 0]);
        let top = t.range_of(Pfn::new(PFN_2G + 5)).unwrap();
        assert_eq!(t.entry(top).band(), BAND_2G);
        assert_eq!(t.entry(top).pfn_bounds(), (Pfn::new(PFN_2G), Pfn::new(PFN_2G + 0xff)));

        let t = RangeTable::build(&nodes(&[(0, 0x7ff), (0x1800, 0x1fff)]), 0x3fff, 1).unwrap();
        t.add_range(NodeId::new(1), &MemNodeConfig::new(0x900, 0x1fff)).unwrap();
        assert_eq!(lows(&t), vec![PFN_16M, 0x900, 0]);
        let idx = t.range_of(Pfn::new(0x950)).unwrap();
        assert_eq!((t.entry(idx).node(), t.entry(idx).band()), (NodeId::new(1), BAND_0));
    }

    #[test]
    fn add_range_extends_existing_band() {
        let t = RangeTable::build(&nodes(&[(0, 0xfff)]), 0x1fff, 0).unwrap();
        t.add_range(NodeId::new(0), &MemNodeConfig::new(0, 0x1fff)).unwrap();
        assert_eq!(t.iter().count(), 1);
        assert_eq!(t.entry(t.top()).pfn_hi(), Pfn::new(0x1fff));
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn del_range_panics() {
        let t = RangeTable::build(&nodes(&[(0, 0xff)]), 0xff, 0).unwrap();
        t.del_range(NodeId::new(0));
    }
}
