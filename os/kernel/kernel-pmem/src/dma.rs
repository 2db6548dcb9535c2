//! DMA attributes and the any-color page search.

use crate::allocator::PageAllocator;
use crate::error::{PmemError, Result};
use crate::frame::Frame;
use crate::lists::{BinKey, ListKind};
use kernel_info::boot::NodeId;
use kernel_info::memory::MMU_PAGESIZE;
use kernel_memory_addresses::{PageLevel, Pfn, PhysicalAddress};
use log::warn;

/// Physical constraints a device places on the memory it can reach.
///
/// All addresses are byte addresses; `addr_hi` is inclusive.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaAttr {
    pub addr_lo: u64,
    pub addr_hi: u64,
    /// A transfer must not cross a multiple of `seg + 1` bytes.
    pub seg: u64,
    /// Required alignment of each run, in bytes.
    pub align: u64,
    /// Minimum transfer size, in bytes.
    pub minxfer: u64,
    /// Maximum number of physically contiguous runs per request.
    pub sgllen: u32,
}

impl DmaAttr {
    /// A window `[lo, hi]` with no segment, alignment or scatter/gather
    /// limits beyond a single run.
    #[must_use]
    pub const fn window(addr_lo: u64, addr_hi: u64) -> Self {
        Self {
            addr_lo,
            addr_hi,
            seg: u64::MAX,
            align: 1,
            minxfer: 1,
            sgllen: 1,
        }
    }

    #[must_use]
    pub const fn with_seg(mut self, seg: u64) -> Self {
        self.seg = seg;
        self
    }

    #[must_use]
    pub const fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn with_minxfer(mut self, minxfer: u64) -> Self {
        self.minxfer = minxfer;
        self
    }

    #[must_use]
    pub const fn with_sgllen(mut self, sgllen: u32) -> Self {
        self.sgllen = sgllen;
        self
    }

    /// Frames whose first byte lies in the window, inclusive.
    #[must_use]
    pub const fn pfn_window(&self) -> (Pfn, Pfn) {
        (
            PhysicalAddress::new(self.addr_lo).pfn(),
            PhysicalAddress::new(self.addr_hi).pfn(),
        )
    }

    /// Whether the whole frame `pfn` lies inside the window.
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.address().as_u64() >= self.addr_lo && pfn.last_byte().as_u64() <= self.addr_hi
    }

    /// Rejects an empty window.
    ///
    /// # Errors
    /// [`PmemError::InvalidDmaWindow`].
    pub fn check_window(&self) -> Result<()> {
        if self.addr_lo > self.addr_hi {
            warn!(
                "DMA window {:#x}..={:#x} is empty",
                self.addr_lo, self.addr_hi
            );
            return Err(PmemError::InvalidDmaWindow {
                lo: self.addr_lo,
                hi: self.addr_hi,
            });
        }
        Ok(())
    }

    /// Rejects alignments that single pages cannot honor.
    ///
    /// # Errors
    /// [`PmemError::UnsupportedAlignment`].
    pub fn check_page_alignment(&self) -> Result<()> {
        if self.align > MMU_PAGESIZE {
            warn!("DMA alignment {:#x} needs a contiguous request", self.align);
            return Err(PmemError::UnsupportedAlignment { align: self.align });
        }
        Ok(())
    }

    /// Whether the window covers the whole frame range `[lo, hi]`.
    const fn covers(&self, lo: Pfn, hi: Pfn) -> bool {
        self.addr_lo <= lo.address().as_u64() && self.addr_hi >= hi.last_byte().as_u64()
    }
}

impl PageAllocator<'_> {
    /// Finds one free or cached base page of any color, preferring `color`.
    ///
    /// Each node is searched nearest first; within a node all free lists
    /// in the reachable ranges are tried before any cache list. The frame
    /// comes back exclusively locked and unlisted, still `Free` or `Cached`.
    ///
    /// # Errors
    /// [`PmemError::InvalidDmaWindow`] or [`PmemError::UnsupportedAlignment`]
    /// for a bad `dma`, otherwise [`PmemError::Exhausted`].
    pub(crate) fn find_any(
        &self,
        dma: Option<&DmaAttr>,
        color: u32,
        locality: Option<NodeId>,
    ) -> Result<&Frame> {
        let ranges = &self.tables.ranges;
        let (top, bottom) = match dma {
            None => (ranges.top(), ranges.lowest()),
            Some(d) => {
                d.check_window()?;
                d.check_page_alignment()?;
                let (lo, hi) = d.pfn_window();
                let top = ranges.range_of(hi).ok_or(PmemError::Exhausted)?;
                let bottom = ranges.range_of(lo).ok_or(PmemError::Exhausted)?;
                (top, bottom)
            }
        };

        for node in self.env.locality.nodes_in_order(locality) {
            let found = self
                .any_free(node, top, bottom, color, dma)
                .or_else(|| self.any_cached(node, top, bottom, color, dma));
            if let Some(frame) = found {
                debug_assert!(dma.is_none_or(|d| d.contains(frame.pfn())));
                return Ok(frame);
            }
        }
        Err(PmemError::Exhausted)
    }

    /// The search window of an entry, or `None` if `dma` excludes all of it.
    /// A window covering the entry needs no per-frame filter.
    fn entry_window(lo: Pfn, hi: Pfn, dma: Option<&DmaAttr>) -> Option<(Pfn, Pfn, bool)> {
        match dma {
            None => Some((lo, hi, false)),
            Some(d) if d.covers(lo, hi) => Some((lo, hi, false)),
            Some(d) => {
                let (wlo, whi) = d.pfn_window();
                let (lo, hi) = (lo.max(wlo), hi.min(whi));
                (lo <= hi).then_some((lo, hi, true))
            }
        }
    }

    fn any_free(
        &self,
        node: NodeId,
        top: usize,
        bottom: usize,
        color: u32,
        dma: Option<&DmaAttr>,
    ) -> Option<&Frame> {
        let t = &self.tables;
        let accept = |f: &Frame| dma.is_none_or(|d| d.contains(f.pfn()));
        for (_, entry) in t.ranges.iter_from(top, bottom) {
            if entry.node() != node {
                continue;
            }
            let (elo, ehi) = entry.pfn_bounds();
            let Some((lo, hi, filtered)) = Self::entry_window(elo, ehi, dma) else {
                continue;
            };
            for c in t.scheme.walk(color, PageLevel::BASE) {
                let key = BinKey {
                    node,
                    band: entry.band(),
                    level: PageLevel::BASE,
                    color: c,
                };
                let taken = if filtered {
                    self.lists.take(t, &key, ListKind::Free, accept)
                } else {
                    self.lists.take(t, &key, ListKind::Free, |_| true)
                };
                let found = taken.or_else(|| {
                    self.lists.split_larger_page(
                        t,
                        node,
                        entry.band(),
                        PageLevel::BASE,
                        c,
                        lo,
                        hi + 1,
                    )
                });
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    fn any_cached(
        &self,
        node: NodeId,
        top: usize,
        bottom: usize,
        color: u32,
        dma: Option<&DmaAttr>,
    ) -> Option<&Frame> {
        let t = &self.tables;
        for (_, entry) in t.ranges.iter_from(top, bottom) {
            if entry.node() != node || entry.cached_pages() == 0 {
                continue;
            }
            let (elo, ehi) = entry.pfn_bounds();
            let Some((lo, hi, _)) = Self::entry_window(elo, ehi, dma) else {
                continue;
            };
            for c in t.scheme.walk(color, PageLevel::BASE) {
                let key = BinKey {
                    node,
                    band: entry.band(),
                    level: PageLevel::BASE,
                    color: c,
                };
                let found = self
                    .lists
                    .take(t, &key, ListKind::Cache, |f| f.pfn() >= lo && f.pfn() <= hi);
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }
}

/// Whole pages needed for `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(MMU_PAGESIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_to_one_run() {
        let d = DmaAttr::window(0, 0xffff_ffff);
        assert_eq!(d.sgllen, 1);
        assert_eq!(d.align, 1);
        assert_eq!(d.seg, u64::MAX);
        assert_eq!(d.pfn_window(), (Pfn::new(0), Pfn::new(0xf_ffff)));
    }

    #[test]
    fn contains_needs_the_whole_frame() {
        let d = DmaAttr::window(0x1800, 0x3fff);
        assert!(!d.contains(Pfn::new(1)));
        assert!(d.contains(Pfn::new(2)));
        assert!(d.contains(Pfn::new(3)));
        assert!(!d.contains(Pfn::new(4)));

        let short = DmaAttr::window(0x2000, 0x2ffe);
        assert!(!short.contains(Pfn::new(2)));
    }

    #[test]
    fn empty_window_is_rejected() {
        let d = DmaAttr::window(0x2000, 0x1000);
        assert_eq!(
            d.check_window(),
            Err(PmemError::InvalidDmaWindow {
                lo: 0x2000,
                hi: 0x1000
            })
        );
        assert_eq!(DmaAttr::window(0, 0).check_window(), Ok(()));
    }

    #[test]
    fn large_alignment_is_rejected_for_single_pages() {
        let d = DmaAttr::window(0, u64::MAX).with_align(2 * MMU_PAGESIZE);
        assert_eq!(
            d.check_page_alignment(),
            Err(PmemError::UnsupportedAlignment {
                align: 2 * MMU_PAGESIZE
            })
        );
        assert!(d.with_align(MMU_PAGESIZE).check_page_alignment().is_ok());
    }

    #[test]
    fn covers_compares_byte_bounds() {
        let d = DmaAttr::window(0x1000, 0x2fff);
        assert!(d.covers(Pfn::new(1), Pfn::new(2)));
        assert!(!d.covers(Pfn::new(0), Pfn::new(2)));
        assert!(!d.covers(Pfn::new(1), Pfn::new(3)));
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(MMU_PAGESIZE), 1);
        assert_eq!(pages_for(MMU_PAGESIZE + 1), 2);
    }
}
