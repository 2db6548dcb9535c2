//! Physically contiguous allocation for DMA.
//!
//! The search scans frame numbers linearly, starting where the previous
//! search succeeded. Runs must not cross a segment boundary and are gathered
//! until the request fits the remaining scatter/gather entries.

use crate::allocator::PageAllocator;
use crate::dma::DmaAttr;
use crate::error::{PmemError, Result};
use crate::frame::{Frame, FrameState};
use crate::lists::{ListEnd, ListKind};
use alloc::vec::Vec;
use kernel_info::memory::{MMU_PAGESHIFT, MMU_PAGESIZE, PFN_16M};
use kernel_memory_addresses::{PageLevel, Pfn, PhysicalAddress};
use log::{debug, trace};

/// Where the next contiguous search begins.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ContigCursor {
    /// First frame number to try.
    pub start: u64,
    /// Minimum run length of the previous search.
    pub last_min: u64,
}

/// Search parameters in frame units.
#[derive(Debug, Copy, Clone)]
struct Bounds {
    lo: u64,
    hi: u64,
    /// Segment mask; a run never crosses a multiple of `seg + 1`.
    seg: u64,
    /// Run alignment, `0` when page alignment suffices.
    align: u64,
}

#[inline]
const fn round_up(v: u64, to: u64) -> u64 {
    v.div_ceil(to) * to
}

/// Whether a run of `len` frames from `pfn` would cross a segment boundary.
#[inline]
const fn crosses(pfn: u64, len: u64, seg: u64) -> bool {
    ((pfn + len - 1) & seg) < (pfn & seg)
}

impl PageAllocator<'_> {
    /// Gathers `*pgcnt` frames in as few runs as the DMA attribute allows.
    ///
    /// On success `*pgcnt` holds the number of frames still to be found,
    /// which is at most the unused scatter/gather entries; the caller takes
    /// those one at a time. Frames come back exclusively locked and unlisted,
    /// with any old identity dropped.
    ///
    /// # Errors
    /// [`PmemError::InvalidScatterGather`] for a zero `sgllen`,
    /// [`PmemError::InvalidDmaWindow`] for an empty window,
    /// [`PmemError::Exhausted`] if no suitable runs exist. On error no frame
    /// is held and `*pgcnt` is unchanged.
    pub(crate) fn get_contig(&self, pgcnt: &mut u64, dma: Option<&DmaAttr>) -> Result<Vec<&Frame>> {
        if *pgcnt == 0 {
            return Err(PmemError::ZeroPageCount);
        }
        let highest = self.physmax().as_u64();
        let mut cursor = self.contig.lock();

        let (bounds, mut sgllen, mut minctg) = match dma {
            Some(d) => {
                d.check_window()?;
                if d.sgllen == 0 {
                    return Err(PmemError::InvalidScatterGather);
                }
                let lo = PhysicalAddress::new(d.addr_lo).pfn_round_up().as_u64();
                let hi = PhysicalAddress::new(d.addr_hi).pfn().as_u64().min(highest);
                if lo > hi {
                    return Err(PmemError::Exhausted);
                }
                let align = d.align.max(d.minxfer);
                let bounds = Bounds {
                    lo,
                    hi,
                    seg: d.seg >> MMU_PAGESHIFT,
                    align: if align > MMU_PAGESIZE {
                        align >> MMU_PAGESHIFT
                    } else {
                        0
                    },
                };
                let sgllen = u64::from(d.sgllen);
                let minctg = pgcnt.div_ceil(sgllen);
                if minctg < cursor.last_min || cursor.start < lo || cursor.start > hi {
                    cursor.start = lo;
                }
                (bounds, sgllen, minctg)
            }
            None => {
                let bounds = Bounds {
                    lo: 0,
                    hi: highest,
                    seg: u64::MAX >> MMU_PAGESHIFT,
                    align: 0,
                };
                if *pgcnt < cursor.last_min {
                    cursor.start = 0;
                }
                (bounds, 1, *pgcnt)
            }
        };
        cursor.last_min = minctg;
        if bounds.seg < minctg - 1 {
            debug!("contig: {minctg} frames never fit segment mask {:#x}", bounds.seg);
            return Err(PmemError::Exhausted);
        }

        // Leave the first 16 MiB to devices that cannot reach higher.
        if bounds.hi > PFN_16M && cursor.start < PFN_16M {
            cursor.start = PFN_16M;
        }

        let requested = *pgcnt;
        let mut runs: Vec<&Frame> = Vec::new();
        let align = |pfn: u64| {
            if bounds.align == 0 {
                pfn
            } else {
                round_up(pfn, bounds.align)
            }
        };

        let start = cursor.start;
        let passes = [(start, None), (bounds.lo, Some(start))];
        for (from, until) in passes {
            if until == Some(bounds.lo) {
                break;
            }
            let mut pfn = align(from);
            loop {
                let more = match until {
                    None => pfn + minctg - 1 <= bounds.hi,
                    Some(end) => pfn < end,
                };
                if !more {
                    break;
                }
                if let Some(run) = self.claim_run(&mut pfn, pgcnt, minctg, &bounds) {
                    runs.extend(run);
                    sgllen -= 1;
                    if *pgcnt == 0 || (*pgcnt <= sgllen && bounds.align == 0) {
                        cursor.start = pfn;
                        trace!("contig: {} frames in runs, {} left", runs.len(), *pgcnt);
                        return Ok(runs);
                    }
                    if sgllen == 0 {
                        break;
                    }
                    minctg = pgcnt.div_ceil(sgllen);
                }
                pfn = align(pfn);
            }
            if sgllen == 0 {
                break;
            }
        }
        drop(cursor);

        debug!(
            "contig: no runs for {requested} frames in {:#x}..={:#x}",
            bounds.lo, bounds.hi
        );
        self.release_run(runs);
        *pgcnt = requested;
        Err(PmemError::Exhausted)
    }

    /// Claims up to `*pgcnt` free frames starting at `*pfn`, stopping at a
    /// segment boundary or the top of the window.
    ///
    /// `*pfn` is advanced to the next frame worth trying. Returns the run if
    /// at least `minctg` frames were claimed, deducting them from `*pgcnt`.
    fn claim_run(
        &self,
        pfn: &mut u64,
        pgcnt: &mut u64,
        minctg: u64,
        bounds: &Bounds,
    ) -> Option<Vec<&Frame>> {
        let seg = bounds.seg;
        let first = *pfn;
        if crosses(first, minctg, seg) {
            *pfn = round_up(first, seg + 1);
            return None;
        }

        let mut run = Vec::new();
        let mut i = 0;
        loop {
            let Some(frame) = self.claim_frame(Pfn::new(first + i)) else {
                *pfn += 1;
                break;
            };
            run.push(frame);
            i += 1;
            if i >= *pgcnt || (first + i) & seg == 0 || first + i > bounds.hi {
                break;
            }
        }
        *pfn += i;

        if i >= minctg {
            *pgcnt -= i;
            return Some(run);
        }
        if crosses(*pfn, minctg, seg) {
            *pfn = round_up(*pfn, seg + 1);
        }
        self.release_run(run);
        None
    }

    /// Takes one free or cached frame off its list, breaking up a free
    /// large page around it if needed.
    fn claim_frame(&self, pfn: Pfn) -> Option<&Frame> {
        let t = &self.tables;
        let frame = t.frames.get(pfn)?;
        if !frame.try_lock() {
            return None;
        }
        let info = frame.info();
        match info.state() {
            FrameState::Free if info.page_level() != PageLevel::BASE => {
                if self.lists.demote_containing(t, frame) {
                    return Some(frame);
                }
            }
            FrameState::Free | FrameState::Cached if info.on_list() => {
                self.lists.remove(t, frame);
                self.hash_out(frame);
                return Some(frame);
            }
            _ => {}
        }
        frame.unlock();
        None
    }

    /// Puts claimed frames back on the free tails and unlocks them.
    pub(crate) fn release_run(&self, run: Vec<&Frame>) {
        for frame in run {
            self.lists
                .put(&self.tables, frame, ListKind::Free, ListEnd::Tail);
            frame.unlock();
        }
    }
}
