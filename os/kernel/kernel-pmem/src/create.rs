//! Allocation of owner-bound I/O pages.

use crate::allocator::PageAllocator;
use crate::collab::{OwnerKey, WaitPolicy};
use crate::dma::{DmaAttr, pages_for};
use crate::error::{PmemError, Result};
use crate::frame::{Frame, FrameState};
use crate::lists::{ListEnd, ListKind};
use alloc::vec::Vec;
use kernel_info::boot::NodeId;
use kernel_info::memory::MMU_PAGESIZE;
use kernel_memory_addresses::Pfn;
use log::{debug, warn};

/// Whether the pages of a request must be physically adjacent.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Contiguity {
    #[default]
    Scattered,
    /// Gather the pages in as few runs as the DMA attribute allows.
    Physical,
}

/// A request for pages bound to consecutive offsets of one owner.
#[derive(Debug, Copy, Clone)]
pub struct CreateRequest<'a> {
    /// Identity of the first page; later pages follow at page-size steps.
    pub key: OwnerKey,
    pub bytes: u64,
    pub contiguity: Contiguity,
    pub wait: WaitPolicy,
    pub dma: Option<&'a DmaAttr>,
    /// Node to prefer.
    pub locality: Option<NodeId>,
}

impl<'a> CreateRequest<'a> {
    #[must_use]
    pub const fn new(key: OwnerKey, bytes: u64) -> Self {
        Self {
            key,
            bytes,
            contiguity: Contiguity::Scattered,
            wait: WaitPolicy::NoWait,
            dma: None,
            locality: None,
        }
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguity = Contiguity::Physical;
        self
    }

    #[must_use]
    pub const fn waiting(mut self) -> Self {
        self.wait = WaitPolicy::Wait;
        self
    }

    #[must_use]
    pub const fn with_dma(mut self, dma: &'a DmaAttr) -> Self {
        self.dma = Some(dma);
        self
    }

    #[must_use]
    pub const fn near(mut self, node: NodeId) -> Self {
        self.locality = Some(node);
        self
    }

    /// Identity of the `i`-th page.
    const fn key_at(&self, i: u64) -> OwnerKey {
        OwnerKey::new(self.key.owner, self.key.offset + i * MMU_PAGESIZE)
    }
}

impl PageAllocator<'_> {
    /// Allocates the pages of `req`, binds page `i` under `offset + i` pages
    /// and returns their frame numbers in offset order.
    ///
    /// Every returned frame is `Allocated`, held exclusively, and reachable
    /// through the owner index. On error nothing stays allocated, bound or
    /// reserved.
    ///
    /// # Errors
    /// [`PmemError::ZeroPageCount`], a DMA attribute error,
    /// [`PmemError::AdmissionDenied`], or [`PmemError::Exhausted`] when the
    /// request cannot be met and does not wait.
    ///
    /// # Panics
    /// If one of the identities is already bound.
    pub fn create_io(&self, req: &CreateRequest<'_>) -> Result<Vec<Pfn>> {
        let pages = pages_for(req.bytes);
        if pages == 0 {
            return Err(PmemError::ZeroPageCount);
        }
        if let Some(d) = req.dma {
            d.check_window()?;
            if d.sgllen == 0 {
                return Err(PmemError::InvalidScatterGather);
            }
            if req.contiguity == Contiguity::Scattered {
                d.check_page_alignment()?;
            }
        }

        if !self.env.admission.reserve(pages, req.wait) {
            warn!("admission denied for {pages} I/O pages");
            return Err(PmemError::AdmissionDenied { count: pages });
        }
        let freemem = self.counters().freemem();
        if freemem.saturating_sub(pages) < self.min_free() {
            debug!("waking reclaim: {freemem} frames free, {pages} requested");
            self.env.reclaim.wake();
        }

        let mut out: Vec<&Frame> = Vec::new();
        let mut remaining = pages;
        if req.contiguity == Contiguity::Physical {
            match self.get_contig(&mut remaining, req.dma) {
                Ok(run) => {
                    for frame in run {
                        self.bind_new(frame, req.key_at(out.len() as u64));
                        out.push(frame);
                    }
                }
                Err(e) => {
                    self.env.admission.release(pages);
                    return Err(e);
                }
            }
        }

        while remaining > 0 {
            let key = req.key_at(out.len() as u64);
            let color = self.scheme().color_for_offset(key.offset);
            let frame = match self.find_any(req.dma, color, req.locality) {
                Ok(frame) => frame,
                Err(PmemError::Exhausted) if req.wait == WaitPolicy::Wait => {
                    debug!("no page for {key:?}, waiting");
                    self.env.delay.pause(self.config.retry_ticks);
                    continue;
                }
                Err(e) => {
                    self.unwind(out, pages);
                    return Err(e);
                }
            };
            self.hash_out(frame);
            self.bind_new(frame, key);
            out.push(frame);
            remaining -= 1;
        }
        debug_assert!(
            req.dma
                .is_none_or(|d| out.iter().all(|f| d.contains(f.pfn())))
        );
        Ok(out.iter().map(|f| f.pfn()).collect())
    }

    /// Turns a claimed frame into an allocated page owned by `key`.
    fn bind_new(&self, frame: &Frame, key: OwnerKey) {
        frame.update(|i| i.with_state(FrameState::Allocated));
        self.hash_in(frame, key);
    }

    /// Frees everything a failed request collected and returns its
    /// reservation.
    fn unwind(&self, frames: Vec<&Frame>, reserved: u64) {
        debug!("unwinding {} of {reserved} pages", frames.len());
        for frame in frames {
            self.hash_out(frame);
            self.lists
                .put(&self.tables, frame, ListKind::Free, ListEnd::Tail);
            frame.unlock();
        }
        self.env.admission.release(reserved);
    }
}
