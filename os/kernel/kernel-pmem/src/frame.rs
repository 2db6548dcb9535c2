//! Frame descriptors.
//!
//! One [`Frame`] exists per installed physical page for the lifetime of the
//! system. Descriptors are grouped into [`FrameSegment`]s, one per physically
//! contiguous extent, and looked up by frame number through the
//! [`FrameTable`]. Segments are append-only so hot-added memory can be
//! published while other CPUs resolve frame numbers without locking.

use crate::collab::{OwnerId, OwnerKey};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_sync::{PublishArray, RawRwSpin};

/// Life-cycle state of a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameState {
    /// Descriptor exists but the memory has not been handed to the lists yet.
    Absent = 0,
    /// On (or belonging to a large page on) a free list; no owner.
    Free = 1,
    /// On a cache list; still indexed under its previous owner.
    Cached = 2,
    /// Handed out.
    Allocated = 3,
}

impl FrameState {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Free,
            2 => Self::Cached,
            3 => Self::Allocated,
            _ => Self::Absent,
        }
    }
}

/// Packed frame metadata.
///
/// Written only by the holder of the frame's exclusive lock, or by the
/// holder of the enclosing free large page while it is being broken up.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FrameInfo {
    #[bits(2)]
    pub state: FrameState,
    /// Page level of the (large) page this frame belongs to.
    #[bits(2)]
    pub level: u8,
    /// Linked into a free or cache bin. Only the base frame of a large page
    /// is linked.
    pub on_list: bool,
    /// Range-table slot holding the frame.
    #[bits(8)]
    pub range: u8,
    #[bits(51)]
    __reserved: u64,
}

impl FrameInfo {
    #[inline]
    #[must_use]
    pub fn page_level(self) -> PageLevel {
        PageLevel::try_new(usize::from(self.level())).unwrap_or(PageLevel::BASE)
    }

    /// Free or cached and linked into a bin.
    #[inline]
    #[must_use]
    pub fn is_listed(self) -> bool {
        self.on_list() && matches!(self.state(), FrameState::Free | FrameState::Cached)
    }
}

/// Descriptor of one physical frame.
pub struct Frame {
    pfn: Pfn,
    lock: RawRwSpin,
    info: AtomicU64,
    // Bin links; written only under the owning stripe lock.
    pub(crate) next: AtomicU64,
    pub(crate) prev: AtomicU64,
    owner: AtomicU64,
    offset: AtomicU64,
}

impl Frame {
    fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            lock: RawRwSpin::new(),
            info: AtomicU64::new(FrameInfo::new().into_bits()),
            next: AtomicU64::new(Pfn::NONE.as_u64()),
            prev: AtomicU64::new(Pfn::NONE.as_u64()),
            owner: AtomicU64::new(0),
            offset: AtomicU64::new(0),
        }
    }

    #[inline]
    pub const fn pfn(&self) -> Pfn {
        self.pfn
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        FrameInfo::from_bits(self.info.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_info(&self, info: FrameInfo) {
        self.info.store(info.into_bits(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn update(&self, f: impl FnOnce(FrameInfo) -> FrameInfo) {
        self.set_info(f(self.info()));
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.lock.try_lock_exclusive()
    }

    #[inline]
    pub fn lock(&self) {
        self.lock.lock_exclusive();
    }

    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        self.lock.try_lock_shared()
    }

    /// Drops the exclusive hold, or one shared hold.
    #[inline]
    pub fn unlock(&self) {
        if self.lock.is_exclusive() {
            self.lock.unlock_exclusive();
        } else {
            self.lock.unlock_shared();
        }
    }

    #[inline]
    pub fn downgrade(&self) {
        self.lock.downgrade();
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.lock.is_exclusive()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// The identity the frame is indexed under, if any.
    pub fn owner(&self) -> Option<OwnerKey> {
        let owner = OwnerId::new(self.owner.load(Ordering::Acquire))?;
        Some(OwnerKey::new(owner, self.offset.load(Ordering::Relaxed)))
    }

    pub(crate) fn set_owner(&self, key: Option<OwnerKey>) {
        match key {
            Some(k) => {
                self.offset.store(k.offset, Ordering::Relaxed);
                self.owner.store(k.owner.get(), Ordering::Release);
            }
            None => self.owner.store(0, Ordering::Release),
        }
    }

    #[inline]
    pub(crate) fn next_link(&self) -> Pfn {
        Pfn::new(self.next.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn prev_link(&self) -> Pfn {
        Pfn::new(self.prev.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_links(&self, prev: Pfn, next: Pfn) {
        self.prev.store(prev.as_u64(), Ordering::Relaxed);
        self.next.store(next.as_u64(), Ordering::Relaxed);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Frame")
            .field("pfn", &self.pfn)
            .field("state", &info.state())
            .field("level", &info.level())
            .field("on_list", &info.on_list())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Descriptors for the frames `[base, last]`.
pub struct FrameSegment {
    base: Pfn,
    frames: Box<[Frame]>,
}

impl FrameSegment {
    /// Builds `Absent` descriptors for `[base, last]`.
    #[must_use]
    pub fn new(base: Pfn, last: Pfn) -> Self {
        let frames: Vec<_> = (base.as_u64()..=last.as_u64())
            .map(|p| Frame::new(Pfn::new(p)))
            .collect();
        Self {
            base,
            frames: frames.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn base(&self) -> Pfn {
        self.base
    }

    /// Last frame number covered (inclusive).
    #[inline]
    pub fn last(&self) -> Pfn {
        self.base + (self.frames.len() as u64).saturating_sub(1)
    }

    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base && pfn <= self.last()
    }

    #[inline]
    pub fn get(&self, pfn: Pfn) -> Option<&Frame> {
        if pfn < self.base {
            return None;
        }
        usize::try_from(pfn - self.base)
            .ok()
            .and_then(|i| self.frames.get(i))
    }
}

/// All frame descriptors, resolved by frame number.
pub struct FrameTable {
    segments: PublishArray<FrameSegment>,
}

impl FrameTable {
    #[must_use]
    pub fn with_capacity(segments: usize) -> Self {
        Self {
            segments: PublishArray::with_capacity(segments),
        }
    }

    /// Publishes a segment. Readers see it only once fully built.
    ///
    /// # Errors
    /// Hands the segment back if the table is full.
    pub fn publish(&self, segment: FrameSegment) -> Result<usize, FrameSegment> {
        self.segments.push(segment)
    }

    /// Resolves a frame number to its descriptor.
    pub fn get(&self, pfn: Pfn) -> Option<&Frame> {
        self.segments.iter().find_map(|s| s.get(pfn))
    }

    /// Whether any published segment covers part of `[lo, hi]`.
    pub fn overlaps(&self, lo: Pfn, hi: Pfn) -> bool {
        self.segments
            .iter()
            .any(|s| s.base() <= hi && lo <= s.last())
    }

    pub fn segments(&self) -> impl Iterator<Item = &FrameSegment> {
        self.segments.iter()
    }

    /// The segment published at `idx`.
    pub fn segment(&self, idx: usize) -> Option<&FrameSegment> {
        self.segments.get(idx)
    }
}
