use crate::{PageLevel, PhysicalAddress, Size4K};
use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical frame number: a physical address shifted right by the base page
/// shift.
///
/// Frame numbers index the frame-descriptor table and are the unit every
/// allocator structure is expressed in.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    /// Sentinel for "no frame" in intrusive links.
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Byte address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << Size4K::SHIFT)
    }

    /// Byte address of the last byte of this frame.
    #[inline]
    #[must_use]
    pub const fn last_byte(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 << Size4K::SHIFT) + (Size4K::SIZE - 1))
    }

    /// Rounds down to the first frame of the enclosing page of `level`.
    #[inline]
    #[must_use]
    pub const fn align_down(self, level: PageLevel) -> Self {
        Self(self.0 & !(level.base_frames() - 1))
    }

    /// Whether this frame starts a page of `level`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, level: PageLevel) -> bool {
        self.0 & (level.base_frames() - 1) == 0
    }

    /// Rounds up to a multiple of `align` (power of two, in frames).
    #[inline]
    #[must_use]
    pub const fn round_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, frames: u64) -> Option<Self> {
        match self.0.checked_add(frames) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("Pfn(none)")
        } else {
            write!(f, "Pfn(0x{:x})", self.0)
        }
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Pfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Pfn {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl From<u64> for Pfn {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Pfn> for u64 {
    #[inline]
    fn from(pfn: Pfn) -> Self {
        pfn.as_u64()
    }
}
