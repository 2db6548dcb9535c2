use crate::{PageSize, Pfn, Size4K};
use core::fmt;

/// Physical memory address.
///
/// A thin `u64` wrapper that denotes **physical** addresses (host RAM or
/// device-visible DMA addresses). It exists so byte addresses and frame
/// numbers ([`Pfn`]) cannot be mixed up by accident.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// assert_eq!(pa.pfn(), Pfn::new(0x0102_0000));
/// assert_eq!(pa.pfn_round_up(), Pfn::new(0x0102_0001));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
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

    /// Frame number of the base page containing this address.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        Pfn::new(self.0 >> Size4K::SHIFT)
    }

    /// Frame number of the first base page starting at or above this address.
    #[inline]
    #[must_use]
    pub const fn pfn_round_up(self) -> Pfn {
        Pfn::new(self.0.saturating_add(Size4K::SIZE - 1) >> Size4K::SHIFT)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:016X})", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}
