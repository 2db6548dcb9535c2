use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Hardware page level (0 = base page).
    const LEVEL: PageLevel;

    fn as_str() -> &'static str;
}

macro_rules! page_size_marker {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $level:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const LEVEL: PageLevel = PageLevel::new($level);

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size_marker!(
    /// 4 KiB page (4096 bytes), the base frame size.
    Size4K, 12, 0, "4K"
);
page_size_marker!(
    /// 2 MiB page (`2_097_152` bytes).
    Size2M, 21, 1, "2M"
);
page_size_marker!(
    /// 1 GiB page (`1_073_741_824` bytes).
    Size1G, 30, 2, "1G"
);

/// Number of hardware page levels this architecture can describe.
pub const MAX_PAGE_LEVELS: usize = 3;

/// Shift of each hardware page level, indexed by level.
const LEVEL_SHIFTS: [u32; MAX_PAGE_LEVELS] = [Size4K::SHIFT, Size2M::SHIFT, Size1G::SHIFT];

/// Runtime page level ("size class").
///
/// Where [`PageSize`] fixes the size at the type level, a `PageLevel` is the
/// value used to index per-size tables (free lists, counters, color counts).
/// Level 0 is the base page; every level above it is a naturally aligned
/// multiple of the base page.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageLevel(u8);

impl PageLevel {
    /// The base (4 KiB) level.
    pub const BASE: Self = Self(0);

    /// # Panics
    /// In const contexts if `level` exceeds [`MAX_PAGE_LEVELS`].
    #[inline]
    #[must_use]
    pub const fn new(level: u8) -> Self {
        assert!((level as usize) < MAX_PAGE_LEVELS, "page level out of range");
        Self(level)
    }

    /// Fallible constructor for levels coming from configuration.
    #[inline]
    #[must_use]
    pub const fn try_new(level: usize) -> Option<Self> {
        if level < MAX_PAGE_LEVELS {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self(level as u8))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Address shift of this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        LEVEL_SHIFTS[self.0 as usize]
    }

    /// Byte size of one page at this level.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.shift()
    }

    /// Shift between this level and the base page, in frame-number bits.
    #[inline]
    #[must_use]
    pub const fn pfn_shift(self) -> u32 {
        self.shift() - Size4K::SHIFT
    }

    /// Number of base frames making up one page at this level.
    #[inline]
    #[must_use]
    pub const fn base_frames(self) -> u64 {
        1 << self.pfn_shift()
    }

    /// The next smaller level, if any.
    #[inline]
    #[must_use]
    pub const fn smaller(self) -> Option<Self> {
        if self.0 == 0 { None } else { Some(Self(self.0 - 1)) }
    }

    /// Iterates all levels `0..count`.
    pub fn up_to(count: usize) -> impl Iterator<Item = Self> {
        (0..count.min(MAX_PAGE_LEVELS)).filter_map(Self::try_new)
    }
}

impl fmt::Display for PageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str(Size4K::as_str()),
            1 => f.write_str(Size2M::as_str()),
            _ => f.write_str(Size1G::as_str()),
        }
    }
}

impl fmt::Debug for PageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageLevel({}/{})", self.0, self)
    }
}
