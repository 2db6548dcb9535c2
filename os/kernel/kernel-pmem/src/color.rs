//! Page coloring.
//!
//! A frame's color is the part of its frame number that selects an L2 cache
//! set group. Frames of different colors never compete for the same sets, so
//! the lists are segregated by color and allocations spread colors out.
//!
//! The scheme may configure more colors than the hardware distinguishes
//! (at least [`PmemConfig::min_colors`](crate::PmemConfig)): the extra
//! "logical" colors only spread frames over more bins and lock stripes. Two
//! colors that differ only in those extra high bits are *equivalent*, and a
//! color walk visits all equivalents of a color before moving on to the next
//! hardware color.

use crate::error::ConfigError;
use kernel_info::boot::CacheGeometry;
use kernel_info::memory::{MMU_PAGESIZE, MMU_PAGESHIFT};
use kernel_memory_addresses::{MAX_PAGE_LEVELS, PageLevel, Pfn};
use log::info;

/// Geometry of one page level as seen by the lists.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LevelGeometry {
    /// Page size in bytes.
    pub size: u64,
    /// Address shift.
    pub shift: u32,
    /// Base frames per page.
    pub frames: u64,
    /// Color bins at this level.
    pub colors: u32,
}

/// The coloring scheme, fixed at boot.
#[derive(Debug, Clone)]
pub struct ColoringScheme {
    page_colors: u32,
    hw_colors: u32,
    cpu_page_colors: u32,
    levels: usize,
    level_colors: [u32; MAX_PAGE_LEVELS],
    /// log2 of the number of equivalent bins per level.
    equiv_bits: [u32; MAX_PAGE_LEVELS],
}

impl ColoringScheme {
    /// Derives the scheme from the L2 geometry.
    ///
    /// # Errors
    /// A [`ConfigError`] for a geometry that cannot be colored.
    pub fn new(
        cache: &CacheGeometry,
        cpuset_size: u32,
        page_levels: u32,
        min_colors: u32,
        color_equiv: u32,
    ) -> Result<Self, ConfigError> {
        if !cache.l2_line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(cache.l2_line_size));
        }
        if cache.l2_size <= MMU_PAGESIZE {
            return Err(ConfigError::CacheSize(cache.l2_size));
        }
        if !cpuset_size.is_power_of_two() {
            return Err(ConfigError::CpuSetSize(cpuset_size));
        }
        if !min_colors.is_power_of_two() {
            return Err(ConfigError::MinColors(min_colors));
        }
        if color_equiv != 0 && !color_equiv.is_power_of_two() {
            return Err(ConfigError::ColorEquiv(color_equiv));
        }
        let levels = usize::try_from(page_levels)
            .ok()
            .filter(|l| (1..=MAX_PAGE_LEVELS).contains(l))
            .ok_or(ConfigError::PageLevels(page_levels))?;

        // l2_assoc is 0 for a fully associative cache
        let hw_colors = if cache.l2_assoc == 0 {
            1
        } else {
            let sets = cache.l2_size / (u64::from(cache.l2_assoc) * MMU_PAGESIZE);
            u32::try_from(sets.max(1))
                .unwrap_or(1 << 31)
                .checked_next_power_of_two()
                .unwrap_or(1 << 31)
        };

        let page_colors = hw_colors.max(min_colors);
        let cpu_page_colors = if hw_colors < page_colors { hw_colors } else { 0 };
        let mask = page_colors - 1;

        let mut level_colors = [1; MAX_PAGE_LEVELS];
        for level in PageLevel::up_to(levels) {
            level_colors[level.index()] = (mask >> level.pfn_shift()) + 1;
        }

        let mut equiv_bits = [0; MAX_PAGE_LEVELS];
        if cpu_page_colors != 0 {
            let mut a = page_colors.trailing_zeros() - cpu_page_colors.trailing_zeros();
            for i in 0..levels {
                let colors = level_colors[i];
                if colors <= 1 {
                    continue;
                }
                while colors >> a == 0 {
                    a -= 1;
                }
                equiv_bits[i] = a;
            }
        }
        if color_equiv > 1 {
            let mut a = color_equiv.trailing_zeros().min(15);
            for i in 0..levels {
                let colors = level_colors[i];
                if colors <= 1 {
                    continue;
                }
                while colors >> a == 0 {
                    a -= 1;
                }
                equiv_bits[i] = equiv_bits[i].max(a);
            }
        }

        let scheme = Self {
            page_colors,
            hw_colors,
            cpu_page_colors,
            levels,
            level_colors,
            equiv_bits,
        };
        info!(
            "page coloring: {page_colors} colors ({hw_colors} in hardware), {levels} page levels"
        );
        Ok(scheme)
    }

    /// Number of base-level colors.
    #[inline]
    pub const fn page_colors(&self) -> u32 {
        self.page_colors
    }

    /// Colors the L2 cache can actually tell apart.
    #[inline]
    pub const fn hw_colors(&self) -> u32 {
        self.hw_colors
    }

    /// Hardware colors when fewer than [`page_colors`](Self::page_colors),
    /// else `0`.
    #[inline]
    pub const fn cpu_page_colors(&self) -> u32 {
        self.cpu_page_colors
    }

    /// Number of page levels in use.
    #[inline]
    pub const fn levels(&self) -> usize {
        self.levels
    }

    /// Color bins at `level`.
    #[inline]
    pub const fn colors(&self, level: PageLevel) -> u32 {
        self.level_colors[level.index()]
    }

    /// How many bins are equivalent to any one bin at `level`.
    #[inline]
    pub const fn equiv_width(&self, level: PageLevel) -> u32 {
        1 << self.equiv_bits[level.index()]
    }

    pub fn geometry(&self, level: PageLevel) -> LevelGeometry {
        LevelGeometry {
            size: level.size(),
            shift: level.shift(),
            frames: level.base_frames(),
            colors: self.colors(level),
        }
    }

    /// Color of the `level` page starting at (or containing) `pfn`.
    #[inline]
    pub const fn color_of(&self, pfn: Pfn, level: PageLevel) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let low = (pfn.as_u64() & (self.page_colors as u64 - 1)) as u32;
        low >> level.pfn_shift()
    }

    /// Color at `to` of the page containing a `from` page of color `color`.
    #[inline]
    pub const fn color_at(&self, color: u32, from: PageLevel, to: PageLevel) -> u32 {
        (color >> (to.pfn_shift() - from.pfn_shift())) & (self.colors(to) - 1)
    }

    /// Default color for an object offset (`AS_2_BIN` without an address
    /// space).
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn color_for_offset(&self, offset: u64) -> u32 {
        ((offset >> MMU_PAGESHIFT) & (self.page_colors as u64 - 1)) as u32
    }

    /// Visits every color of `level` once, starting at `start`.
    pub const fn walk(&self, start: u32, level: PageLevel) -> ColorWalk {
        let colors = self.colors(level);
        let eq_bits = self.equiv_bits[level.index()];
        let color_bits = colors.trailing_zeros();
        ColorWalk {
            start: start & (colors - 1),
            step: 0,
            colors,
            eq_count: 1 << eq_bits,
            eq_shift: color_bits - eq_bits,
            hw_mask: (1 << (color_bits - eq_bits)) - 1,
        }
    }
}

/// Color visiting order for one search.
///
/// Equivalent colors share their low (hardware) bits. The walk keeps the
/// hardware color fixed while cycling through its equivalents, then moves to
/// the next hardware color, and stops after every color was produced once.
#[derive(Debug, Clone)]
pub struct ColorWalk {
    start: u32,
    step: u32,
    colors: u32,
    eq_count: u32,
    eq_shift: u32,
    hw_mask: u32,
}

impl Iterator for ColorWalk {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.step >= self.colors {
            return None;
        }
        let i = self.step;
        self.step += 1;

        let hw = ((self.start & self.hw_mask) + i / self.eq_count) & self.hw_mask;
        let k = ((self.start >> self.eq_shift) + i % self.eq_count) & (self.eq_count - 1);
        Some(hw | (k << self.eq_shift))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.colors - self.step) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ColorWalk {}
