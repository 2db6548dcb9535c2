//! Allocator tunables.
//!
//! Defaults mirror the compile-time constants in [`kernel_info::memory`].

use crate::error::ConfigError;
use kernel_info::memory::{DESFREE16M, DESFREE4G_SHIFT, NPC_MUTEX, PAGE_COLORS_MIN};

/// Tunables for [`PageAllocator`](crate::PageAllocator).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PmemConfig {
    /// Lower bound on the number of color bins (power of two).
    pub min_colors: u32,
    /// Extra number of equivalent bins a color search may scan (zero or a
    /// power of two).
    pub color_equiv: u32,
    /// Lock stripes per node and list domain (power of two).
    pub lock_stripes: usize,
    /// Frames below 16 MiB that general allocations try to leave alone.
    pub desfree16m: u64,
    /// General allocations move above 4 GiB when free low memory drops below
    /// `maxmem4g >> desfree4g_shift`.
    pub desfree4g_shift: u32,
    /// Free-frame count below which the reclaim daemon is woken.
    /// `0` selects 1/64 of installed memory.
    pub min_free: u64,
    /// Ticks to sleep between attempts of a waiting request.
    pub retry_ticks: u32,
    /// Populate the lists with the largest aligned page size at boot.
    pub coalesce_large_pages: bool,
    /// Spare range-table slots for memory hot-add. `None` reserves two
    /// boundary splits plus one per absent node.
    pub reserved_ranges: Option<usize>,
    /// Capacity of the frame-descriptor segment table.
    pub max_memsegs: usize,
}

impl Default for PmemConfig {
    fn default() -> Self {
        Self {
            min_colors: PAGE_COLORS_MIN,
            color_equiv: 0,
            lock_stripes: NPC_MUTEX,
            desfree16m: DESFREE16M,
            desfree4g_shift: DESFREE4G_SHIFT,
            min_free: 0,
            retry_ticks: 10,
            coalesce_large_pages: true,
            reserved_ranges: None,
            max_memsegs: 32,
        }
    }
}

impl PmemConfig {
    /// Checks the values that are independent of the platform.
    ///
    /// # Errors
    /// The first offending field as a [`ConfigError`].
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_colors.is_power_of_two() {
            return Err(ConfigError::MinColors(self.min_colors));
        }
        if self.color_equiv != 0 && !self.color_equiv.is_power_of_two() {
            return Err(ConfigError::ColorEquiv(self.color_equiv));
        }
        if !self.lock_stripes.is_power_of_two() {
            return Err(ConfigError::LockStripes(self.lock_stripes));
        }
        Ok(())
    }
}
