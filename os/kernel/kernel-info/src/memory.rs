//! # Physical Memory Layout
//!
//! Architectural constants describing how physical memory is banded for
//! legacy DMA and how the page lists are sized by default.

/// Base page shift in bytes.
pub const MMU_PAGESHIFT: u32 = 12;

/// Base page size in bytes.
pub const MMU_PAGESIZE: u64 = 1 << MMU_PAGESHIFT;

/// First frame at or above 4 GiB (PCI devices / drivers without PAE support).
pub const PFN_4G: u64 = 0x10_0000;

/// First frame at or above 2 GiB.
pub const PFN_2G: u64 = 0x8_0000;

/// First frame at or above 16 MiB (ISA DMA limit).
pub const PFN_16M: u64 = 0x1000;

/// Lower bounds of the architectural address bands, in **descending** order.
///
/// ```text
/// band 0: [4G, physmax]
/// band 1: [2G, 4G)
/// band 2: [16M, 2G)
/// band 3: [0, 16M)
/// ```
///
/// Listing them high to low lets small machines skip the unused upper bands.
pub const ARCH_BANDS: [u64; 4] = [PFN_4G, PFN_2G, PFN_16M, 0];

/// Band index of memory at or above 4 GiB.
pub const BAND_4G: usize = 0;

/// Band index of memory in `[2G, 4G)`.
pub const BAND_2G: usize = 1;

/// Band index of memory in `[16M, 2G)`.
pub const BAND_16M: usize = 2;

/// Band index of memory below 16 MiB.
pub const BAND_0: usize = 3;

/// Highest number of NUMA memory nodes a platform may describe.
pub const MAX_MEM_NODES: usize = 16;

/// Minimum number of color bins, regardless of what the cache geometry implies.
pub const PAGE_COLORS_MIN: u32 = 16;

/// Default number of lock stripes per node and list domain.
pub const NPC_MUTEX: usize = 16;

/// Frames below 16 MiB that general allocations try to leave alone.
pub const DESFREE16M: u64 = 0x380;

/// `maxmem4g >> DESFREE4G_SHIFT` is the desired amount of free memory below 4 GiB.
pub const DESFREE4G_SHIFT: u32 = 4;

const _: () = assert!(PFN_4G > PFN_2G && PFN_2G > PFN_16M && PFN_16M > 0);
const _: () = assert!(NPC_MUTEX.is_power_of_two());
