//! Address-band policy for general allocations.
//!
//! Low memory is scarce: legacy DMA engines can only reach the first 16 MiB,
//! and 32-bit devices the first 4 GiB. General allocations therefore avoid
//! those bands while they run low, and fall back to them only when nothing
//! else is left.

use crate::config::PmemConfig;
use crate::lists::FreeCounters;
use crate::range::RangeTable;
use core::sync::atomic::Ordering;
use kernel_info::memory::{BAND_0, BAND_4G};

/// How much an allocation may dip into reserves.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Urgency {
    #[default]
    Normal,
    /// Must not fail for policy reasons; may use memory below 16 MiB.
    Urgent,
}

/// Which bands a search may take frames from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RangePolicy {
    /// Every band.
    FullRange,
    /// Everything except the band below 16 MiB.
    AboveSixteenMeg,
    /// Only memory at or above 4 GiB.
    AboveFourGig,
}

impl RangePolicy {
    /// Picks the policy for a general allocation of `frames` base frames.
    pub fn for_request(
        counters: &FreeCounters,
        ranges: &RangeTable,
        config: &PmemConfig,
        frames: u64,
        urgency: Urgency,
    ) -> Self {
        let freemem = counters.freemem.load(Ordering::Relaxed);
        let freemem4g = counters.freemem4g.load(Ordering::Relaxed);
        let maxmem4g = counters.maxmem4g.load(Ordering::Relaxed);

        let restrict4g = ranges.above_4g()
            && freemem4g < maxmem4g >> config.desfree4g_shift
            && freemem4g.saturating_mul(2) < freemem;
        if restrict4g {
            return Self::AboveFourGig;
        }

        let freemem16m = ranges.entry(ranges.lowest()).free_frames();
        let restrict16m = freemem != 0
            && urgency == Urgency::Normal
            && (freemem >= freemem16m || freemem16m < config.desfree16m + frames);
        if restrict16m {
            Self::AboveSixteenMeg
        } else {
            Self::FullRange
        }
    }

    /// Whether frames of band `band` may be used.
    #[must_use]
    pub const fn allows(self, band: usize) -> bool {
        match self {
            Self::FullRange => true,
            Self::AboveSixteenMeg => band != BAND_0,
            Self::AboveFourGig => band == BAND_4G,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemNodeConfig;
    use kernel_info::memory::{BAND_16M, BAND_2G, MAX_MEM_NODES, PFN_4G};

    fn table(max: u64) -> RangeTable {
        let mut nodes = [MemNodeConfig::ABSENT; MAX_MEM_NODES];
        nodes[0] = MemNodeConfig::new(0, max);
        RangeTable::build(&nodes, max, 0).unwrap()
    }

    #[test]
    fn bands_allowed_per_policy() {
        assert!(RangePolicy::FullRange.allows(BAND_0));
        assert!(!RangePolicy::AboveSixteenMeg.allows(BAND_0));
        assert!(RangePolicy::AboveSixteenMeg.allows(BAND_16M));
        assert!(!RangePolicy::AboveFourGig.allows(BAND_2G));
        assert!(RangePolicy::AboveFourGig.allows(BAND_4G));
    }

    #[test]
    fn urgent_requests_may_use_low_memory() {
        let t = table(0xfff);
        let c = FreeCounters::default();
        c.freemem.store(100, Ordering::Relaxed);
        let cfg = PmemConfig::default();
        assert_eq!(
            RangePolicy::for_request(&c, &t, &cfg, 1, Urgency::Normal),
            RangePolicy::AboveSixteenMeg
        );
        assert_eq!(
            RangePolicy::for_request(&c, &t, &cfg, 1, Urgency::Urgent),
            RangePolicy::FullRange
        );
    }

    #[test]
    fn sixteen_meg_check_reads_the_lowest_entry() {
        let t = table(0xfff);
        let c = FreeCounters::default();
        c.freemem.store(0x1000, Ordering::Relaxed);
        let cfg = PmemConfig::default();
        let low = t.entry(t.lowest());

        low.total.store(0x2000, Ordering::Relaxed);
        assert_eq!(
            RangePolicy::for_request(&c, &t, &cfg, 1, Urgency::Normal),
            RangePolicy::FullRange
        );

        low.total.store(0x100, Ordering::Relaxed);
        assert_eq!(
            RangePolicy::for_request(&c, &t, &cfg, 1, Urgency::Normal),
            RangePolicy::AboveSixteenMeg
        );
    }

    #[test]
    fn empty_machine_is_unrestricted() {
        let t = table(0xfff);
        let c = FreeCounters::default();
        assert_eq!(
            RangePolicy::for_request(&c, &t, &PmemConfig::default(), 1, Urgency::Normal),
            RangePolicy::FullRange
        );
    }

    #[test]
    fn scarce_low_memory_moves_above_4g() {
        let t = table(PFN_4G + 0xfff);
        assert!(t.above_4g());
        let c = FreeCounters::default();
        c.maxmem4g.store(PFN_4G, Ordering::Relaxed);
        c.freemem4g.store(10, Ordering::Relaxed);
        c.freemem.store(1000, Ordering::Relaxed);
        assert_eq!(
            RangePolicy::for_request(&c, &t, &PmemConfig::default(), 1, Urgency::Normal),
            RangePolicy::AboveFourGig
        );
    }
}
