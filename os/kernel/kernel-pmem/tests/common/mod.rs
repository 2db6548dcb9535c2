#![allow(dead_code)]

use kernel_info::boot::{CacheGeometry, NodeId, PlatformMemory};
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_pmem::collab::{Admission, Delay, NearestFirst, OwnerIndex, Reclaim};
use kernel_pmem::{
    BinKey, Collaborators, ListKind, OwnerId, OwnerKey, PageAllocator, PmemConfig, WaitPolicy,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Owner index backed by a map.
#[derive(Default)]
pub struct MapIndex {
    map: Mutex<HashMap<OwnerKey, Pfn>>,
}

impl MapIndex {
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn bound(&self, key: OwnerKey) -> Option<Pfn> {
        self.lookup(key)
    }
}

impl OwnerIndex for MapIndex {
    fn bind(&self, key: OwnerKey, pfn: Pfn) -> bool {
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, pfn);
        true
    }

    fn unbind(&self, key: OwnerKey, pfn: Pfn) {
        let removed = self.map.lock().unwrap().remove(&key);
        assert_eq!(removed, Some(pfn), "unbinding {key:?} from the wrong frame");
    }

    fn lookup(&self, key: OwnerKey) -> Option<Pfn> {
        self.map.lock().unwrap().get(&key).copied()
    }
}

/// Admission that grants everything unless told to deny, and tracks the
/// outstanding reservation.
#[derive(Default)]
pub struct Budget {
    pub deny: AtomicBool,
    pub outstanding: AtomicU64,
    pub denied: AtomicU64,
}

impl Budget {
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Admission for Budget {
    fn reserve(&self, count: u64, _wait: WaitPolicy) -> bool {
        if self.deny.load(Ordering::SeqCst) {
            self.denied.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        true
    }

    fn release(&self, count: u64) {
        let before = self.outstanding.fetch_sub(count, Ordering::SeqCst);
        assert!(before >= count, "released {count} of {before} reserved frames");
    }
}

#[derive(Default)]
pub struct WakeCounter(pub AtomicU64);

impl Reclaim for WakeCounter {
    fn wake(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CountingDelay(pub AtomicU64);

impl CountingDelay {
    pub fn pauses(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Delay for CountingDelay {
    fn pause(&self, _ticks: u32) {
        self.0.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }
}

#[derive(Default)]
pub struct Env {
    pub owners: MapIndex,
    pub admission: Budget,
    pub reclaim: WakeCounter,
    pub locality: NearestFirst,
    pub delay: CountingDelay,
}

impl Env {
    pub fn collab(&self) -> Collaborators<'_> {
        Collaborators {
            owners: &self.owners,
            admission: &self.admission,
            reclaim: &self.reclaim,
            locality: &self.locality,
            delay: &self.delay,
        }
    }
}

pub const NODE0: NodeId = NodeId::new(0);
pub const NODE1: NodeId = NodeId::new(1);

/// One node `[0, max]` with the default 16-color cache.
pub fn one_node(max: u64) -> PlatformMemory {
    PlatformMemory::new(CacheGeometry::default()).with_node(NODE0, 0, max)
}

/// Base pages only.
pub fn flat() -> PmemConfig {
    PmemConfig {
        coalesce_large_pages: false,
        ..PmemConfig::default()
    }
}

pub fn boot<'e>(env: &'e Env, platform: &PlatformMemory, config: PmemConfig) -> PageAllocator<'e> {
    PageAllocator::new(platform, config, env.collab()).expect("valid platform")
}

pub fn owner(id: u64) -> OwnerId {
    OwnerId::new(id).unwrap()
}

/// Every bin of `node`, with its page count.
pub fn bins(pa: &PageAllocator<'_>, node: NodeId) -> Vec<(BinKey, ListKind, u64)> {
    let scheme = pa.scheme();
    let mut out = Vec::new();
    for (_, entry) in pa.ranges().node_entries(node) {
        for level in PageLevel::up_to(scheme.levels()) {
            for color in 0..scheme.colors(level) {
                let key = BinKey {
                    node,
                    band: entry.band(),
                    level,
                    color,
                };
                out.push((key, ListKind::Free, pa.bin_len(&key, ListKind::Free)));
                if level == PageLevel::BASE {
                    out.push((key, ListKind::Cache, pa.bin_len(&key, ListKind::Cache)));
                }
            }
        }
    }
    out
}

/// Frames held in the bins of `node`.
pub fn binned_frames(pa: &PageAllocator<'_>, node: NodeId) -> u64 {
    bins(pa, node)
        .iter()
        .map(|(key, _, len)| len * key.level.base_frames())
        .sum()
}
