use crate::collab::{Collaborators, OwnerId, OwnerKey, WaitPolicy};
use crate::color::ColoringScheme;
use crate::config::PmemConfig;
use crate::contig::ContigCursor;
use crate::error::{ConfigError, PmemError, Result};
use crate::frame::{Frame, FrameInfo, FrameSegment, FrameState, FrameTable};
use crate::lists::{BinKey, FreeCounters, ListEnd, ListKind, ListStore, Tables};
use crate::policy::{RangePolicy, Urgency};
use crate::range::{RangeTable, first_band};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::{MemNodeConfig, NodeId, PlatformMemory};
use kernel_info::memory::{ARCH_BANDS, MAX_MEM_NODES, MMU_PAGESHIFT, PFN_4G};
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_sync::SpinLock;
use log::{debug, info};

/// The physical page allocator.
///
/// One instance exists for the lifetime of the system. It is built once
/// from the boot-time [`PlatformMemory`] and shared by reference; every
/// operation takes `&self`.
pub struct PageAllocator<'env> {
    pub(crate) config: PmemConfig,
    pub(crate) tables: Tables,
    pub(crate) lists: ListStore,
    pub(crate) contig: SpinLock<ContigCursor>,
    pub(crate) env: Collaborators<'env>,
    /// Node extents; written under this lock by hot-add only.
    nodes: SpinLock<[MemNodeConfig; MAX_MEM_NODES]>,
    physmax: AtomicU64,
    /// Highest frame the range table can describe.
    max_supported: u64,
    min_free: u64,
}

/// Inclusive-overlap of `[lo, hi]` with the frames below 4 GiB.
fn frames_below_4g(lo: u64, hi: u64) -> u64 {
    if lo >= PFN_4G { 0 } else { hi.min(PFN_4G - 1) - lo + 1 }
}

impl<'env> PageAllocator<'env> {
    /// Builds all tables and puts every installed frame on the free lists.
    ///
    /// # Errors
    /// A [`ConfigError`] for an inconsistent configuration or platform.
    pub fn new(
        platform: &PlatformMemory,
        config: PmemConfig,
        env: Collaborators<'env>,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        let nodes = platform.nodes;

        let mut present = 0;
        for (id, n) in platform.present_nodes() {
            if n.base_pfn > n.max_pfn {
                return Err(ConfigError::InvertedExtent(id));
            }
            if let Some((other, _)) = platform
                .present_nodes()
                .find(|(o, m)| *o > id && m.base_pfn <= n.max_pfn && n.base_pfn <= m.max_pfn)
            {
                return Err(ConfigError::OverlappingNodes(id, other));
            }
            present += 1;
        }
        if present == 0 {
            return Err(ConfigError::NoMemory);
        }
        if !platform.present_nodes().any(|(_, n)| n.base_pfn == 0) {
            return Err(ConfigError::NoLowMemory);
        }
        if config.max_memsegs < present {
            return Err(ConfigError::MemsegCapacity(config.max_memsegs));
        }

        let scheme = ColoringScheme::new(
            &platform.cache,
            platform.cpuset_size,
            platform.page_levels,
            config.min_colors,
            config.color_equiv,
        )?;

        let physmax = platform.physmax();
        let max_pfn = physmax.max(platform.dr_max_pfn);
        let spare = config
            .reserved_ranges
            .unwrap_or(2 + MAX_MEM_NODES - present);
        let ranges =
            RangeTable::build(&nodes, max_pfn, spare).map_err(|_| ConfigError::NoLowMemory)?;

        let frames = FrameTable::with_capacity(config.max_memsegs);
        for (_, n) in platform.present_nodes() {
            if frames
                .publish(FrameSegment::new(Pfn::new(n.base_pfn), Pfn::new(n.max_pfn)))
                .is_err()
            {
                return Err(ConfigError::MemsegCapacity(config.max_memsegs));
            }
        }

        let lists = ListStore::new(&scheme, config.lock_stripes);
        if ranges.above_4g() {
            let below: u64 = platform
                .present_nodes()
                .map(|(_, n)| frames_below_4g(n.base_pfn, n.max_pfn))
                .sum();
            lists.counters.maxmem4g.store(below, Ordering::Relaxed);
        }

        let installed: u64 = platform.present_nodes().map(|(_, n)| n.frames()).sum();
        let min_free = if config.min_free == 0 {
            installed / 64
        } else {
            config.min_free
        };
        let first = first_band(max_pfn);
        let max_supported = if first == 0 {
            u64::MAX
        } else {
            ARCH_BANDS[first - 1] - 1
        };

        let allocator = Self {
            config,
            tables: Tables {
                frames,
                ranges,
                scheme,
            },
            lists,
            contig: SpinLock::new(ContigCursor::default()),
            env,
            nodes: SpinLock::new(nodes),
            physmax: AtomicU64::new(physmax),
            max_supported,
            min_free,
        };

        for seg in allocator.tables.frames.segments() {
            allocator.populate(seg);
        }
        info!(
            "physical memory: {installed} frames on {present} nodes, {} free",
            allocator.lists.counters.freemem()
        );
        Ok(allocator)
    }

    /// Hands every frame of `seg` to the free lists, as large as alignment
    /// and range boundaries allow.
    fn populate(&self, seg: &FrameSegment) {
        let t = &self.tables;
        let levels = if self.config.coalesce_large_pages {
            t.scheme.levels()
        } else {
            1
        };
        let last = seg.last();
        let mut pfn = seg.base();
        while pfn <= last {
            let Some(idx) = t.ranges.range_of(pfn) else {
                break;
            };
            let hi = t.ranges.entry(idx).pfn_hi().min(last);
            let level = PageLevel::up_to(levels)
                .filter(|l| pfn.is_aligned(*l) && pfn + (l.base_frames() - 1) <= hi)
                .last()
                .unwrap_or(PageLevel::BASE);

            #[allow(clippy::cast_possible_truncation)]
            let info = FrameInfo::new()
                .with_state(FrameState::Free)
                .with_level(level.index() as u8)
                .with_range(idx as u8);
            for p in 0..level.base_frames() {
                t.frame(pfn + p).set_info(info);
            }
            let base = t.frame(pfn);
            base.lock();
            self.lists.put(t, base, ListKind::Free, ListEnd::Tail);
            base.unlock();
            pfn += level.base_frames();
        }
    }

    #[inline]
    pub fn config(&self) -> &PmemConfig {
        &self.config
    }

    /// Free-frame count below which requests wake the reclaim daemon.
    #[inline]
    pub const fn min_free(&self) -> u64 {
        self.min_free
    }

    #[inline]
    pub const fn scheme(&self) -> &ColoringScheme {
        &self.tables.scheme
    }

    #[inline]
    pub const fn ranges(&self) -> &RangeTable {
        &self.tables.ranges
    }

    #[inline]
    pub const fn counters(&self) -> &FreeCounters {
        &self.lists.counters
    }

    /// Descriptor of `pfn`, if installed.
    #[inline]
    pub fn frame(&self, pfn: Pfn) -> Option<&Frame> {
        self.tables.frames.get(pfn)
    }

    /// Highest installed frame.
    #[inline]
    pub fn physmax(&self) -> Pfn {
        Pfn::new(self.physmax.load(Ordering::Acquire))
    }

    /// Current extent of `node`.
    pub fn node_extent(&self, node: NodeId) -> Option<MemNodeConfig> {
        let nodes = self.nodes.lock();
        nodes.get(node.index()).copied().filter(|n| n.exists)
    }

    /// Pages currently in a bin.
    pub fn bin_len(&self, key: &BinKey, kind: ListKind) -> u64 {
        self.lists.bin_len(key, kind)
    }

    /// The bin a frame is (or would be) listed in.
    pub fn bin_of(&self, pfn: Pfn) -> Option<BinKey> {
        let f = self.frame(pfn)?;
        Some(self.lists.bin_of(&self.tables, f))
    }

    /// Free and cached frames of `node`.
    pub fn node_free_count(&self, node: NodeId) -> u64 {
        self.tables
            .ranges
            .node_entries(node)
            .map(|(_, r)| r.free_frames())
            .sum()
    }

    /// Searches the free lists of `node`.
    ///
    /// Entries are visited top down, colors in walk order; an empty bin
    /// falls back to splitting a larger page.
    pub(crate) fn get_freelist(
        &self,
        node: NodeId,
        level: PageLevel,
        color: u32,
        policy: RangePolicy,
    ) -> Option<&Frame> {
        let t = &self.tables;
        for (_, entry) in t.ranges.node_entries(node) {
            if !policy.allows(entry.band()) {
                continue;
            }
            let (lo, hi) = entry.pfn_bounds();
            let span = level.base_frames() - 1;
            let accept = |f: &Frame| f.pfn() >= lo && f.pfn() + span <= hi;
            for c in t.scheme.walk(color, level) {
                let key = BinKey {
                    node,
                    band: entry.band(),
                    level,
                    color: c,
                };
                let found = self
                    .lists
                    .take(t, &key, ListKind::Free, accept)
                    .or_else(|| {
                        self.lists
                            .split_larger_page(t, node, entry.band(), level, c, lo, hi + 1)
                    });
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    /// Marks a taken page and all of its constituents allocated.
    pub(crate) fn mark_allocated(&self, frame: &Frame) {
        let level = frame.info().page_level();
        for p in 0..level.base_frames() {
            self.tables
                .frame(frame.pfn() + p)
                .update(|i| i.with_state(FrameState::Allocated));
        }
    }

    /// Drops a taken cache-list frame's old identity.
    pub(crate) fn hash_out(&self, frame: &Frame) {
        if let Some(key) = frame.owner() {
            self.env.owners.unbind(key, frame.pfn());
            frame.set_owner(None);
        }
    }

    /// Indexes an allocated frame under `key`.
    ///
    /// # Panics
    /// If `key` is already bound; the caller broke the owner protocol.
    pub(crate) fn hash_in(&self, frame: &Frame, key: OwnerKey) {
        if let Some(other) = self.env.owners.lookup(key) {
            panic!("{key:?} is already bound to {other:?}, cannot bind {:?}", frame.pfn());
        }
        frame.set_owner(Some(key));
        if !self.env.owners.bind(key, frame.pfn()) {
            panic!("binding {:?} under {key:?} failed", frame.pfn());
        }
    }

    /// Allocates one page of `level` from the free lists.
    ///
    /// Nodes are tried nearest to `locality` first. The range policy is
    /// derived from current free memory; if the restricted search fails, the
    /// whole range is searched once more. The page comes back exclusively
    /// locked.
    ///
    /// # Errors
    /// [`PmemError::AdmissionDenied`] or [`PmemError::Exhausted`].
    pub fn alloc_page(
        &self,
        level: PageLevel,
        color: u32,
        locality: Option<NodeId>,
        urgency: Urgency,
    ) -> Result<Pfn> {
        if level.index() >= self.tables.scheme.levels() {
            return Err(PmemError::Exhausted);
        }
        let frames = level.base_frames();
        if !self.env.admission.reserve(frames, WaitPolicy::NoWait) {
            log::warn!("admission denied for a {level} page");
            return Err(PmemError::AdmissionDenied { count: frames });
        }

        let policy = RangePolicy::for_request(
            &self.lists.counters,
            &self.tables.ranges,
            &self.config,
            frames,
            urgency,
        );
        let search = |policy| {
            self.env
                .locality
                .nodes_in_order(locality)
                .find_map(|node| self.get_freelist(node, level, color, policy))
        };
        let found = search(policy).or_else(|| {
            if policy == RangePolicy::FullRange {
                return None;
            }
            debug!("no {level} page under {policy:?}, retrying the full range");
            search(RangePolicy::FullRange)
        });

        let Some(frame) = found else {
            self.env.admission.release(frames);
            return Err(PmemError::Exhausted);
        };
        self.mark_allocated(frame);
        Ok(frame.pfn())
    }

    /// Claims the named frame if it is free.
    ///
    /// A free large page containing it is broken up first; a cached frame
    /// loses its old identity. The frame comes back exclusively locked.
    ///
    /// # Errors
    /// [`PmemError::InvalidExtent`] if the frame is not installed,
    /// [`PmemError::AdmissionDenied`], or [`PmemError::Exhausted`] when the
    /// frame is busy or in use.
    pub fn alloc_specific(&self, pfn: Pfn) -> Result<()> {
        let t = &self.tables;
        let frame = t.frames.get(pfn).ok_or(PmemError::InvalidExtent)?;
        if !self.env.admission.reserve(1, WaitPolicy::NoWait) {
            return Err(PmemError::AdmissionDenied { count: 1 });
        }
        let busy = || {
            self.env.admission.release(1);
            Err(PmemError::Exhausted)
        };

        if !frame.try_lock() {
            return busy();
        }
        let info = frame.info();
        match info.state() {
            FrameState::Free if info.page_level() != PageLevel::BASE => {
                if !self.lists.demote_containing(t, frame) {
                    frame.unlock();
                    return busy();
                }
            }
            FrameState::Free | FrameState::Cached if info.on_list() => {
                self.lists.remove(t, frame);
                self.hash_out(frame);
            }
            _ => {
                frame.unlock();
                return busy();
            }
        }
        self.mark_allocated(frame);
        Ok(())
    }

    /// Returns an allocated page to the head of its free bin and gives its reservation back.
    ///
    /// # Panics
    /// If the page is not installed, not allocated, or not exclusively
    /// locked by the caller.
    pub fn free_page(&self, pfn: Pfn) {
        let t = &self.tables;
        let frame = self.allocated_frame(pfn);
        self.hash_out(frame);
        let level = frame.info().page_level();
        for p in 1..level.base_frames() {
            t.frame(pfn + p).update(|i| i.with_state(FrameState::Free));
        }
        self.lists.put(t, frame, ListKind::Free, ListEnd::Head);
        frame.unlock();
        self.env.admission.release(level.base_frames());
    }

    /// Parks an allocated base page on the tail of its cache bin, keeping
    /// its owner binding so it can be reclaimed.
    ///
    /// # Panics
    /// If the page is not an exclusively locked, allocated base page with
    /// an owner.
    pub fn cache_page(&self, pfn: Pfn) {
        let frame = self.allocated_frame(pfn);
        assert!(
            frame.info().page_level() == PageLevel::BASE,
            "only base pages can be cached, {pfn:?} is larger"
        );
        assert!(frame.owner().is_some(), "caching {pfn:?} which has no owner");
        self.lists
            .put(&self.tables, frame, ListKind::Cache, ListEnd::Tail);
        frame.unlock();
        self.env.admission.release(1);
    }

    fn allocated_frame(&self, pfn: Pfn) -> &Frame {
        let Some(frame) = self.tables.frames.get(pfn) else {
            panic!("releasing {pfn:?} which is not installed");
        };
        let info = frame.info();
        assert!(
            info.state() == FrameState::Allocated,
            "releasing {pfn:?} in state {:?}",
            info.state()
        );
        assert!(
            frame.is_exclusive(),
            "releasing {pfn:?} without holding it exclusively"
        );
        frame
    }

    /// Spins until `pfn` is held exclusively.
    ///
    /// # Errors
    /// [`PmemError::InvalidExtent`] if the frame is not installed.
    pub fn lock_page(&self, pfn: Pfn) -> Result<()> {
        self.tables
            .frames
            .get(pfn)
            .ok_or(PmemError::InvalidExtent)
            .map(Frame::lock)
    }

    /// Releases the caller's hold on `pfn` (exclusive or one shared).
    ///
    /// # Errors
    /// [`PmemError::InvalidExtent`] if the frame is not installed.
    pub fn unlock_page(&self, pfn: Pfn) -> Result<()> {
        self.tables
            .frames
            .get(pfn)
            .ok_or(PmemError::InvalidExtent)
            .map(Frame::unlock)
    }

    /// Allocates one kernel page of any color and indexes it under
    /// `owner` at an offset derived from `seed`.
    ///
    /// The page comes back held shared.
    ///
    /// # Errors
    /// [`PmemError::AdmissionDenied`] or [`PmemError::Exhausted`].
    ///
    /// # Panics
    /// If the derived offset is already bound.
    pub fn alloc_physical(&self, owner: OwnerId, seed: u64) -> Result<Pfn> {
        let key = OwnerKey::new(owner, seed << MMU_PAGESHIFT);
        if !self.env.admission.reserve(1, WaitPolicy::NoWait) {
            return Err(PmemError::AdmissionDenied { count: 1 });
        }
        let color = self.tables.scheme.color_for_offset(key.offset);
        let frame = match self.find_any(None, color, None) {
            Ok(f) => f,
            Err(e) => {
                self.env.admission.release(1);
                return Err(e);
            }
        };
        self.hash_out(frame);
        frame.update(|i| i.with_state(FrameState::Allocated));
        self.hash_in(frame, key);
        frame.downgrade();
        Ok(frame.pfn())
    }

    /// Installs hot-added memory `[base, max]` on `node`.
    ///
    /// The descriptors are published first, then the range table is
    /// extended, and only then do the frames reach the free lists.
    ///
    /// # Errors
    /// [`PmemError::UnknownNode`], [`PmemError::InvalidExtent`],
    /// [`PmemError::MemsegTableFull`] or [`PmemError::RangeTableFull`].
    pub fn add_memory(&self, node: NodeId, base: Pfn, max: Pfn) -> Result<()> {
        if node.index() >= MAX_MEM_NODES {
            return Err(PmemError::UnknownNode(node));
        }
        if base > max || max.as_u64() > self.max_supported {
            return Err(PmemError::InvalidExtent);
        }

        let mut nodes = self.nodes.lock();
        if self.tables.frames.overlaps(base, max) {
            return Err(PmemError::InvalidExtent);
        }
        let current = nodes[node.index()];
        let merged = if current.exists {
            MemNodeConfig::new(
                current.base_pfn.min(base.as_u64()),
                current.max_pfn.max(max.as_u64()),
            )
        } else {
            MemNodeConfig::new(base.as_u64(), max.as_u64())
        };
        let interleaves = nodes.iter().enumerate().any(|(i, n)| {
            i != node.index()
                && n.exists
                && n.base_pfn <= merged.max_pfn
                && merged.base_pfn <= n.max_pfn
        });
        if interleaves {
            return Err(PmemError::InvalidExtent);
        }

        if self.tables.ranges.slots_needed(node, &merged) > self.tables.ranges.free_slots() {
            return Err(PmemError::RangeTableFull);
        }
        let idx = self
            .tables
            .frames
            .publish(FrameSegment::new(base, max))
            .map_err(|_| PmemError::MemsegTableFull)?;
        self.tables.ranges.add_range(node, &merged)?;
        nodes[node.index()] = merged;
        drop(nodes);

        self.physmax.fetch_max(max.as_u64(), Ordering::AcqRel);
        if self.tables.ranges.above_4g() {
            self.lists.counters.maxmem4g.fetch_add(
                frames_below_4g(base.as_u64(), max.as_u64()),
                Ordering::Relaxed,
            );
        }
        if let Some(seg) = self.tables.frames.segment(idx) {
            self.populate(seg);
        }
        info!(
            "hot-added {} frames at {base:?}..={max:?} to {node:?}",
            max - base + 1
        );
        Ok(())
    }

    /// Hot-remove is not supported.
    ///
    /// # Panics
    /// Always.
    pub fn remove_memory(&self, node: NodeId, _base: Pfn, _max: Pfn) -> ! {
        self.tables.ranges.del_range(node)
    }
}
