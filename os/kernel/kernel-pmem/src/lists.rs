//! Segregated free and cache lists.
//!
//! Free bins are keyed by `(node, band, level, color)`, cache bins by
//! `(node, band, color)` for base pages only. A `(node, band)` pair names
//! exactly one range-table entry, so every bin belongs to one entry.
//!
//! Bins are guarded by striped spin locks keyed by `(node, color)`; the free
//! and cache domains use disjoint stripe pools so a thread never needs both.
//! Lists are intrusive: the links live in the frame descriptors and are
//! only written under the stripe lock that owns the bin.
//!
//! Lock order is *frame, then stripe*. Code holding a stripe lock only ever
//! try-locks frames.

use crate::color::ColoringScheme;
use crate::frame::{Frame, FrameInfo, FrameState, FrameTable};
use crate::range::RangeTable;
use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::NodeId;
use kernel_info::memory::{ARCH_BANDS, BAND_4G, MAX_MEM_NODES};
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_sync::StripedLocks;
use log::trace;

/// The immutable-after-boot tables every list operation consults.
pub struct Tables {
    pub frames: FrameTable,
    pub ranges: RangeTable,
    pub scheme: ColoringScheme,
}

impl Tables {
    /// Descriptor for a frame that is known to exist.
    ///
    /// # Panics
    /// If `pfn` has no descriptor; list links and page bases always do.
    pub(crate) fn frame(&self, pfn: Pfn) -> &Frame {
        match self.frames.get(pfn) {
            Some(f) => f,
            None => panic!("no descriptor for linked frame {pfn:?}"),
        }
    }
}

/// Which pool a bin belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListKind {
    Free,
    Cache,
}

/// Where `put` inserts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListEnd {
    Head,
    Tail,
}

/// Identifies one bin.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BinKey {
    pub node: NodeId,
    /// Index into [`ARCH_BANDS`].
    pub band: usize,
    pub level: PageLevel,
    pub color: u32,
}

#[derive(Debug, Copy, Clone)]
struct ListHead {
    head: Pfn,
    tail: Pfn,
    len: u64,
}

impl ListHead {
    const EMPTY: Self = Self {
        head: Pfn::NONE,
        tail: Pfn::NONE,
        len: 0,
    };
}

/// All list heads that hash to one stripe.
pub struct StripeBins {
    heads: Box<[ListHead]>,
}

/// Allocator-wide free counts, in base frames.
///
/// Maintained on every bin mutation. They steer heuristics only; nothing
/// relies on them for correctness.
#[derive(Debug, Default)]
pub struct FreeCounters {
    /// Frames on any list.
    pub freemem: AtomicU64,
    /// Listed frames below 4 GiB.
    pub freemem4g: AtomicU64,
    /// Installed frames below 4 GiB, tracked only when memory may exist
    /// above 4 GiB.
    pub maxmem4g: AtomicU64,
}

impl FreeCounters {
    fn add(&self, band: usize, frames: u64) {
        self.freemem.fetch_add(frames, Ordering::Relaxed);
        if band != BAND_4G {
            self.freemem4g.fetch_add(frames, Ordering::Relaxed);
        }
    }

    fn sub(&self, band: usize, frames: u64) {
        self.freemem.fetch_sub(frames, Ordering::Relaxed);
        if band != BAND_4G {
            self.freemem4g.fetch_sub(frames, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn freemem(&self) -> u64 {
        self.freemem.load(Ordering::Relaxed)
    }
}

/// The list store.
pub struct ListStore {
    stripes: usize,
    levels: usize,
    slots_per_stripe: usize,
    free: StripedLocks<StripeBins>,
    cache: StripedLocks<StripeBins>,
    pub counters: FreeCounters,
}

impl ListStore {
    /// Sizes the bin arrays for `scheme` with `stripes` locks per node and
    /// domain.
    pub fn new(scheme: &ColoringScheme, stripes: usize) -> Self {
        let levels = scheme.levels();
        let slots_per_stripe = (scheme.page_colors() as usize).div_ceil(stripes);
        let bands = ARCH_BANDS.len();
        let free_heads = bands * levels * slots_per_stripe;
        let cache_heads = bands * slots_per_stripe;
        Self {
            stripes,
            levels,
            slots_per_stripe,
            free: StripedLocks::new(stripes * MAX_MEM_NODES, |_| StripeBins {
                heads: vec![ListHead::EMPTY; free_heads].into_boxed_slice(),
            }),
            cache: StripedLocks::new(stripes * MAX_MEM_NODES, |_| StripeBins {
                heads: vec![ListHead::EMPTY; cache_heads].into_boxed_slice(),
            }),
            counters: FreeCounters::default(),
        }
    }

    #[inline]
    const fn stripe_key(&self, key: &BinKey) -> usize {
        key.node.index() * self.stripes + (key.color as usize & (self.stripes - 1))
    }

    #[inline]
    const fn slot(&self, key: &BinKey, kind: ListKind) -> usize {
        let in_stripe = key.color as usize / self.stripes;
        match kind {
            ListKind::Free => {
                (key.band * self.levels + key.level.index()) * self.slots_per_stripe + in_stripe
            }
            ListKind::Cache => key.band * self.slots_per_stripe + in_stripe,
        }
    }

    #[inline]
    fn domain(&self, kind: ListKind) -> &StripedLocks<StripeBins> {
        match kind {
            ListKind::Free => &self.free,
            ListKind::Cache => &self.cache,
        }
    }

    /// The bin `frame` belongs in, derived from its metadata.
    pub fn bin_of(&self, t: &Tables, frame: &Frame) -> BinKey {
        let info = frame.info();
        let entry = t.ranges.entry(usize::from(info.range()));
        let level = info.page_level();
        BinKey {
            node: entry.node(),
            band: entry.band(),
            level,
            color: t.scheme.color_of(frame.pfn(), level),
        }
    }

    /// Number of pages in a bin.
    pub fn bin_len(&self, key: &BinKey, kind: ListKind) -> u64 {
        let stripe = self.domain(kind).lock(self.stripe_key(key));
        stripe.heads[self.slot(key, kind)].len
    }

    /// Inserts a frame the caller holds exclusively.
    ///
    /// # Panics
    /// If the frame is not exclusively locked or already listed.
    pub fn put(&self, t: &Tables, frame: &Frame, kind: ListKind, end: ListEnd) {
        let info = frame.info();
        assert!(
            frame.is_exclusive(),
            "listing frame {:?} that is not exclusively locked",
            frame.pfn()
        );
        assert!(!info.on_list(), "frame {:?} is already listed", frame.pfn());
        let key = self.bin_of(t, frame);
        debug_assert!(kind == ListKind::Free || key.level == PageLevel::BASE);

        let mut stripe = self.domain(kind).lock(self.stripe_key(&key));
        let head = &mut stripe.heads[self.slot(&key, kind)];
        match end {
            ListEnd::Head => {
                frame.set_links(Pfn::NONE, head.head);
                if head.head.is_none() {
                    head.tail = frame.pfn();
                } else {
                    t.frame(head.head).prev.store(frame.pfn().as_u64(), Ordering::Relaxed);
                }
                head.head = frame.pfn();
            }
            ListEnd::Tail => {
                frame.set_links(head.tail, Pfn::NONE);
                if head.tail.is_none() {
                    head.head = frame.pfn();
                } else {
                    t.frame(head.tail).next.store(frame.pfn().as_u64(), Ordering::Relaxed);
                }
                head.tail = frame.pfn();
            }
        }
        head.len += 1;
        let state = match kind {
            ListKind::Free => FrameState::Free,
            ListKind::Cache => FrameState::Cached,
        };
        frame.set_info(info.with_state(state).with_on_list(true));
        drop(stripe);

        self.count(t, &key, kind, info, true);
    }

    /// Unlinks a listed frame the caller holds exclusively.
    ///
    /// # Panics
    /// If the frame is not listed.
    pub fn remove(&self, t: &Tables, frame: &Frame) {
        let info = frame.info();
        assert!(info.is_listed(), "frame {:?} is not listed", frame.pfn());
        debug_assert!(frame.is_exclusive());
        let kind = if info.state() == FrameState::Cached {
            ListKind::Cache
        } else {
            ListKind::Free
        };
        let key = self.bin_of(t, frame);
        let mut stripe = self.domain(kind).lock(self.stripe_key(&key));
        Self::unlink(t, &mut stripe.heads[self.slot(&key, kind)], frame);
        frame.set_info(info.with_on_list(false));
        drop(stripe);

        self.count(t, &key, kind, info, false);
    }

    /// Removes the first frame of a bin that can be locked without waiting
    /// and satisfies `accept`. The frame is returned exclusively locked,
    /// unlinked, and still in its `Free`/`Cached` state.
    ///
    /// At most the bin's current length is scanned.
    pub fn take<'t>(
        &self,
        t: &'t Tables,
        key: &BinKey,
        kind: ListKind,
        accept: impl Fn(&Frame) -> bool,
    ) -> Option<&'t Frame> {
        let mut stripe = self.domain(kind).lock(self.stripe_key(key));
        let head = &mut stripe.heads[self.slot(key, kind)];
        let mut cur = head.head;
        for _ in 0..head.len {
            if cur.is_none() {
                break;
            }
            let frame = t.frame(cur);
            cur = frame.next_link();
            if !frame.try_lock() {
                continue;
            }
            if !accept(frame) {
                frame.unlock();
                continue;
            }
            let info = frame.info();
            debug_assert!(info.is_listed());
            Self::unlink(t, head, frame);
            frame.set_info(info.with_on_list(false));
            drop(stripe);

            self.count(t, key, kind, info, false);
            return Some(frame);
        }
        None
    }

    fn unlink(t: &Tables, head: &mut ListHead, frame: &Frame) {
        let (prev, next) = (frame.prev_link(), frame.next_link());
        if prev.is_none() {
            head.head = next;
        } else {
            t.frame(prev).next.store(next.as_u64(), Ordering::Relaxed);
        }
        if next.is_none() {
            head.tail = prev;
        } else {
            t.frame(next).prev.store(prev.as_u64(), Ordering::Relaxed);
        }
        frame.set_links(Pfn::NONE, Pfn::NONE);
        head.len -= 1;
    }

    fn count(&self, t: &Tables, key: &BinKey, kind: ListKind, info: FrameInfo, add: bool) {
        let entry = t.ranges.entry(usize::from(info.range()));
        let frames = key.level.base_frames();
        let per_kind = match kind {
            ListKind::Free => &entry.free_pages[key.level.index()],
            ListKind::Cache => &entry.cache_pages,
        };
        if add {
            per_kind.fetch_add(1, Ordering::Relaxed);
            entry.total.fetch_add(frames, Ordering::Relaxed);
            self.counters.add(key.band, frames);
        } else {
            per_kind.fetch_sub(1, Ordering::Relaxed);
            entry.total.fetch_sub(frames, Ordering::Relaxed);
            self.counters.sub(key.band, frames);
        }
    }

    /// Breaks the unlisted free page `big` of level `from` into pages of
    /// level `to` and lists them, except one that is returned locked.
    ///
    /// `held` names a piece the caller already holds exclusively; it is the
    /// one kept. Otherwise the first piece satisfying `want` is kept. With
    /// neither, every piece is listed and `None` returned.
    ///
    /// The caller holds `big` exclusively and no stripe lock. Unless kept,
    /// `big` is listed and unlocked here. Other pieces are locked by
    /// spinning: nobody holds a constituent of a free large page for longer
    /// than a failed try-lock of its base.
    pub fn break_up<'t>(
        &self,
        t: &'t Tables,
        big: &'t Frame,
        from: PageLevel,
        to: PageLevel,
        held: Option<Pfn>,
        want: impl Fn(Pfn) -> bool,
    ) -> Option<&'t Frame> {
        debug_assert!(to < from);
        debug_assert!(!big.info().on_list());
        let base = big.pfn();
        let span = from.base_frames();
        let piece = to.base_frames();

        #[allow(clippy::cast_possible_truncation)]
        let to_bits = to.index() as u8;
        for p in 0..span {
            t.frame(base + p).update(|i| i.with_level(to_bits));
        }

        let mut kept = None;
        for p in (0..span).step_by(usize::try_from(piece).unwrap_or(usize::MAX)) {
            let pfn = base + p;
            let frame = t.frame(pfn);
            if held == Some(pfn) {
                kept = Some(frame);
                continue;
            }
            if pfn != base {
                frame.lock();
            }
            if held.is_none() && kept.is_none() && want(pfn) {
                kept = Some(frame);
                continue;
            }
            self.put(t, frame, ListKind::Free, ListEnd::Head);
            frame.unlock();
        }
        trace!("broke {from} page at {base:?} into {to} pages, kept {:?}", kept.map(Frame::pfn));
        kept
    }

    /// Takes the held free frame `frame` out of the free large page that
    /// contains it.
    ///
    /// On success the frame is a base-level free frame, unlisted and still
    /// held by the caller. Fails if the large page is busy or changed.
    pub fn demote_containing(&self, t: &Tables, frame: &Frame) -> bool {
        let info = frame.info();
        let level = info.page_level();
        if info.state() != FrameState::Free || level == PageLevel::BASE {
            return false;
        }
        let base = frame.pfn().align_down(level);
        let big = match t.frames.get(base) {
            Some(b) => b,
            None => return false,
        };
        let own_base = base == frame.pfn();
        if !own_base && !big.try_lock() {
            return false;
        }
        let bi = big.info();
        if bi.state() != FrameState::Free || bi.page_level() != level || !bi.on_list() {
            if !own_base {
                big.unlock();
            }
            return false;
        }
        self.remove(t, big);
        // lists and releases `big` unless it is the held frame
        self.break_up(t, big, level, PageLevel::BASE, Some(frame.pfn()), |_| false);
        true
    }

    /// Fallback when a bin is empty.
    ///
    /// Finds a free larger page of `(node, band)` that contains color
    /// `color` and whose base lies in `[lo, hi)`, then splits it down to
    /// `level`. The returned `level` page has the requested color and comes
    /// back locked.
    #[allow(clippy::too_many_arguments)]
    pub fn split_larger_page<'t>(
        &self,
        t: &'t Tables,
        node: NodeId,
        band: usize,
        level: PageLevel,
        color: u32,
        lo: Pfn,
        hi: Pfn,
    ) -> Option<&'t Frame> {
        let scheme = &t.scheme;
        for bigger in PageLevel::up_to(self.levels).filter(|l| *l > level) {
            let key = BinKey {
                node,
                band,
                level: bigger,
                color: scheme.color_at(color, level, bigger),
            };
            let Some(big) = self.take(t, &key, ListKind::Free, |f| f.pfn() >= lo && f.pfn() < hi)
            else {
                continue;
            };
            let kept = self.break_up(t, big, bigger, level, None, |p| {
                p >= lo && p < hi && scheme.color_of(p, level) == color
            });
            if kept.is_some() {
                return kept;
            }
        }
        None
    }
}
