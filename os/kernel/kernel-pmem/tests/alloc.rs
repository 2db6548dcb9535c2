mod common;

use common::*;
use kernel_info::memory::BAND_0;
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_pmem::{BinKey, FrameState, ListKind, PmemError, Urgency};
use std::sync::atomic::Ordering;

const LARGE: PageLevel = PageLevel::new(1);

fn base_bin(color: u32) -> BinKey {
    BinKey {
        node: NODE0,
        band: BAND_0,
        level: PageLevel::BASE,
        color,
    }
}

#[test]
fn taking_from_a_bin_leaves_the_rest() {
    let env = Env::default();
    // 1600 frames over 16 colors
    let pa = boot(&env, &one_node(1599), flat());
    assert_eq!(pa.bin_len(&base_bin(3), ListKind::Free), 100);

    let pfn = pa
        .alloc_page(PageLevel::BASE, 3, Some(NODE0), Urgency::Normal)
        .unwrap();

    assert_eq!(pa.scheme().color_of(pfn, PageLevel::BASE), 3);
    assert_eq!(pa.bin_len(&base_bin(3), ListKind::Free), 99);
    let frame = pa.frame(pfn).unwrap();
    assert_eq!(frame.info().state(), FrameState::Allocated);
    assert!(frame.is_exclusive());
}

#[test]
fn free_returns_to_the_same_bin_head() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xfff), flat());
    let before = pa.counters().freemem();

    let pfn = pa
        .alloc_page(PageLevel::BASE, 7, None, Urgency::Normal)
        .unwrap();
    let bin = pa.bin_of(pfn).unwrap();
    let len = pa.bin_len(&bin, ListKind::Free);
    assert_eq!(env.admission.outstanding(), 1);

    pa.free_page(pfn);
    assert_eq!(pa.bin_of(pfn), Some(bin));
    assert_eq!(pa.bin_len(&bin, ListKind::Free), len + 1);
    assert_eq!(pa.counters().freemem(), before);
    assert_eq!(env.admission.outstanding(), 0);
    assert!(!pa.frame(pfn).unwrap().is_locked());

    let again = pa
        .alloc_page(PageLevel::BASE, 7, None, Urgency::Normal)
        .unwrap();
    assert_eq!(again, pfn);
}

#[test]
fn bins_account_for_every_free_frame() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0x1fff), Default::default());
    assert_eq!(binned_frames(&pa, NODE0), pa.node_free_count(NODE0));
    assert_eq!(pa.node_free_count(NODE0), 0x2000);

    let mut held = Vec::new();
    for color in 0..40 {
        held.push(
            pa.alloc_page(PageLevel::BASE, color % 16, None, Urgency::Normal)
                .unwrap(),
        );
    }
    held.push(pa.alloc_page(LARGE, 0, None, Urgency::Normal).unwrap());
    pa.alloc_specific(Pfn::new(0x1834)).unwrap();
    held.push(Pfn::new(0x1834));
    assert_eq!(binned_frames(&pa, NODE0), pa.node_free_count(NODE0));
    assert_eq!(pa.node_free_count(NODE0), 0x2000 - 41 - 512);

    for pfn in held.iter().step_by(3) {
        pa.free_page(*pfn);
    }
    assert_eq!(binned_frames(&pa, NODE0), pa.node_free_count(NODE0));
    assert_eq!(pa.counters().freemem(), pa.node_free_count(NODE0));
}

#[test]
fn boot_coalesces_aligned_large_pages() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0x2ff), Default::default());
    // one 2M page at 0, then 0x100 base frames
    let big = BinKey {
        level: LARGE,
        color: 0,
        ..base_bin(0)
    };
    assert_eq!(pa.bin_len(&big, ListKind::Free), 1);
    assert_eq!(pa.bin_len(&base_bin(0), ListKind::Free), 0x10);
    assert_eq!(pa.frame(Pfn::new(7)).unwrap().info().page_level(), LARGE);
    assert_eq!(pa.frame(Pfn::new(0x200)).unwrap().info().page_level(), PageLevel::BASE);
}

#[test]
fn empty_color_splits_a_large_page() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0x3ff), Default::default());
    assert_eq!(pa.bin_len(&base_bin(5), ListKind::Free), 0);

    let pfn = pa
        .alloc_page(PageLevel::BASE, 5, None, Urgency::Normal)
        .unwrap();
    assert_eq!(pa.scheme().color_of(pfn, PageLevel::BASE), 5);
    let big = BinKey {
        level: LARGE,
        color: 0,
        ..base_bin(0)
    };
    assert_eq!(pa.bin_len(&big, ListKind::Free), 1);
    assert_eq!(pa.bin_len(&base_bin(5), ListKind::Free), 511 / 16);
    assert_eq!(binned_frames(&pa, NODE0), 0x400 - 1);
}

#[test]
fn large_page_allocation_marks_constituents() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0x3ff), Default::default());
    let pfn = pa.alloc_page(LARGE, 0, None, Urgency::Urgent).unwrap();
    assert!(pfn.is_aligned(LARGE));
    assert_eq!(env.admission.outstanding(), 512);
    assert_eq!(
        pa.frame(pfn + 300).unwrap().info().state(),
        FrameState::Allocated
    );

    pa.free_page(pfn);
    assert_eq!(pa.frame(pfn + 300).unwrap().info().state(), FrameState::Free);
    assert_eq!(env.admission.outstanding(), 0);
    assert_eq!(pa.counters().freemem(), 0x400);
}

#[test]
fn unsupported_level_is_exhausted() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xfff), Default::default());
    assert_eq!(
        pa.alloc_page(PageLevel::new(2), 0, None, Urgency::Normal),
        Err(PmemError::Exhausted)
    );
    assert_eq!(env.admission.outstanding(), 0);
}

#[test]
fn exhaustion_returns_the_reservation() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xf), flat());
    let all: Vec<_> = (0..16)
        .map(|c| pa.alloc_page(PageLevel::BASE, c, None, Urgency::Normal).unwrap())
        .collect();
    assert_eq!(all.len(), 16);
    assert_eq!(
        pa.alloc_page(PageLevel::BASE, 0, None, Urgency::Normal),
        Err(PmemError::Exhausted)
    );
    assert_eq!(env.admission.outstanding(), 16);
}

#[test]
fn denied_admission_changes_nothing() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xfff), flat());
    env.admission.deny.store(true, Ordering::SeqCst);
    assert_eq!(
        pa.alloc_page(PageLevel::BASE, 0, None, Urgency::Normal),
        Err(PmemError::AdmissionDenied { count: 1 })
    );
    assert_eq!(
        pa.alloc_specific(Pfn::new(3)),
        Err(PmemError::AdmissionDenied { count: 1 })
    );
    assert_eq!(pa.counters().freemem(), 0x1000);
}

#[test]
fn specific_frame_is_claimed_once() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xfff), flat());
    pa.alloc_specific(Pfn::new(42)).unwrap();
    assert_eq!(
        pa.frame(Pfn::new(42)).unwrap().info().state(),
        FrameState::Allocated
    );
    assert_eq!(pa.alloc_specific(Pfn::new(42)), Err(PmemError::Exhausted));
    assert_eq!(pa.alloc_specific(Pfn::new(0x5000)), Err(PmemError::InvalidExtent));
    assert_eq!(env.admission.outstanding(), 1);
}

#[test]
fn specific_frame_inside_a_large_page_demotes_it() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0x1ff), Default::default());
    let big = BinKey {
        level: LARGE,
        color: 0,
        ..base_bin(0)
    };
    assert_eq!(pa.bin_len(&big, ListKind::Free), 1);

    pa.alloc_specific(Pfn::new(0x105)).unwrap();
    assert_eq!(pa.bin_len(&big, ListKind::Free), 0);
    assert_eq!(binned_frames(&pa, NODE0), 511);
    let frame = pa.frame(Pfn::new(0x105)).unwrap();
    assert_eq!(frame.info().page_level(), PageLevel::BASE);
    assert_eq!(frame.info().state(), FrameState::Allocated);
    assert!(!pa.frame(Pfn::new(0)).unwrap().is_locked());
}

#[test]
fn busy_frame_is_not_claimed() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xff), flat());
    pa.lock_page(Pfn::new(9)).unwrap();
    assert_eq!(pa.alloc_specific(Pfn::new(9)), Err(PmemError::Exhausted));
    pa.unlock_page(Pfn::new(9)).unwrap();
    assert_eq!(pa.alloc_specific(Pfn::new(9)), Ok(()));
}

#[test]
fn allocation_prefers_the_nearest_node() {
    let env = Env::default();
    let platform = one_node(0xfff).with_node(NODE1, 0x1000, 0x1fff);
    let pa = boot(&env, &platform, flat());

    let pfn = pa
        .alloc_page(PageLevel::BASE, 2, Some(NODE1), Urgency::Normal)
        .unwrap();
    assert!(pfn >= Pfn::new(0x1000));
    // node 0 only has memory below 16M
    let pfn = pa
        .alloc_page(PageLevel::BASE, 2, Some(NODE0), Urgency::Urgent)
        .unwrap();
    assert!(pfn < Pfn::new(0x1000));
    assert_eq!(pa.node_free_count(NODE0), 0xfff);
    assert_eq!(pa.node_free_count(NODE1), 0xfff);
}

#[test]
fn general_allocations_avoid_low_memory() {
    let env = Env::default();
    let platform = one_node(0x1fff);
    let pa = boot(&env, &platform, flat());
    for color in 0..16 {
        let pfn = pa
            .alloc_page(PageLevel::BASE, color, None, Urgency::Normal)
            .unwrap();
        assert!(pfn >= Pfn::new(0x1000), "{pfn:?} is below 16M");
    }
}

#[test]
fn cached_page_keeps_its_owner_until_reused() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xff), flat());
    let key = kernel_pmem::OwnerKey::new(owner(1), 0);
    let pfn = pa.alloc_physical(owner(1), 0).unwrap();
    assert_eq!(env.owners.bound(key), Some(pfn));
    let frame = pa.frame(pfn).unwrap();
    assert!(frame.is_locked() && !frame.is_exclusive());
    assert_eq!(frame.owner(), Some(key));

    pa.unlock_page(pfn).unwrap();
    pa.lock_page(pfn).unwrap();
    pa.cache_page(pfn);
    let bin = pa.bin_of(pfn).unwrap();
    assert_eq!(pa.bin_len(&bin, ListKind::Cache), 1);
    assert_eq!(frame.info().state(), FrameState::Cached);
    assert_eq!(env.owners.bound(key), Some(pfn));
    assert_eq!(env.admission.outstanding(), 0);

    pa.alloc_specific(pfn).unwrap();
    assert_eq!(env.owners.bound(key), None);
    assert_eq!(frame.owner(), None);
    assert_eq!(pa.bin_len(&bin, ListKind::Cache), 0);
}

#[test]
#[should_panic(expected = "in state Free")]
fn freeing_a_free_frame_panics() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xff), flat());
    pa.free_page(Pfn::new(1));
}

#[test]
#[should_panic(expected = "without holding it exclusively")]
fn freeing_an_unlocked_frame_panics() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xff), flat());
    pa.alloc_specific(Pfn::new(1)).unwrap();
    pa.unlock_page(Pfn::new(1)).unwrap();
    pa.free_page(Pfn::new(1));
}

#[test]
#[should_panic(expected = "has no owner")]
fn caching_an_anonymous_frame_panics() {
    let env = Env::default();
    let pa = boot(&env, &one_node(0xff), flat());
    pa.alloc_specific(Pfn::new(1)).unwrap();
    pa.cache_page(Pfn::new(1));
}
