mod common;

use common::*;
use kernel_info::memory::{BAND_0, MMU_PAGESIZE};
use kernel_memory_addresses::{PageLevel, Pfn};
use kernel_pmem::{BinKey, CreateRequest, DmaAttr, ListKind, OwnerKey, Urgency};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

#[test]
fn same_bin_requests_never_share_a_frame() {
    let threads = 8;
    let per_thread = 30;
    let env = Env::default();
    let pa = boot(&env, &one_node(0xfff), flat());
    let bin = BinKey {
        node: NODE0,
        band: BAND_0,
        level: PageLevel::BASE,
        color: 3,
    };
    let before = pa.bin_len(&bin, ListKind::Free);
    let start = Barrier::new(threads);

    let taken: Vec<Pfn> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    start.wait();
                    (0..per_thread)
                        .map(|_| {
                            pa.alloc_page(PageLevel::BASE, 3, None, Urgency::Normal)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let distinct: HashSet<_> = taken.iter().collect();
    assert_eq!(distinct.len(), threads * per_thread);
    assert!(
        taken
            .iter()
            .all(|p| pa.scheme().color_of(*p, PageLevel::BASE) == 3)
    );
    assert_eq!(
        pa.bin_len(&bin, ListKind::Free),
        before - (threads * per_thread) as u64
    );
}

#[test]
fn mixed_traffic_conserves_frames() {
    let threads = 4;
    let rounds = 50;
    let env = Env::default();
    let pa = boot(&env, &one_node(0x7ff), Default::default());
    let start = Barrier::new(threads + 1);

    thread::scope(|s| {
        for t in 0..threads {
            let (pa, start) = (&pa, &start);
            s.spawn(move || {
                start.wait();
                for r in 0..rounds {
                    let pfn = pa
                        .alloc_page(PageLevel::BASE, (t + r) as u32 % 16, None, Urgency::Normal)
                        .unwrap();
                    pa.free_page(pfn);
                }
            });
        }
        // contiguous and windowed requests race with the general ones
        s.spawn(|| {
            start.wait();
            let dma = DmaAttr::window(0, 0x7f_ffff).with_sgllen(2);
            for r in 0..rounds as u64 {
                let key = OwnerKey::new(owner(1), r * 0x100 * MMU_PAGESIZE);
                let req = CreateRequest::new(key, 6 * MMU_PAGESIZE).with_dma(&dma);
                let req = if r % 2 == 0 { req.contiguous() } else { req };
                if let Ok(pfns) = pa.create_io(&req) {
                    for pfn in pfns {
                        pa.free_page(pfn);
                    }
                }
            }
        });
    });

    assert_eq!(env.admission.outstanding(), 0);
    assert_eq!(env.owners.len(), 0);
    assert_eq!(pa.counters().freemem(), 0x800);
    assert_eq!(binned_frames(&pa, NODE0), 0x800);
    assert!((0..0x800).all(|p| !pa.frame(Pfn::new(p)).unwrap().is_locked()));
}
