//! Layout dispatch scenarios: which arena an allocation lands in, per
//! policy.

use strata::device::mmap::MmapHeap;
use strata::device::{Device, DeviceKind, DeviceList};
use strata::{ArenaLayout, Config, Runtime};

fn runtime_with(layout: ArenaLayout, tweak: impl FnOnce(&mut Config)) -> Runtime {
    let heap = MmapHeap::probe();
    let mut cfg = Config::defaults(heap.device_list());
    cfg.layout = layout;
    tweak(&mut cfg);
    Runtime::new(cfg, Box::new(heap)).unwrap()
}

/// Resolves a pointer to its arena slot through the extent index.
fn slot_of(rt: &Runtime, ptr: *mut u8) -> usize {
    rt.extents().lookup(ptr as usize).expect("allocation must lie in an extent")
}

#[test]
fn exclusive_arenas_separate_threads() {
    let rt = runtime_with(ArenaLayout::ExclusiveArenas, |_| {});

    let [(ptr_a, slot_a), (ptr_b, slot_b)] = std::thread::scope(|s| {
        let a = s.spawn(|| {
            let p = rt.alloc(1, 64);
            (p as usize, slot_of(&rt, p))
        });
        let b = s.spawn(|| {
            let p = rt.alloc(1, 64);
            (p as usize, slot_of(&rt, p))
        });
        [a.join().unwrap(), b.join().unwrap()]
    });

    assert_ne!(slot_a, slot_b, "two threads must land in two arenas");
    assert_ne!(ptr_a, ptr_b);
    // Same site, different slots: the site id does not matter here.
    rt.free(ptr_a as *mut u8);
    rt.free(ptr_b as *mut u8);
}

#[test]
fn shared_site_arenas_key_on_the_site() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |_| {});

    let p1 = rt.alloc(3, 64);
    let p2 = rt.alloc(3, 4096);
    let q = rt.alloc(4, 64);

    assert_eq!(slot_of(&rt, p1), slot_of(&rt, p2), "one arena per site");
    assert_ne!(slot_of(&rt, p1), slot_of(&rt, q), "distinct sites, distinct arenas");

    // Site assignment is sticky across many lookups.
    let (slot, fresh) = rt.sites().site_arena(3);
    assert!(!fresh);
    for _ in 0..8 {
        assert_eq!(rt.sites().site_arena(3), (slot, false));
    }

    rt.free(p1);
    rt.free(p2);
    rt.free(q);
}

#[test]
fn big_small_promotion_is_permanent() {
    const THRESHOLD: usize = 1 << 20;
    let rt = runtime_with(ArenaLayout::BigSmallArenas, |cfg| {
        cfg.big_small_threshold = THRESHOLD;
    });
    let max_threads = rt.config().max_threads;

    // Small allocations share the calling thread's arena.
    let small = rt.alloc(7, 1024);
    let small_slot = slot_of(&rt, small);
    assert!(small_slot < max_threads);
    assert!(!rt.sites().is_big(7));

    // Crossing the threshold promotes the site to its own arena.
    let big = rt.alloc(7, THRESHOLD + 1);
    let big_slot = slot_of(&rt, big);
    assert!(rt.sites().is_big(7));
    assert_ne!(big_slot, small_slot);
    assert!(big_slot >= max_threads, "big arenas sit past the per-thread range");

    // Once big, always big: small allocations follow the site now.
    let after = rt.alloc(7, 1024);
    assert_eq!(slot_of(&rt, after), big_slot);
    let tiny = rt.alloc(7, 8);
    assert!(rt.sites().is_big(7));
    assert_eq!(slot_of(&rt, tiny), big_slot);

    for p in [small, big, after, tiny] {
        rt.free(p);
    }
}

#[test]
fn device_arenas_split_by_tier() {
    // Two synthetic devices on the same node: tier arithmetic is what is
    // under test, not kernel placement.
    let devices = DeviceList::new(vec![
        Device { id: 0, kind: DeviceKind::Dram, numa_node: 0 },
        Device { id: 1, kind: DeviceKind::Dram, numa_node: 0 },
    ]);
    let heap = MmapHeap::with_devices(devices);
    let mut cfg = Config::defaults(heap.device_list());
    cfg.layout = ArenaLayout::ExclusiveDeviceArenas;
    let lower = cfg.lower_device;
    cfg.site_devices = vec![(5, lower)];
    let rt = Runtime::new(cfg, Box::new(heap)).unwrap();

    let upper_ptr = rt.alloc(6, 64); // no preference: default = upper tier
    let lower_ptr = rt.alloc(5, 64); // pinned to the lower tier

    let upper_slot = slot_of(&rt, upper_ptr);
    let lower_slot = slot_of(&rt, lower_ptr);
    assert_eq!(lower_slot, upper_slot + 1, "upper and lower interleave per thread");
    assert_eq!(upper_slot % 2, 0);

    rt.free(upper_ptr);
    rt.free(lower_ptr);
}

#[test]
fn site_slots_wrap_at_the_arena_limit() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |cfg| {
        cfg.max_arenas = 4;
    });

    let mut ptrs = Vec::new();
    for site in 1..=3u32 {
        let p = rt.alloc(site, 64);
        assert_eq!(slot_of(&rt, p), site as usize, "slots 1..3 in assignment order");
        ptrs.push(p);
    }
    // The next distinct site wraps onto slot 0 and shares whatever lives
    // there.
    let wrapped = rt.alloc(4, 64);
    assert_eq!(slot_of(&rt, wrapped), 0);
    ptrs.push(wrapped);

    for p in ptrs {
        rt.free(p);
    }
}

#[test]
fn zero_size_and_zero_site_pass_through() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |_| {});

    let no_site = rt.alloc(0, 64);
    assert!(!no_site.is_null());
    assert!(rt.extents().lookup(no_site as usize).is_none());

    let no_size = rt.alloc(3, 0);
    assert!(rt.extents().lookup(no_size as usize).is_none());

    assert!(rt.extents().is_empty(), "pass-through never records extents");
    rt.free(no_site);
    rt.free(no_size);
}

#[test]
fn logical_size_survives_alloc_free_round_trip() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |cfg| {
        cfg.profile_allocs = true;
    });

    let p = rt.alloc(3, 500);
    let slot = slot_of(&rt, p);
    assert_eq!(rt.logical_size(slot), 500);
    rt.free(p);
    assert_eq!(rt.logical_size(slot), 0, "free must subtract exactly what alloc added");
}

#[test]
fn realloc_replaces_the_tracked_size() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |cfg| {
        cfg.profile_allocs = true;
    });

    let p = rt.alloc(3, 100);
    let q = rt.realloc(3, p, 200);
    assert_eq!(rt.tracked_size(q), Some(200));
    let r = rt.realloc(3, q, 50);
    assert_eq!(rt.tracked_size(r), Some(50));
    assert_eq!(rt.logical_size(slot_of(&rt, r)), 50);
    rt.free(r);
    assert_eq!(rt.logical_size(rt.sites().site_arena(3).0 % rt.config().max_arenas), 0);
}

#[test]
fn aligned_allocations_land_in_arenas() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |_| {});
    let p = rt.aligned_alloc(9, 256, 100);
    assert_eq!(p as usize % 256, 0);
    assert!(rt.extents().lookup(p as usize).is_some());
    rt.free(p);
}

#[test]
fn calloc_zeroes_arena_memory() {
    let rt = runtime_with(ArenaLayout::SharedSiteArenas, |_| {});
    let p = rt.calloc(11, 16, 32);
    assert!(rt.extents().lookup(p as usize).is_some());
    for i in 0..(16 * 32) {
        assert_eq!(unsafe { *p.add(i) }, 0);
    }
    rt.free(p);
}
