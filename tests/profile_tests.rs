//! Interval profiling end to end: the pagemap profiler driven by the real
//! timer/signal scheduler.
//!
//! Realtime signal delivery is process-global, so these tests take a lock
//! and run one scheduler at a time.

use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use strata::device::mmap::MmapHeap;
use strata::{ArenaLayout, Config, Report, Runtime};

static SCHEDULER_LOCK: Mutex<()> = Mutex::new(());
static TRACING: Once = Once::new();

/// Scheduler diagnostics on demand: `RUST_LOG=strata=debug cargo test`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn profiling_runtime(tweak: impl FnOnce(&mut Config)) -> Runtime {
    init_tracing();
    let heap = MmapHeap::probe();
    let mut cfg = Config::defaults(heap.device_list());
    cfg.layout = ArenaLayout::SharedSiteArenas;
    cfg.should_profile = true;
    cfg.profile_rss = true;
    cfg.profile_rate_nsec = 40_000_000; // 40ms ticks
    tweak(&mut cfg);
    Runtime::new(cfg, Box::new(heap)).unwrap()
}

fn wait_for_intervals(rt: &Runtime, target: usize) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match rt.cur_interval() {
            Some(cur) if cur >= target => return,
            _ => {
                assert!(Instant::now() < deadline, "profiler made no progress");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Every interval array must be exactly as long as its record says.
fn assert_dense_series(report: &Report) {
    for arena in &report.arenas {
        let rss = arena.rss.as_ref().expect("rss profiling was on");
        assert_eq!(
            rss.intervals.len(),
            arena.num_intervals,
            "arena {} series must stay dense",
            arena.slot
        );
        assert_eq!(
            rss.peak,
            rss.intervals.iter().copied().max().unwrap_or(0),
            "peak is the max over intervals"
        );
        for event in &arena.events {
            assert_eq!(event.intervals.len(), arena.num_intervals);
        }
    }
}

#[test]
fn rss_series_follow_the_ticks() {
    let _guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let rt = profiling_runtime(|_| {});

    let size = 256 * 1024;
    let p = rt.alloc(3, size);
    assert!(!p.is_null());
    // Touch every page so residency is observable.
    unsafe { std::ptr::write_bytes(p, 0xa5, size) };

    wait_for_intervals(&rt, 4);
    let report = rt.shutdown().expect("profiling ran");

    assert!(!report.is_empty());
    assert_dense_series(&report);

    let slot = rt.extents().lookup(p as usize).expect("block still live");
    let arena = report.arenas.iter().find(|a| a.slot == slot).unwrap();
    assert!(arena.num_intervals >= 3, "arena was live for the whole run");
    assert!(arena.sites.contains(&3));
    let rss = arena.rss.as_ref().unwrap();
    assert!(
        rss.peak >= size,
        "touched pages must show up as resident (peak {} < {size})",
        rss.peak
    );

    rt.free(p);
}

#[test]
fn skipped_intervals_carry_forward() {
    let _guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let rt = profiling_runtime(|cfg| {
        cfg.rss_skip_intervals = 2;
    });

    let p = rt.alloc(5, 128 * 1024);
    unsafe { std::ptr::write_bytes(p, 1, 128 * 1024) };

    wait_for_intervals(&rt, 5);
    let report = rt.shutdown().expect("profiling ran");

    // Skipping must not leave holes: the series stays one entry per tick.
    assert_dense_series(&report);
    let arena = &report.arenas[0];
    assert!(arena.num_intervals >= 5);

    rt.free(p);
}

#[test]
fn arenas_created_mid_run_start_their_own_series() {
    let _guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let rt = profiling_runtime(|_| {});

    let early = rt.alloc(1, 64 * 1024);
    wait_for_intervals(&rt, 2);
    let late = rt.alloc(2, 64 * 1024);
    let late_slot = rt.extents().lookup(late as usize).unwrap();
    wait_for_intervals(&rt, 4);

    let report = rt.shutdown().expect("profiling ran");
    assert_dense_series(&report);

    let late_arena = report.arenas.iter().find(|a| a.slot == late_slot).unwrap();
    assert!(
        late_arena.first_interval >= 2,
        "an arena created after tick 2 cannot claim earlier intervals"
    );
    let early_slot = rt.extents().lookup(early as usize).unwrap();
    let early_arena = report.arenas.iter().find(|a| a.slot == early_slot).unwrap();
    assert!(early_arena.num_intervals >= late_arena.num_intervals);

    rt.free(early);
    rt.free(late);
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let _guard = SCHEDULER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let rt = profiling_runtime(|_| {});

    let p = rt.alloc(7, 4096);
    wait_for_intervals(&rt, 1);

    assert!(rt.shutdown().is_some());
    assert!(rt.shutdown().is_none(), "the scheduler stops exactly once");
    assert!(rt.cur_interval().is_none());

    // The runtime still allocates after profiling ends.
    let q = rt.alloc(7, 4096);
    assert!(rt.extents().lookup(q as usize).is_some());
    rt.free(q);
    rt.free(p);
}
