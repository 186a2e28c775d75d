//! Master/worker interval scheduler.
//!
//! A master thread owns a realtime periodic timer delivered as a realtime
//! signal to that thread alone (`SIGEV_THREAD_ID`). Each enabled profiler
//! gets a worker thread whose only job is to be a stable signal target:
//! the profiler's per-interval work runs in the worker's signal handler.
//!
//! On every tick the master advances `num_intervals` for all live arenas,
//! signals the workers due this tick, and runs the carry-forward step for
//! the ones that skip. The rendezvous counts only the workers actually
//! scheduled this tick, so a skipping profiler never stalls the barrier.
//!
//! Signal numbers are handed out from `SIGRTMIN`: first the master's stop
//! signal, then one per worker, then the master's timer signal.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};

use crate::arena::ArenaTable;
use crate::config::Config;
use crate::extent::ExtentTable;
use crate::fault::fatal;
use crate::profile::pmu::PmuProfiler;
use crate::profile::rss::RssProfiler;
use crate::profile::{IntervalProfiler, ProfileRegistry};

/// The profiler shared state the signal handlers reach through a global
/// pointer; signal handlers cannot carry context any other way.
static ACTIVE: AtomicPtr<Shared> = AtomicPtr::new(ptr::null_mut());

fn with_active(f: impl FnOnce(&Shared)) {
    let shared = ACTIVE.load(Ordering::Acquire);
    if !shared.is_null() {
        f(unsafe { &*shared });
    }
}

extern "C" fn master_tick_handler(_sig: libc::c_int) {
    with_active(Shared::tick);
}

extern "C" fn master_stop_handler(_sig: libc::c_int) {
    with_active(|shared| shared.master_exit.store(true, Ordering::Release));
}

extern "C" fn worker_interval_handler(sig: libc::c_int) {
    with_active(|shared| shared.worker_interval(sig));
}

/// One worker thread's slot: its profiler, its signal, and its skip state.
struct Worker {
    profiler: Arc<dyn IntervalProfiler>,
    signal: libc::c_int,
    skip_intervals: usize,
    /// Ticks missed since the last run; touched only by the master.
    skipped_intervals: AtomicUsize,
    pthread: OnceLock<libc::pthread_t>,
}

struct Rendezvous {
    /// Workers scheduled to run this tick.
    expected: usize,
    finished: usize,
}

pub(crate) struct Shared {
    workers: Vec<Worker>,
    arenas: Arc<ArenaTable>,
    registry: Arc<ProfileRegistry>,
    rendezvous: Mutex<Rendezvous>,
    cond: Condvar,
    cur_interval: AtomicUsize,
    rate_nsec: u64,
    master_signal: libc::c_int,
    stop_signal: libc::c_int,
    master_exit: AtomicBool,
    shutting_down: AtomicBool,
}

impl Shared {
    /// Number of completed intervals.
    pub(crate) fn cur_interval(&self) -> usize {
        self.cur_interval.load(Ordering::Acquire)
    }

    /// The master's per-tick work. Runs in the master's signal handler.
    fn tick(&self) {
        let cur = self.cur_interval.load(Ordering::Relaxed);

        // Interval indices must be consistent across arenas before any
        // profiler looks at them.
        for slot in 0..=self.arenas.max_index() {
            if self.arenas.get(slot).is_none() {
                continue;
            }
            let Some(rec) = self.registry.get(slot) else {
                continue;
            };
            if rec.num_intervals() == 0 {
                rec.set_first_interval(cur);
            }
            rec.advance_interval();
        }

        // Apply skip rules first so the barrier knows how many rendezvous
        // participants this tick actually has.
        let mut expected = 0;
        for worker in &self.workers {
            if worker.skipped_intervals.load(Ordering::Relaxed) + 1 == worker.skip_intervals {
                expected += 1;
            }
        }
        {
            let mut sync = self.rendezvous.lock().unwrap();
            sync.expected = expected;
            sync.finished = 0;
        }

        for worker in &self.workers {
            let skipped = worker.skipped_intervals.load(Ordering::Relaxed);
            if skipped + 1 == worker.skip_intervals {
                worker.skipped_intervals.store(0, Ordering::Relaxed);
                let pthread = worker.pthread.get().expect("worker registered before the timer");
                unsafe { libc::pthread_kill(*pthread, worker.signal) };
            } else {
                worker.skipped_intervals.store(skipped + 1, Ordering::Relaxed);
                // Carry-forward runs right here; the skipped worker never
                // needs to know the tick happened.
                worker.profiler.skip_interval();
            }
        }

        let mut sync = self.rendezvous.lock().unwrap();
        while sync.finished < sync.expected {
            sync = self.cond.wait(sync).unwrap();
        }
        sync.finished = 0;
        drop(sync);

        self.cur_interval.fetch_add(1, Ordering::Release);
    }

    /// A worker's per-interval work. Runs in that worker's signal handler.
    fn worker_interval(&self, sig: libc::c_int) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let Some(worker) = self.workers.iter().find(|w| w.signal == sig) else {
            return;
        };
        block_signal(sig);
        worker.profiler.interval();

        let mut sync = self.rendezvous.lock().unwrap();
        sync.finished += 1;
        self.cond.notify_one();
        drop(sync);

        unblock_signal(sig);
    }
}

/// Handle owned by the runtime; stopping it tears the whole scheduler down.
pub(crate) struct ProfilerHandle {
    shared: Arc<Shared>,
    master: Option<JoinHandle<()>>,
    master_pthread: libc::pthread_t,
    worker_threads: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ProfilerHandle {
    /// Completed intervals so far.
    pub(crate) fn cur_interval(&self) -> usize {
        self.shared.cur_interval()
    }

    /// Stops the master, joins everyone, releases profiler resources.
    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(master) = self.master.take() {
            unsafe { libc::pthread_kill(self.master_pthread, self.shared.stop_signal) };
            let _ = master.join();
        }

        self.shared.shutting_down.store(true, Ordering::Release);
        for worker in &self.shared.workers {
            if let Some(pthread) = worker.pthread.get() {
                unsafe { libc::pthread_kill(*pthread, worker.signal) };
            }
        }
        for thread in self.worker_threads.drain(..) {
            let _ = thread.join();
        }

        for worker in &self.shared.workers {
            worker.profiler.deinit();
        }

        let old = ACTIVE.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            // Balance the `into_raw` from `start`.
            unsafe { drop(Arc::from_raw(old)) };
        }
    }
}

impl Drop for ProfilerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the configured profilers and starts the scheduler around them.
pub(crate) fn start(
    cfg: &Config,
    arenas: Arc<ArenaTable>,
    extents: Arc<ExtentTable>,
    registry: Arc<ProfileRegistry>,
) -> Result<ProfilerHandle> {
    if !ACTIVE.load(Ordering::Acquire).is_null() {
        bail!("an interval profiler is already running in this process");
    }

    // Profiler init runs here, on the caller's thread: the perf
    // descriptors sample the thread that opens them.
    let mut profilers: Vec<(Arc<dyn IntervalProfiler>, usize)> = Vec::new();
    if !cfg.pmu_events.is_empty() {
        let pmu = PmuProfiler::init(
            &cfg.pmu_events,
            cfg.max_sample_pages,
            Arc::clone(&registry),
            Arc::clone(&extents),
        )
        .context("pmu profiler init failed")?;
        profilers.push((Arc::new(pmu), 1));
    }
    if cfg.profile_rss {
        let rss = RssProfiler::init(Arc::clone(&registry), Arc::clone(&extents))
            .context("rss profiler init failed")?;
        profilers.push((Arc::new(rss), cfg.rss_skip_intervals));
    }

    launch(profilers, cfg.profile_rate_nsec, arenas, registry)
}

/// Wires signals and threads around ready-made profilers.
///
/// Realtime signal delivery is process-global state, so only one scheduler
/// can run per process at a time.
fn launch(
    profilers: Vec<(Arc<dyn IntervalProfiler>, usize)>,
    rate_nsec: u64,
    arenas: Arc<ArenaTable>,
    registry: Arc<ProfileRegistry>,
) -> Result<ProfilerHandle> {
    if !ACTIVE.load(Ordering::Acquire).is_null() {
        bail!("an interval profiler is already running in this process");
    }

    let mut next_signal = unsafe { libc::SIGRTMIN() };
    let stop_signal = next_signal;
    next_signal += 1;

    let mut workers = Vec::new();
    for (profiler, skip_intervals) in profilers {
        workers.push(Worker {
            profiler,
            signal: next_signal,
            skip_intervals,
            skipped_intervals: AtomicUsize::new(0),
            pthread: OnceLock::new(),
        });
        next_signal += 1;
    }
    let master_signal = next_signal;

    let shared = Arc::new(Shared {
        workers,
        arenas,
        registry,
        rendezvous: Mutex::new(Rendezvous { expected: 0, finished: 0 }),
        cond: Condvar::new(),
        cur_interval: AtomicUsize::new(0),
        rate_nsec,
        master_signal,
        stop_signal,
        master_exit: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
    });

    ACTIVE.store(Arc::into_raw(Arc::clone(&shared)) as *mut Shared, Ordering::Release);

    install_handler(stop_signal, master_stop_handler);
    install_handler(master_signal, master_tick_handler);
    for worker in &shared.workers {
        install_handler(worker.signal, worker_interval_handler);
    }

    // Workers first, so their pthread ids exist before the first tick can
    // possibly fire.
    let mut worker_threads = Vec::new();
    for index in 0..shared.workers.len() {
        let shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("strata-prof-{}", shared.workers[index].profiler.name()))
            .spawn(move || worker_main(&shared, index))
            .context("cannot spawn profiler worker")?;
        worker_threads.push(handle);
    }
    for (worker, handle) in shared.workers.iter().zip(&worker_threads) {
        use std::os::unix::thread::JoinHandleExt;
        let _ = worker.pthread.set(handle.as_pthread_t());
    }

    let master = {
        let shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("strata-prof-master".into())
            .spawn(move || master_main(&shared))
            .context("cannot spawn profiler master")?
    };
    let master_pthread = {
        use std::os::unix::thread::JoinHandleExt;
        master.as_pthread_t()
    };

    tracing::info!(
        workers = shared.workers.len(),
        rate_nsec = shared.rate_nsec,
        "profiling scheduler started"
    );

    Ok(ProfilerHandle {
        shared,
        master: Some(master),
        master_pthread,
        worker_threads,
        stopped: false,
    })
}

/// Worker body: exists so the interval signal has somewhere to land.
fn worker_main(shared: &Shared, _index: usize) {
    while !shared.shutting_down.load(Ordering::Acquire) {
        unsafe { libc::pause() };
    }
}

/// Master body: owns the periodic timer, parks between ticks.
fn master_main(shared: &Shared) {
    let mut sev: libc::sigevent = unsafe { mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_THREAD_ID;
    sev.sigev_signo = shared.master_signal;
    sev.sigev_notify_thread_id = unsafe { libc::gettid() };

    let mut timer: libc::timer_t = ptr::null_mut();
    if unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut sev, &mut timer) } == -1 {
        fatal!("timer_create failed: {}", std::io::Error::last_os_error());
    }

    let period = libc::timespec {
        tv_sec: (shared.rate_nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: (shared.rate_nsec % 1_000_000_000) as libc::c_long,
    };
    let spec = libc::itimerspec { it_interval: period, it_value: period };
    if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } == -1 {
        fatal!("timer_settime failed: {}", std::io::Error::last_os_error());
    }

    while !shared.master_exit.load(Ordering::Acquire) {
        unsafe { libc::pause() };
    }

    unsafe { libc::timer_delete(timer) };
}

fn install_handler(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(signal, &action, ptr::null_mut()) == -1 {
            fatal!("sigaction for signal {signal} failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn block_signal(signal: libc::c_int) {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) != 0 {
            fatal!("cannot block signal {signal}");
        }
    }
}

fn unblock_signal(signal: libc::c_int) {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        if libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) != 0 {
            fatal!("cannot unblock signal {signal}");
        }
    }
}
