//! The runtime root: one record owning every core structure.
//!
//! The allocator front-end, arena table, extent index, site index, and
//! profiling scheduler are an unavoidable singleton in the embedded
//! configuration; here they live in one [`Runtime`] built at init and torn
//! down at shutdown, so tests and embedders can also stand up private
//! instances. The only process-global pieces are the two thread-local
//! slots (thread index and pending arena index) and the signal plumbing.
//!
//! Thread-locals are tagged with the owning runtime's epoch so a slot
//! cached for one runtime is never misread by another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::arena::{Arena, ArenaTable};
use crate::config::Config;
use crate::device::{BindPolicy, Device, DeviceAllocator, ExtentSink};
use crate::extent::ExtentTable;
use crate::fault::fatal;
use crate::layout::{ArenaLayout, SiteIndex};
use crate::profile::report::Report;
use crate::profile::scheduler::{self, ProfilerHandle};
use crate::profile::ProfileRegistry;
use crate::rdspy::{NullSpy, ReadSpy};

mod alloc;

pub(crate) use alloc::AllocMap;

/// Distinguishes runtimes for the thread-local slots. Starts at 1; epoch 0
/// marks a slot as never written.
static EPOCHS: AtomicU64 = AtomicU64::new(1);

pub(crate) mod tls {
    //! The two per-thread slots.
    //!
    //! `pending_index` exists because the backend's extent callback cannot
    //! carry per-allocation context: the front-end parks the target slot
    //! here right before calling into the backend, and the callback reads
    //! it back on the same thread.

    use std::cell::Cell;

    thread_local! {
        static THREAD_INDEX: Cell<(u64, i64)> = const { Cell::new((0, -1)) };
        static PENDING_INDEX: Cell<(u64, i64)> = const { Cell::new((0, -1)) };
    }

    /// The calling thread's index under `epoch`, assigning one via
    /// `assign` on first use.
    pub(crate) fn thread_index(epoch: u64, assign: impl FnOnce() -> usize) -> usize {
        THREAD_INDEX.with(|cell| {
            let (cached_epoch, cached) = cell.get();
            if cached_epoch == epoch && cached >= 0 {
                return cached as usize;
            }
            let fresh = assign();
            cell.set((epoch, fresh as i64));
            fresh
        })
    }

    /// Parks the arena slot of the in-flight allocation.
    pub(crate) fn set_pending(epoch: u64, slot: usize) {
        PENDING_INDEX.with(|cell| cell.set((epoch, slot as i64)));
    }

    /// The parked slot, if this thread has one for `epoch`.
    pub(crate) fn pending_index(epoch: u64) -> Option<usize> {
        PENDING_INDEX.with(|cell| {
            let (cached_epoch, slot) = cell.get();
            (cached_epoch == epoch && slot >= 0).then_some(slot as usize)
        })
    }
}

/// The runtime root record.
pub struct Runtime {
    epoch: u64,
    cfg: Config,
    backend: Box<dyn DeviceAllocator>,
    extents: Arc<ExtentTable>,
    arenas: Arc<ArenaTable>,
    sites: SiteIndex,
    registry: Arc<ProfileRegistry>,
    allocs: AllocMap,
    rdspy: Box<dyn ReadSpy>,
    profiler: Mutex<Option<ProfilerHandle>>,
}

impl Runtime {
    /// Builds a runtime and, when configured, starts the profiling
    /// scheduler. Must be called from the thread whose memory traffic the
    /// PMU profiler should sample.
    pub fn new(cfg: Config, backend: Box<dyn DeviceAllocator>) -> Result<Self> {
        Self::with_rdspy(cfg, backend, Box::new(NullSpy))
    }

    /// Like [`Runtime::new`] with a read-distance side-profiler installed.
    pub fn with_rdspy(
        cfg: Config,
        backend: Box<dyn DeviceAllocator>,
        rdspy: Box<dyn ReadSpy>,
    ) -> Result<Self> {
        cfg.log();
        let epoch = EPOCHS.fetch_add(1, Ordering::Relaxed);
        let extents = Arc::new(ExtentTable::new(epoch));
        let arenas = Arc::new(ArenaTable::new(cfg.max_arenas));
        let sites = SiteIndex::new(cfg.max_sites, &cfg.site_devices);
        let registry = Arc::new(ProfileRegistry::new(
            cfg.max_arenas,
            cfg.pmu_events.len(),
            cfg.profile_rss,
        ));

        let profiler = if cfg.should_profile && !cfg.layout.is_passthrough() {
            Some(scheduler::start(
                &cfg,
                Arc::clone(&arenas),
                Arc::clone(&extents),
                Arc::clone(&registry),
            )?)
        } else {
            None
        };

        Ok(Self {
            epoch,
            cfg,
            backend,
            extents,
            arenas,
            sites,
            registry,
            allocs: AllocMap::new(),
            rdspy,
            profiler: Mutex::new(profiler),
        })
    }

    /// The effective configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The extent index.
    pub fn extents(&self) -> &ExtentTable {
        &self.extents
    }

    /// The arena table.
    pub fn arenas(&self) -> &ArenaTable {
        &self.arenas
    }

    /// The site index.
    pub fn sites(&self) -> &SiteIndex {
        &self.sites
    }

    /// The profile registry.
    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Completed profiling intervals, when the scheduler is running.
    pub fn cur_interval(&self) -> Option<usize> {
        self.profiler.lock().unwrap().as_ref().map(ProfilerHandle::cur_interval)
    }

    /// Snapshot of the profiling state without stopping anything.
    pub fn report(&self) -> Report {
        Report::collect(&self.cfg, &self.arenas, &self.registry)
    }

    /// Stops the profiling scheduler and returns the final report, if
    /// profiling ran.
    pub fn shutdown(&self) -> Option<Report> {
        let handle = self.profiler.lock().unwrap().take();
        handle.map(|mut handle| {
            handle.stop();
            self.report()
        })
    }

    /// The calling thread's index, assigned on first use and never reused.
    pub(crate) fn thread_index(&self) -> usize {
        tls::thread_index(self.epoch, || {
            let index = self.sites.next_thread_index();
            if index >= self.cfg.max_threads {
                fatal!("thread count exceeds the maximum of {}", self.cfg.max_threads);
            }
            index
        })
    }

    /// 0 for the upper tier, 1 for the lower; anything else breaks the
    /// device-keyed layout's slot arithmetic.
    fn device_offset(&self, device: Device) -> usize {
        if device == self.cfg.upper_device {
            0
        } else if device == self.cfg.lower_device {
            1
        } else {
            fatal!("device on node {} is neither the upper nor the lower tier", device.numa_node);
        }
    }

    fn big_small_slot(&self, site: u32, size: usize, new_site: &mut bool) -> (usize, Option<Device>) {
        let threshold = self.cfg.big_small_threshold;
        let prev_big = self.sites.is_big(site);
        let high_water = self.sites.note_size(site, size);
        if !prev_big && (size > threshold || high_water > threshold) {
            // Racing promotions both land here; the latch is idempotent.
            self.sites.mark_big(site);
            tracing::debug!(site, size, high_water, "site promoted to big");
        }
        if self.sites.is_big(site) {
            let (slot, _) = self.sites.site_arena(site);
            if !prev_big {
                // Freshly promoted: the site just moved to its own arena.
                *new_site = true;
            }
            (
                self.cfg.max_threads + slot,
                Some(self.sites.site_device(site, self.cfg.default_device)),
            )
        } else {
            (self.thread_index(), Some(self.cfg.upper_device))
        }
    }

    /// The layout dispatcher: picks the slot and device for `(site, size)`
    /// on the calling thread, parks the slot for the extent callback, and
    /// materializes the arena if this is its first allocation.
    pub(crate) fn arena_slot(&self, site: u32, size: usize) -> usize {
        if site as usize >= self.cfg.max_sites {
            fatal!("site {site} exceeds the maximum of {} sites", self.cfg.max_sites);
        }

        let mut new_site = false;
        let (slot, device) = match self.cfg.layout {
            ArenaLayout::ExclusiveArenas => (self.thread_index(), None),
            ArenaLayout::ExclusiveDeviceArenas => {
                let thread = self.thread_index();
                let device = self.sites.site_device(site, self.cfg.default_device);
                let offset = self.device_offset(device);
                (thread * self.cfg.layout.arenas_per_thread() + offset, Some(device))
            }
            ArenaLayout::SharedSiteArenas => {
                let (slot, fresh) = self.sites.site_arena(site);
                new_site = fresh;
                (slot, Some(self.sites.site_device(site, self.cfg.default_device)))
            }
            ArenaLayout::BigSmallArenas => self.big_small_slot(site, size, &mut new_site),
            ArenaLayout::Invalid => unreachable!("pass-through is handled by the front-end"),
        };

        // Fit the slot to the table; a wrapped slot shares whatever arena
        // already lives there.
        let slot = slot % self.cfg.max_arenas;
        tls::set_pending(self.epoch, slot);

        let existed = self.arenas.get(slot).is_some();
        let arena = self.arenas.get_or_create(slot, || self.build_arena(slot, site, device));
        if existed && new_site {
            // Either a wrap-around collision or a big/small promotion into
            // a live arena; the report attributes the site either way.
            arena.add_site(site);
            tracing::debug!(site, slot, "site joined an existing arena");
        }
        arena.slot()
    }

    /// Creates the backing arena for `slot`. Runs under the creation lock.
    fn build_arena(&self, slot: usize, site: u32, device: Option<Device>) -> Arena {
        let device = device.unwrap_or(self.cfg.default_device);
        let sink: Arc<dyn ExtentSink> = Arc::clone(&self.extents) as Arc<dyn ExtentSink>;
        let handle = self
            .backend
            .arena_create(&[device], BindPolicy::Relaxed, sink)
            .unwrap_or_else(|err| {
                fatal!("cannot create arena {slot} on node {}: {err}", device.numa_node)
            });
        if self.cfg.should_profile {
            self.registry.create_arena_profile(slot);
        }
        tracing::debug!(slot, site, node = device.numa_node, "arena created");
        Arena::new(slot, device, handle, site)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // The scheduler must stop touching the tables before they go away.
        if let Some(mut handle) = self.profiler.lock().unwrap().take() {
            handle.stop();
        }
    }
}
