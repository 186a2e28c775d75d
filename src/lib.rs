//! # `strata` - Site-Directed Arena Runtime for Tiered Memory
//!
//! A NUMA-aware heap runtime for long-running compute workloads on tiered
//! memory (fast DRAM alongside slower, larger devices). An upstream compiler
//! pass rewrites allocation calls into calls that carry an integer
//! *allocation-site identifier*; the runtime dispatches each call to one of
//! many backing *arenas*, each pinned to a chosen memory device.
//!
//! ## Key pieces
//!
//! - **Layout dispatch**: maps `(site, size, thread)` to an arena slot under
//!   a configurable policy ([`ArenaLayout`])
//! - **Extent tracking**: every region the low-level allocator maps is
//!   recorded so arbitrary addresses reverse-map to their arena
//! - **Interval profiling**: a signal-driven master/worker scheduler samples
//!   PMU address events and pagemap residency per arena, per interval
//! - **Device capability**: the low-level NUMA allocator is a trait; a
//!   reference mmap-backed implementation ships in [`device::mmap`]
//!
//! ## Example
//!
//! ```no_run
//! use strata::{Config, Runtime, ArenaLayout};
//! use strata::device::mmap::MmapHeap;
//!
//! let heap = MmapHeap::probe();
//! let mut cfg = Config::defaults(heap.device_list());
//! cfg.layout = ArenaLayout::SharedSiteArenas;
//! let rt = Runtime::new(cfg, Box::new(heap)).unwrap();
//!
//! let p = rt.alloc(7, 1024);
//! assert!(!p.is_null());
//! rt.free(p);
//! ```
//!
//! The embedded ABI the compiler pass targets lives in [`abi`]; it drives a
//! process-global runtime configured from `SH_*` environment variables.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_safety_doc)]

pub mod abi;
pub mod config;
pub mod device;
pub mod events;
pub mod extent;
pub mod layout;
pub mod profile;
pub mod rdspy;
pub mod runtime;

mod arena;
mod fault;

pub use arena::{Arena, ArenaTable};
pub use config::Config;
pub use extent::ExtentTable;
pub use layout::ArenaLayout;
pub use profile::report::Report;
pub use runtime::Runtime;

// Layout claims the perf plumbing depends on; checked once, at compile time.
const _: () = {
    use core::mem;

    // The kernel's mmap metadata page places `data_head` at byte 1024.
    assert!(mem::offset_of!(events::PerfEventMmapPage, data_head) == 1024);

    // Attribute struct must advertise the VER5 ABI size it is laid out for.
    assert!(mem::size_of::<events::PerfEventAttr>() == events::PERF_ATTR_SIZE_VER5 as usize);

    // Record headers are read straight off the ring.
    assert!(mem::size_of::<events::PerfEventHeader>() == 8);
};
