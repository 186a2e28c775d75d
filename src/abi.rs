//! The embedded ABI.
//!
//! These `extern "C"` entry points are what the compiler pass emits into
//! application binaries. They drive one process-global [`Runtime`]
//! configured from the `SH_*` environment, built on the first call and
//! torn down (report included) at process exit.
//!
//! Before the runtime is up — or if its configuration selects the
//! pass-through layout — every call degrades to the raw C heap, so a
//! binary carrying these calls runs unchanged with the runtime disabled.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::config::Config;
use crate::device::mmap::MmapHeap;
use crate::runtime::Runtime;

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Guards against allocation calls re-entering while the runtime itself
/// is being built.
static BOOTING: AtomicBool = AtomicBool::new(false);

extern "C" fn teardown() {
    if let Some(runtime) = GLOBAL.get() {
        if let Some(report) = runtime.shutdown() {
            let stdout = std::io::stdout();
            let _ = report.write_text(&mut stdout.lock());
        }
    }
}

/// The process-global runtime, built on first use. `None` while the
/// build itself is in flight.
fn global() -> Option<&'static Runtime> {
    if let Some(runtime) = GLOBAL.get() {
        return Some(runtime);
    }
    if BOOTING.swap(true, Ordering::AcqRel) {
        // Re-entered from inside the build; stay on the raw heap.
        return GLOBAL.get();
    }
    let runtime = GLOBAL.get_or_init(|| {
        let heap = MmapHeap::probe();
        let cfg = Config::from_env(heap.device_list()).unwrap_or_else(|err| {
            eprintln!("strata: {err:#}; aborting");
            std::process::exit(1);
        });
        let runtime = Runtime::new(cfg, Box::new(heap)).unwrap_or_else(|err| {
            eprintln!("strata: {err:#}; aborting");
            std::process::exit(1);
        });
        unsafe { libc::atexit(teardown) };
        runtime
    });
    Some(runtime)
}

/// Site-tagged `malloc`.
#[no_mangle]
pub extern "C" fn strata_alloc(site: u32, size: usize) -> *mut c_void {
    match global() {
        Some(rt) => rt.alloc(site, size).cast(),
        None => unsafe { libc::malloc(size) },
    }
}

/// Site-tagged `realloc`.
#[no_mangle]
pub unsafe extern "C" fn strata_realloc(site: u32, ptr: *mut c_void, size: usize) -> *mut c_void {
    match global() {
        Some(rt) => rt.realloc(site, ptr.cast(), size).cast(),
        None => libc::realloc(ptr, size),
    }
}

/// Site-tagged `calloc`.
#[no_mangle]
pub extern "C" fn strata_calloc(site: u32, count: usize, size: usize) -> *mut c_void {
    match global() {
        Some(rt) => rt.calloc(site, count, size).cast(),
        None => unsafe { libc::calloc(count, size) },
    }
}

/// Site-tagged `aligned_alloc`.
#[no_mangle]
pub extern "C" fn strata_aligned_alloc(site: u32, align: usize, size: usize) -> *mut c_void {
    match global() {
        Some(rt) => rt.aligned_alloc(site, align, size).cast(),
        None => unsafe { libc::memalign(align, size) },
    }
}

/// Site-tagged `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn strata_posix_memalign(
    site: u32,
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> libc::c_int {
    let ptr = strata_aligned_alloc(site, align, size);
    if out.is_null() {
        return libc::EINVAL;
    }
    *out = ptr;
    if ptr.is_null() {
        libc::ENOMEM
    } else {
        0
    }
}

/// Site-tagged `memalign`.
#[no_mangle]
pub extern "C" fn strata_memalign(site: u32, align: usize, size: usize) -> *mut c_void {
    strata_aligned_alloc(site, align, size)
}

/// `free` for anything the other entry points returned.
#[no_mangle]
pub unsafe extern "C" fn strata_free(ptr: *mut c_void) {
    match global() {
        Some(rt) => rt.free(ptr.cast()),
        None => libc::free(ptr),
    }
}
