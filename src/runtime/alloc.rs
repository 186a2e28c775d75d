//! The allocation front-end.
//!
//! These are the operations the compiler pass targets, minus the `extern
//! "C"` shims in [`crate::abi`]. Pass-through rules come first on every
//! path: a zero site id, a zero size, or the pass-through layout all mean
//! the raw C heap, with no arena bookkeeping. Everything else dispatches
//! through the layout, lands in a device arena, and shows up in exactly
//! one extent.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::RwLock;

use super::Runtime;

/// Default allocation alignment, matching the raw heap's.
const DEFAULT_ALIGN: usize = 16;

/// Size and placement of one live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocInfo {
    pub size: usize,
    pub slot: usize,
}

/// Ordered map from live pointers to their allocation info; only consulted
/// when allocation profiling is on.
pub(crate) struct AllocMap {
    map: RwLock<BTreeMap<usize, AllocInfo>>,
}

impl AllocMap {
    pub(crate) fn new() -> Self {
        Self { map: RwLock::new(BTreeMap::new()) }
    }

    fn insert(&self, ptr: usize, info: AllocInfo) {
        self.map.write().unwrap().insert(ptr, info);
    }

    fn remove(&self, ptr: usize) -> Option<AllocInfo> {
        self.map.write().unwrap().remove(&ptr)
    }

    pub(crate) fn get(&self, ptr: usize) -> Option<AllocInfo> {
        self.map.read().unwrap().get(&ptr).copied()
    }
}

impl Runtime {
    /// True when `site` takes the raw-heap path under the current layout.
    fn passthrough(&self, site: u32) -> bool {
        site == 0 || self.cfg.layout.is_passthrough()
    }

    fn note_alloc(&self, ptr: *mut u8, size: usize, slot: usize) {
        if self.cfg.profile_allocs {
            self.allocs.insert(ptr as usize, AllocInfo { size, slot });
            if let Some(arena) = self.arenas.get(slot) {
                arena.grow(size);
            }
        }
    }

    fn note_free(&self, ptr: *mut u8) {
        if self.cfg.profile_allocs {
            if let Some(info) = self.allocs.remove(ptr as usize) {
                if let Some(arena) = self.arenas.get(info.slot) {
                    arena.shrink(info.size);
                }
            }
        }
    }

    /// Allocates `size` bytes for allocation site `site`.
    pub fn alloc(&self, site: u32, size: usize) -> *mut u8 {
        if self.passthrough(site) || size == 0 {
            return unsafe { libc::malloc(size).cast() };
        }
        let slot = self.arena_slot(site, size);
        let arena = self.arenas.get(slot).expect("dispatch materialized the arena");
        let ptr = arena.handle().alloc(size, DEFAULT_ALIGN);
        if !ptr.is_null() {
            self.note_alloc(ptr, size, slot);
            if self.cfg.run_rdspy {
                self.rdspy.on_alloc(ptr, size, site);
            }
        }
        ptr
    }

    /// Aligned allocation; `posix_memalign` and `memalign` both land here.
    pub fn aligned_alloc(&self, site: u32, align: usize, size: usize) -> *mut u8 {
        if self.passthrough(site) || size == 0 {
            let mut out: *mut libc::c_void = ptr::null_mut();
            let align = align.max(core::mem::size_of::<usize>());
            return match unsafe { libc::posix_memalign(&mut out, align, size) } {
                0 => out.cast(),
                _ => ptr::null_mut(),
            };
        }
        let slot = self.arena_slot(site, size);
        let arena = self.arenas.get(slot).expect("dispatch materialized the arena");
        let ptr = arena.handle().alloc(size, align.max(1));
        if !ptr.is_null() {
            self.note_alloc(ptr, size, slot);
            if self.cfg.run_rdspy {
                self.rdspy.on_alloc(ptr, size, site);
            }
        }
        ptr
    }

    /// `calloc`: the arena path does not zero, so zero here, explicitly.
    pub fn calloc(&self, site: u32, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        if self.passthrough(site) || total == 0 {
            return unsafe { libc::calloc(count, size).cast() };
        }
        let ptr = self.alloc(site, total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Reallocates `ptr` under site `site`.
    ///
    /// Pointers born on the raw heap stay on the raw heap; arena pointers
    /// move into whatever arena the layout picks for the new size.
    pub fn realloc(&self, site: u32, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(site, size);
        }
        if self.passthrough(site) || size == 0 {
            if !self.cfg.layout.is_passthrough() {
                if let Some(slot) = self.extents.lookup(ptr as usize) {
                    // An arena block hitting the pass-through rules: size
                    // zero releases it, a zero site id resizes it in place
                    // in the arena it already lives in.
                    if size == 0 {
                        self.free(ptr);
                        return ptr::null_mut();
                    }
                    let arena = self.arenas.get(slot).expect("extent owners are live");
                    let fresh = arena.handle().realloc(ptr, size);
                    if !fresh.is_null() {
                        self.note_free(ptr);
                        self.note_alloc(fresh, size, slot);
                    }
                    return fresh;
                }
            }
            return unsafe { libc::realloc(ptr.cast(), size).cast() };
        }

        let slot = self.arena_slot(site, size);
        let arena = self.arenas.get(slot).expect("dispatch materialized the arena");

        let fresh = if self.extents.lookup(ptr as usize).is_some() {
            arena.handle().realloc(ptr, size)
        } else {
            // Born on the raw heap before the runtime was up; migrate it.
            let fresh = arena.handle().alloc(size, DEFAULT_ALIGN);
            if !fresh.is_null() {
                unsafe {
                    let old_size = libc::malloc_usable_size(ptr.cast());
                    ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size));
                    libc::free(ptr.cast());
                }
            }
            fresh
        };

        if !fresh.is_null() {
            self.note_free(ptr);
            self.note_alloc(fresh, size, slot);
            if self.cfg.run_rdspy {
                self.rdspy.on_realloc(ptr, fresh, size, site);
            }
        }
        fresh
    }

    /// Releases `ptr`, wherever it came from.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.cfg.layout.is_passthrough() {
            return unsafe { libc::free(ptr.cast()) };
        }
        if self.cfg.run_rdspy {
            self.rdspy.on_free(ptr);
        }
        self.note_free(ptr);
        if self.extents.lookup(ptr as usize).is_some() {
            unsafe { self.backend.free(ptr) };
        } else {
            // Allocated before init or through a pass-through rule.
            unsafe { libc::free(ptr.cast()) };
        }
    }

    /// Logical size currently attributed to `slot`, when allocation
    /// profiling is on.
    pub fn logical_size(&self, slot: usize) -> usize {
        self.arenas.get(slot).map_or(0, crate::arena::Arena::size)
    }

    /// The recorded size of a live tracked allocation.
    pub fn tracked_size(&self, ptr: *mut u8) -> Option<usize> {
        self.allocs.get(ptr as usize).map(|info| info.size)
    }
}
