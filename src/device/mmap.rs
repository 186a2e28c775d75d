//! Reference mmap-backed device allocator.
//!
//! Enumerates NUMA nodes from sysfs and serves arenas out of anonymous
//! mappings, one extent at a time. Placement on the arena's device is
//! best-effort `mbind`; the binding policy decides between preferred and
//! hard binding. Every mapping and unmapping is reported to the runtime's
//! [`ExtentSink`], which is the whole point: the core tracks extents, the
//! backend only carves them.
//!
//! Small allocations bump-allocate out of a shared chunk per arena; a block
//! whose footprint reaches half a chunk gets a dedicated extent so its pages
//! go back to the kernel the moment it is freed.

use std::fs;
use std::io;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{BindPolicy, Device, DeviceAllocator, DeviceArena, DeviceKind, DeviceList, ExtentSink};

/// Default extent size for shared chunks.
const CHUNK: usize = 4 << 20;

/// Every block is preceded by this much metadata and aligned at least this.
const HEADER: usize = core::mem::size_of::<AllocHeader>();

const MPOL_PREFERRED: libc::c_int = 1;
const MPOL_BIND: libc::c_int = 2;

/// Per-block metadata, written immediately before the returned pointer.
#[repr(C)]
struct AllocHeader {
    size: usize,
    extent: *const ExtentBlock,
}

/// One mapped extent, shared by every block carved from it.
///
/// `live` counts carved blocks plus one retention held by the owning arena
/// while the extent is open for bump allocation. The extent is unmapped when
/// the count reaches zero.
struct ExtentBlock {
    base: usize,
    len: usize,
    live: AtomicUsize,
    sink: Arc<dyn ExtentSink>,
}

unsafe impl Send for ExtentBlock {}
unsafe impl Sync for ExtentBlock {}

/// Drops one reference; unmaps and reports the extent on the last one.
unsafe fn release_ref(block: *const ExtentBlock) {
    if (*block).live.fetch_sub(1, Ordering::Release) == 1 {
        fence(Ordering::Acquire);
        let block = Box::from_raw(block as *mut ExtentBlock);
        block.sink.extent_destroyed(block.base, block.base + block.len);
        libc::munmap(block.base as *mut libc::c_void, block.len);
    }
}

/// System page size, fetched once.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The reference backend: sysfs NUMA enumeration plus mmap arenas.
pub struct MmapHeap {
    devices: DeviceList,
    chunk: usize,
}

impl MmapHeap {
    /// Enumerates NUMA nodes from `/sys/devices/system/node`. Falls back to
    /// a single DRAM device when the hierarchy is absent.
    pub fn probe() -> Self {
        Self::with_devices(DeviceList::new(enumerate_nodes()))
    }

    /// Builds a backend over an explicit device list (tests, embedders).
    pub fn with_devices(devices: DeviceList) -> Self {
        Self { devices, chunk: CHUNK }
    }

    /// The enumerated devices.
    pub fn device_list(&self) -> &DeviceList {
        &self.devices
    }
}

impl DeviceAllocator for MmapHeap {
    fn devices(&self) -> &DeviceList {
        &self.devices
    }

    fn arena_create(
        &self,
        devices: &[Device],
        policy: BindPolicy,
        sink: Arc<dyn ExtentSink>,
    ) -> io::Result<Box<dyn DeviceArena>> {
        let device = devices
            .first()
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty device list"))?;
        Ok(Box::new(MmapArena {
            device,
            policy,
            // Binding to one of one node is a no-op; skip the syscall.
            bind: self.devices.len() > 1,
            chunk: self.chunk,
            sink,
            open: Mutex::new(None),
        }))
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header = (ptr as usize - HEADER) as *const AllocHeader;
        release_ref((*header).extent);
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let header = (ptr as usize - HEADER) as *const AllocHeader;
        (*header).size
    }
}

fn enumerate_nodes() -> Vec<Device> {
    let mut nodes: Vec<u32> = Vec::new();
    if let Ok(entries) = fs::read_dir("/sys/devices/system/node") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(n) = name.to_str().and_then(|s| s.strip_prefix("node")) {
                if let Ok(n) = n.parse() {
                    nodes.push(n);
                }
            }
        }
    }
    nodes.sort_unstable();
    if nodes.is_empty() {
        nodes.push(0);
    }
    nodes
        .into_iter()
        .enumerate()
        .map(|(id, numa_node)| Device { id: id as u16, kind: DeviceKind::Dram, numa_node })
        .collect()
}

/// Bump-allocation state for the arena's shared chunk.
struct OpenExtent {
    block: *const ExtentBlock,
    cursor: usize,
}

/// One device-bound sub-heap.
pub struct MmapArena {
    device: Device,
    policy: BindPolicy,
    bind: bool,
    chunk: usize,
    sink: Arc<dyn ExtentSink>,
    open: Mutex<Option<OpenExtent>>,
}

unsafe impl Send for MmapArena {}
unsafe impl Sync for MmapArena {}

impl MmapArena {
    /// Maps a fresh extent, applies the device binding, reports it to the
    /// sink, and hands back a block with one reference held by the caller.
    fn map_extent(&self, len: usize) -> Option<*const ExtentBlock> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        if self.bind {
            let mode = match self.policy {
                BindPolicy::Strict => MPOL_BIND,
                BindPolicy::Relaxed => MPOL_PREFERRED,
            };
            let nodemask: libc::c_ulong = 1 << self.device.numa_node;
            // Placement advice only; allocation proceeds on any node if the
            // kernel refuses.
            unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    base,
                    len,
                    mode,
                    &nodemask as *const libc::c_ulong,
                    (8 * core::mem::size_of::<libc::c_ulong>()) as libc::c_ulong,
                    0 as libc::c_uint,
                );
            }
        }
        let block = Box::into_raw(Box::new(ExtentBlock {
            base: base as usize,
            len,
            live: AtomicUsize::new(1),
            sink: Arc::clone(&self.sink),
        }));
        self.sink.extent_created(base as usize, base as usize + len);
        Some(block)
    }

    /// Writes the header and returns the user pointer.
    unsafe fn finish(addr: usize, size: usize, block: *const ExtentBlock) -> *mut u8 {
        let header = (addr - HEADER) as *mut AllocHeader;
        ptr::write(header, AllocHeader { size, extent: block });
        addr as *mut u8
    }
}

impl DeviceArena for MmapArena {
    fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let align = align.max(HEADER).next_power_of_two();
        let worst = HEADER + align + size;

        // Large blocks get their own extent so freeing them returns the
        // pages immediately.
        if worst >= self.chunk / 2 {
            let len = align_up(worst, page_size());
            let Some(block) = self.map_extent(len) else {
                return ptr::null_mut();
            };
            let addr = unsafe { align_up((*block).base + HEADER, align) };
            return unsafe { Self::finish(addr, size, block) };
        }

        let mut open = self.open.lock().unwrap();
        loop {
            if let Some(state) = open.as_mut() {
                let (base, len) = unsafe { ((*state.block).base, (*state.block).len) };
                let addr = align_up(base + state.cursor + HEADER, align);
                if addr + size <= base + len {
                    state.cursor = addr + size - base;
                    unsafe { (*state.block).live.fetch_add(1, Ordering::Relaxed) };
                    return unsafe { Self::finish(addr, size, state.block) };
                }
                // Chunk exhausted: drop the arena's retention and start a
                // fresh one. Live blocks keep the old extent mapped.
                let retired = open.take().expect("checked above");
                unsafe { release_ref(retired.block) };
            }
            let Some(block) = self.map_extent(self.chunk) else {
                return ptr::null_mut();
            };
            *open = Some(OpenExtent { block, cursor: 0 });
        }
    }

    fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size, HEADER);
        }
        let header = (ptr as usize - HEADER) as *const AllocHeader;
        let old_size = unsafe { (*header).size };
        let fresh = self.alloc(size, HEADER);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size));
            release_ref((*header).extent);
        }
        fresh
    }

    fn device(&self) -> Device {
        self.device
    }
}

impl Drop for MmapArena {
    fn drop(&mut self) {
        if let Some(state) = self.open.lock().unwrap().take() {
            unsafe { release_ref(state.block) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ExtentSink for CountingSink {
        fn extent_created(&self, _start: usize, _end: usize) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn extent_destroyed(&self, _start: usize, _end: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_heap(sink: Arc<CountingSink>) -> (MmapHeap, Box<dyn DeviceArena>) {
        let heap = MmapHeap::probe();
        let device = heap.devices().first();
        let arena = heap.arena_create(&[device], BindPolicy::Relaxed, sink).unwrap();
        (heap, arena)
    }

    #[test]
    fn small_blocks_share_an_extent() {
        let sink = Arc::new(CountingSink::default());
        let (heap, arena) = test_heap(Arc::clone(&sink));

        let a = arena.alloc(64, 8);
        let b = arena.alloc(64, 8);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);

        unsafe {
            heap.free(a);
            heap.free(b);
        }
        // The arena still retains the open chunk.
        assert_eq!(sink.destroyed.load(Ordering::SeqCst), 0);
        drop(arena);
        assert_eq!(sink.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_blocks_get_dedicated_extents() {
        let sink = Arc::new(CountingSink::default());
        let (heap, arena) = test_heap(Arc::clone(&sink));

        let p = arena.alloc(CHUNK, 8);
        assert!(!p.is_null());
        assert_eq!(sink.created.load(Ordering::SeqCst), 1);
        unsafe { heap.free(p) };
        assert_eq!(sink.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn realloc_preserves_contents() {
        let sink = Arc::new(CountingSink::default());
        let (heap, arena) = test_heap(sink);

        let p = arena.alloc(16, 8);
        unsafe { ptr::write_bytes(p, 0xab, 16) };
        let q = arena.realloc(p, 64);
        assert!(!q.is_null());
        for i in 0..16 {
            assert_eq!(unsafe { *q.add(i) }, 0xab);
        }
        assert_eq!(unsafe { heap.usable_size(q) }, 64);
        unsafe { heap.free(q) };
    }

    #[test]
    fn aligned_blocks_respect_alignment() {
        let sink = Arc::new(CountingSink::default());
        let (heap, arena) = test_heap(sink);
        for align in [16usize, 64, 256, 4096] {
            let p = arena.alloc(24, align);
            assert_eq!(p as usize % align, 0, "align {align}");
            unsafe { heap.free(p) };
        }
    }
}
