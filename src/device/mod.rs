//! The device-allocator capability.
//!
//! The runtime core does not map or carve memory itself. It talks to a
//! low-level allocator through the traits in this module: enumerate memory
//! devices once at startup, create an arena bound to a device list, and
//! serve allocations from it. Extent-level mappings are reported back
//! through an [`ExtentSink`] so the core can reverse-map addresses.
//!
//! [`mmap`] provides the reference backend used by the embedded runtime and
//! the test suite.

use std::io;
use std::sync::Arc;

pub mod mmap;

/// The memory tier a device belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Ordinary DRAM on a NUMA node.
    Dram,
    /// High-bandwidth memory (MCDRAM and friends).
    HighBandwidth,
    /// Non-volatile / far memory.
    NonVolatile,
}

impl DeviceKind {
    /// Parses a symbolic tag as it appears in the environment surface.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "dram" => Some(Self::Dram),
            "hbm" => Some(Self::HighBandwidth),
            "nvm" => Some(Self::NonVolatile),
            _ => None,
        }
    }

    /// The symbolic tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Dram => "dram",
            Self::HighBandwidth => "hbm",
            Self::NonVolatile => "nvm",
        }
    }
}

/// One memory target: a kind plus the NUMA node backing it.
///
/// Devices are plain values; identity is the `id` assigned at enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Device {
    /// Dense identifier assigned during enumeration.
    pub id: u16,
    /// Tier classification.
    pub kind: DeviceKind,
    /// NUMA node the device maps to.
    pub numa_node: u32,
}

/// The devices a backend enumerated, in discovery order.
#[derive(Clone, Debug)]
pub struct DeviceList {
    devices: Vec<Device>,
}

impl DeviceList {
    /// Builds a list from enumerated devices. The first entry is the
    /// fallback default device.
    pub fn new(devices: Vec<Device>) -> Self {
        assert!(!devices.is_empty(), "a backend must enumerate at least one device");
        Self { devices }
    }

    /// The first enumerated device.
    pub fn first(&self) -> Device {
        self.devices[0]
    }

    /// The last enumerated device.
    pub fn last(&self) -> Device {
        *self.devices.last().expect("non-empty by construction")
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no devices were enumerated. Never true in practice.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = Device> + '_ {
        self.devices.iter().copied()
    }

    /// Device by dense id.
    pub fn get(&self, id: u16) -> Option<Device> {
        self.devices.get(id as usize).copied()
    }

    /// Resolves a symbolic spec: a tier tag (`dram`, `hbm`, `nvm`) picks the
    /// first device of that kind, a bare integer picks by NUMA node.
    pub fn find(&self, spec: &str) -> Option<Device> {
        if let Some(kind) = DeviceKind::parse(spec) {
            return self.iter().find(|d| d.kind == kind);
        }
        let node: u32 = spec.parse().ok()?;
        self.iter().find(|d| d.numa_node == node)
    }
}

/// How strictly an arena's pages are bound to its device list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindPolicy {
    /// Pages must come from the listed devices.
    Strict,
    /// Prefer the listed devices, fall back under pressure.
    Relaxed,
}

/// Receives extent-level mapping events from a backend.
///
/// The callback deliberately carries no per-allocation context; the runtime
/// recovers the owning arena through its thread-local pending slot.
pub trait ExtentSink: Send + Sync {
    /// A new extent `[start, end)` was mapped for some arena.
    fn extent_created(&self, start: usize, end: usize);
    /// The extent starting at `start` is being released.
    fn extent_destroyed(&self, start: usize, end: usize);
}

/// An arena created by a backend: a device-bound sub-heap.
pub trait DeviceArena: Send + Sync {
    /// Allocates `size` bytes at `align` alignment. Null on exhaustion.
    fn alloc(&self, size: usize, align: usize) -> *mut u8;

    /// Reallocates a block previously returned by any arena of the same
    /// backend, moving it into this arena. Null on exhaustion (the old
    /// block stays live).
    fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// The device this arena is bound to.
    fn device(&self) -> Device;
}

/// The low-level allocator capability.
///
/// `free` and `usable_size` are backend-level: a block knows its own arena,
/// the caller does not have to.
pub trait DeviceAllocator: Send + Sync {
    /// Devices this backend enumerated at startup.
    fn devices(&self) -> &DeviceList;

    /// Creates an arena over `devices` with the given binding policy.
    /// Extent mappings are reported to `sink` as they come and go.
    fn arena_create(
        &self,
        devices: &[Device],
        policy: BindPolicy,
        sink: Arc<dyn ExtentSink>,
    ) -> io::Result<Box<dyn DeviceArena>>;

    /// Releases a block previously returned by any arena of this backend.
    ///
    /// # Safety
    /// `ptr` must be a live block from this backend.
    unsafe fn free(&self, ptr: *mut u8);

    /// The size recorded for a live block.
    ///
    /// # Safety
    /// `ptr` must be a live block from this backend.
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
}
