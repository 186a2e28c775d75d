//! Arena layout policies and the site/thread index.
//!
//! A layout decides which arena slot an allocation lands in, given the
//! allocation site, the calling thread, and the size. The site index backs
//! the site-keyed layouts: dense arrays mapping a site id to its assigned
//! slot, its device preference, its sticky "big" flag, and the largest
//! single allocation it has been seen to make.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::device::Device;

/// Policy mapping `(site, thread, size)` to an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ArenaLayout {
    /// One arena per thread.
    ExclusiveArenas,
    /// One arena per `(thread, device)` pair; exactly two devices.
    ExclusiveDeviceArenas,
    /// One shared arena per allocation site.
    SharedSiteArenas,
    /// Small sites share per-thread arenas on the fast device; a site that
    /// ever crosses the threshold is promoted to its own arena, for good.
    BigSmallArenas,
    /// Pass everything through to the raw allocator.
    #[default]
    Invalid,
}

impl ArenaLayout {
    /// How many slots each thread consumes under this layout.
    pub fn arenas_per_thread(self) -> usize {
        match self {
            Self::ExclusiveDeviceArenas => 2,
            _ => 1,
        }
    }

    /// True for the pass-through pseudo-layout.
    pub fn is_passthrough(self) -> bool {
        self == Self::Invalid
    }
}

impl FromStr for ArenaLayout {
    type Err = ();

    /// Parses the environment spelling. Anything unknown is the
    /// pass-through layout, reported as `Err` so the caller can warn.
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "EXCLUSIVE_ARENAS" => Ok(Self::ExclusiveArenas),
            "EXCLUSIVE_DEVICE_ARENAS" => Ok(Self::ExclusiveDeviceArenas),
            "SHARED_SITE_ARENAS" => Ok(Self::SharedSiteArenas),
            "BIG_SMALL_ARENAS" => Ok(Self::BigSmallArenas),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ArenaLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExclusiveArenas => "EXCLUSIVE_ARENAS",
            Self::ExclusiveDeviceArenas => "EXCLUSIVE_DEVICE_ARENAS",
            Self::SharedSiteArenas => "SHARED_SITE_ARENAS",
            Self::BigSmallArenas => "BIG_SMALL_ARENAS",
            Self::Invalid => "INVALID_LAYOUT",
        })
    }
}

/// Slot value meaning "no arena assigned yet".
const UNASSIGNED: i64 = -1;

/// Dense per-site state plus the counters that hand out slots and thread
/// indices. All fields are monotonic: assignments are never taken back.
pub struct SiteIndex {
    site_arenas: Box<[AtomicI64]>,
    site_devices: Box<[Option<Device>]>,
    site_bigs: Box<[AtomicBool]>,
    site_sizes: Box<[AtomicUsize]>,
    /// Hands out arena slots for site-keyed assignment. Starts at 1: slot 0
    /// is reserved as the "no arena yet" value in site maps.
    arena_counter: CachePadded<AtomicUsize>,
    /// Hands out thread indices; never reused, even after thread exit.
    thread_counter: CachePadded<AtomicUsize>,
}

impl SiteIndex {
    pub(crate) fn new(max_sites: usize, site_devices: &[(u32, Device)]) -> Self {
        let mut devices: Vec<Option<Device>> = vec![None; max_sites];
        for &(site, device) in site_devices {
            if let Some(entry) = devices.get_mut(site as usize) {
                *entry = Some(device);
            }
        }
        Self {
            site_arenas: (0..max_sites).map(|_| AtomicI64::new(UNASSIGNED)).collect(),
            site_devices: devices.into_boxed_slice(),
            site_bigs: (0..max_sites).map(|_| AtomicBool::new(false)).collect(),
            site_sizes: (0..max_sites).map(|_| AtomicUsize::new(0)).collect(),
            arena_counter: CachePadded::new(AtomicUsize::new(1)),
            thread_counter: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// The slot assigned to `site`, installing one on first use. The flag
    /// reports whether this call made the assignment.
    pub fn site_arena(&self, site: u32) -> (usize, bool) {
        let cell = &self.site_arenas[site as usize];
        let cur = cell.load(Ordering::Acquire);
        if cur != UNASSIGNED {
            return (cur as usize, false);
        }
        let fresh = self.arena_counter.fetch_add(1, Ordering::Relaxed) as i64;
        match cell.compare_exchange(UNASSIGNED, fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => (fresh as usize, true),
            // Lost the race; the counter value is simply skipped.
            Err(winner) => (winner as usize, false),
        }
    }

    /// The device `site` prefers, or the caller's default.
    pub fn site_device(&self, site: u32, default: Device) -> Device {
        self.site_devices[site as usize].unwrap_or(default)
    }

    /// Raises the site's high-water allocation size; returns the new mark.
    pub fn note_size(&self, site: u32, size: usize) -> usize {
        self.site_sizes[site as usize].fetch_max(size, Ordering::Relaxed).max(size)
    }

    /// Whether the site has ever been marked big.
    pub fn is_big(&self, site: u32) -> bool {
        self.site_bigs[site as usize].load(Ordering::Relaxed)
    }

    /// Latches the big flag. Racing calls are idempotent; the flag never
    /// clears.
    pub fn mark_big(&self, site: u32) {
        self.site_bigs[site as usize].store(true, Ordering::Relaxed);
    }

    /// Hands the calling thread a fresh index.
    pub fn next_thread_index(&self) -> usize {
        self.thread_counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn device(id: u16) -> Device {
        Device { id, kind: DeviceKind::Dram, numa_node: u32::from(id) }
    }

    #[test]
    fn layout_parsing_round_trips() {
        for layout in [
            ArenaLayout::ExclusiveArenas,
            ArenaLayout::ExclusiveDeviceArenas,
            ArenaLayout::SharedSiteArenas,
            ArenaLayout::BigSmallArenas,
        ] {
            assert_eq!(layout.to_string().parse(), Ok(layout));
        }
        assert!(ArenaLayout::from_str("bogus").is_err());
    }

    #[test]
    fn site_arena_assignment_is_sticky() {
        let idx = SiteIndex::new(16, &[]);
        let (slot, fresh) = idx.site_arena(4);
        assert!(fresh);
        assert!(slot >= 1, "slot 0 stays reserved");
        for _ in 0..4 {
            assert_eq!(idx.site_arena(4), (slot, false));
        }
        // A different site gets a different slot.
        let (other, fresh) = idx.site_arena(5);
        assert!(fresh);
        assert_ne!(other, slot);
    }

    #[test]
    fn site_device_falls_back_to_default() {
        let idx = SiteIndex::new(16, &[(3, device(1))]);
        assert_eq!(idx.site_device(3, device(0)), device(1));
        assert_eq!(idx.site_device(9, device(0)), device(0));
    }

    #[test]
    fn big_flag_is_monotone() {
        let idx = SiteIndex::new(8, &[]);
        assert!(!idx.is_big(2));
        idx.mark_big(2);
        idx.mark_big(2);
        assert!(idx.is_big(2));
    }

    #[test]
    fn size_mark_is_a_high_water_mark() {
        let idx = SiteIndex::new(8, &[]);
        assert_eq!(idx.note_size(1, 100), 100);
        assert_eq!(idx.note_size(1, 50), 100);
        assert_eq!(idx.note_size(1, 200), 200);
    }

    #[test]
    fn thread_indices_are_never_reused() {
        let idx = SiteIndex::new(8, &[]);
        assert_eq!(idx.next_thread_index(), 0);
        assert_eq!(idx.next_thread_index(), 1);
        assert_eq!(idx.next_thread_index(), 2);
    }
}
