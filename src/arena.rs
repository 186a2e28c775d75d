//! Arena records and the fixed-capacity arena table.
//!
//! Slots are published once and never torn down before process exit, so
//! readers go lock-free: a slot is either empty or permanently holds its
//! arena. Creation is rare and serialized by one mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::device::{Device, DeviceArena};

/// One device-bound sub-heap and its bookkeeping.
pub struct Arena {
    slot: usize,
    device: Device,
    handle: Box<dyn DeviceArena>,
    /// Sites that have landed in this arena, in arrival order.
    sites: Mutex<Vec<u32>>,
    /// Logical bytes currently allocated here (allocation profiling).
    size: AtomicUsize,
    /// High-water mark of `size`.
    peak: AtomicUsize,
}

impl Arena {
    pub(crate) fn new(slot: usize, device: Device, handle: Box<dyn DeviceArena>, site: u32) -> Self {
        Self {
            slot,
            device,
            handle,
            sites: Mutex::new(vec![site]),
            size: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// The dense slot this arena occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The device the arena is bound to.
    pub fn device(&self) -> Device {
        self.device
    }

    /// The backend sub-heap.
    pub fn handle(&self) -> &dyn DeviceArena {
        &*self.handle
    }

    /// Records that `site` allocates here. Idempotent.
    pub fn add_site(&self, site: u32) {
        let mut sites = self.sites.lock().unwrap();
        if !sites.contains(&site) {
            sites.push(site);
        }
    }

    /// Snapshot of the sites allocated here.
    pub fn sites(&self) -> Vec<u32> {
        self.sites.lock().unwrap().clone()
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Largest logical size seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub(crate) fn grow(&self, bytes: usize) {
        let now = self.size.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn shrink(&self, bytes: usize) {
        self.size.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Dense slot → arena map with publish-once slots.
pub struct ArenaTable {
    slots: Box<[OnceLock<Arena>]>,
    /// Upper bound on occupied slots, so scans stay short.
    max_index: AtomicUsize,
    create_lock: Mutex<()>,
}

impl ArenaTable {
    pub(crate) fn new(max_arenas: usize) -> Self {
        Self {
            slots: (0..max_arenas).map(|_| OnceLock::new()).collect(),
            max_index: AtomicUsize::new(0),
            create_lock: Mutex::new(()),
        }
    }

    /// Capacity in slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The arena at `slot`, if one has been created.
    pub fn get(&self, slot: usize) -> Option<&Arena> {
        self.slots.get(slot)?.get()
    }

    /// Highest slot that has ever held an arena.
    pub fn max_index(&self) -> usize {
        self.max_index.load(Ordering::Acquire)
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arena> {
        (0..=self.max_index()).filter_map(move |slot| self.get(slot))
    }

    /// Returns the arena at `slot`, running `init` under the creation lock
    /// if the slot is empty. `init` runs at most once per slot.
    pub(crate) fn get_or_create(&self, slot: usize, init: impl FnOnce() -> Arena) -> &Arena {
        if let Some(arena) = self.get(slot) {
            return arena;
        }
        let _guard = self.create_lock.lock().unwrap();
        if self.slots[slot].get().is_none() {
            self.max_index.fetch_max(slot, Ordering::AcqRel);
            let _ = self.slots[slot].set(init());
        }
        self.slots[slot].get().expect("published under the creation lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mmap::MmapHeap;
    use crate::device::{BindPolicy, DeviceAllocator, ExtentSink};
    use std::sync::Arc;

    struct NullSink;
    impl ExtentSink for NullSink {
        fn extent_created(&self, _: usize, _: usize) {}
        fn extent_destroyed(&self, _: usize, _: usize) {}
    }

    fn arena_at(heap: &MmapHeap, slot: usize, site: u32) -> Arena {
        let device = heap.devices().first();
        let handle = heap
            .arena_create(&[device], BindPolicy::Relaxed, Arc::new(NullSink))
            .unwrap();
        Arena::new(slot, device, handle, site)
    }

    #[test]
    fn slots_publish_once() {
        let heap = MmapHeap::probe();
        let table = ArenaTable::new(8);
        assert!(table.get(3).is_none());

        let first = table.get_or_create(3, || arena_at(&heap, 3, 7)) as *const Arena;
        let second = table.get_or_create(3, || panic!("init must not rerun")) as *const Arena;
        assert_eq!(first, second);
        assert_eq!(table.max_index(), 3);
    }

    #[test]
    fn iter_skips_empty_slots() {
        let heap = MmapHeap::probe();
        let table = ArenaTable::new(8);
        table.get_or_create(1, || arena_at(&heap, 1, 1));
        table.get_or_create(5, || arena_at(&heap, 5, 2));
        let slots: Vec<usize> = table.iter().map(Arena::slot).collect();
        assert_eq!(slots, vec![1, 5]);
    }

    #[test]
    fn site_lists_are_deduplicated() {
        let heap = MmapHeap::probe();
        let arena = arena_at(&heap, 0, 9);
        arena.add_site(9);
        arena.add_site(11);
        arena.add_site(11);
        assert_eq!(arena.sites(), vec![9, 11]);
    }

    #[test]
    fn logical_size_tracks_peak() {
        let heap = MmapHeap::probe();
        let arena = arena_at(&heap, 0, 1);
        arena.grow(100);
        arena.grow(50);
        arena.shrink(120);
        assert_eq!(arena.size(), 30);
        assert_eq!(arena.peak(), 150);
    }
}
