//! Extent index: ordered interval map from address ranges to arena slots.
//!
//! An insertion-ordered array of `[start, end)` spans behind a
//! reader/writer lock. Writers are rare (one insert or delete per coarse
//! mapping the backend makes); the readers are the profilers, which walk
//! the whole array every interval. Lookup is a linear scan on purpose: the
//! scan at profile time dominates, locality matters, and the number of
//! live extents stays small next to the number of allocations. A sorted
//! interval tree would be a drop-in replacement behind [`ExtentTable::for_each`]
//! if that ever changes.

use std::sync::RwLock;

use crate::device::ExtentSink;
use crate::fault::fatal;
use crate::runtime::tls;

/// One mapped extent and the arena slot that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// First address of the extent.
    pub start: usize,
    /// One past the last address.
    pub end: usize,
    /// Owning arena slot.
    pub slot: usize,
}

/// The index. Shared between the allocation path (writes) and the
/// profilers (reads); also the backend's [`ExtentSink`].
pub struct ExtentTable {
    epoch: u64,
    spans: RwLock<Vec<Span>>,
}

impl ExtentTable {
    pub(crate) fn new(epoch: u64) -> Self {
        Self { epoch, spans: RwLock::new(Vec::new()) }
    }

    /// Records `[start, end)` as owned by `slot`.
    pub fn insert(&self, start: usize, end: usize, slot: usize) {
        let mut spans = self.spans.write().unwrap();
        spans.push(Span { start, end, slot });
    }

    /// Removes the extent starting at `start` and advises the kernel that
    /// the range is no longer needed.
    pub fn delete(&self, start: usize) {
        let mut spans = self.spans.write().unwrap();
        if let Some(pos) = spans.iter().position(|s| s.start == start) {
            let span = spans.swap_remove(pos);
            unsafe {
                libc::madvise(
                    span.start as *mut libc::c_void,
                    span.end - span.start,
                    libc::MADV_DONTNEED,
                );
            }
        }
    }

    /// Visits every span under the read lock.
    pub fn for_each(&self, mut visitor: impl FnMut(Span)) {
        self.with_spans(|spans| {
            for span in spans {
                visitor(*span);
            }
        });
    }

    /// Runs `f` over the whole span array under one read-lock hold. The
    /// profilers use this so a full scan pays for the lock once.
    pub fn with_spans<R>(&self, f: impl FnOnce(&[Span]) -> R) -> R {
        let spans = self.spans.read().unwrap();
        f(&spans)
    }

    /// Reverse-maps an address to its owning slot, if any.
    pub fn lookup(&self, addr: usize) -> Option<usize> {
        let spans = self.spans.read().unwrap();
        spans.iter().find(|s| s.start <= addr && addr < s.end).map(|s| s.slot)
    }

    /// Number of live extents.
    pub fn len(&self) -> usize {
        self.spans.read().unwrap().len()
    }

    /// True when no extents are live.
    pub fn is_empty(&self) -> bool {
        self.spans.read().unwrap().is_empty()
    }
}

impl ExtentSink for ExtentTable {
    fn extent_created(&self, start: usize, end: usize) {
        // The front-end parks the target slot in a thread-local right
        // before calling into the backend; a mapping that arrives without
        // one did not come through the front-end.
        let Some(slot) = tls::pending_index(self.epoch) else {
            fatal!("extent {start:#x}..{end:#x} mapped outside an allocation");
        };
        self.insert(start, end, slot);
    }

    fn extent_destroyed(&self, start: usize, _end: usize) {
        self.delete(start);
    }
}
