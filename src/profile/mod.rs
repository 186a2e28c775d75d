//! Per-arena profiling records and the profiler interface.
//!
//! The registry parallels the arena table: a record is created when its
//! arena is, and holds one sub-record per enabled profiler. Interval
//! arrays only ever append, one entry per master tick from the arena's
//! first interval on, so every array length equals the record's
//! `num_intervals`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

pub mod pmu;
pub mod report;
pub mod rss;
pub(crate) mod scheduler;

/// One profiler driven by the scheduler: sampled work per interval, a
/// carry-forward variant for skipped intervals, teardown at shutdown.
pub(crate) trait IntervalProfiler: Send + Sync {
    fn name(&self) -> &'static str;
    /// One interval of real sampling; also folds results into the records.
    fn interval(&self);
    /// Skipped interval: repeat the previous value so series stay dense.
    fn skip_interval(&self);
    /// Release OS resources. Called once, after the workers are joined.
    fn deinit(&self);
}

/// Per-event PMU series for one arena.
pub struct PerEventProfile {
    total: AtomicU64,
    peak: AtomicU64,
    /// Scratch for the interval in flight.
    tmp: AtomicU64,
    intervals: Mutex<Vec<u64>>,
}

impl PerEventProfile {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            tmp: AtomicU64::new(0),
            intervals: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn zero_tmp(&self) {
        self.tmp.store(0, Ordering::Relaxed);
    }

    pub(crate) fn bump_tmp(&self) {
        self.tmp.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the scratch accumulator into the series.
    pub(crate) fn post_interval(&self) {
        let tmp = self.tmp.load(Ordering::Relaxed);
        self.total.fetch_add(tmp, Ordering::Relaxed);
        self.peak.fetch_max(tmp, Ordering::Relaxed);
        self.intervals.lock().unwrap().push(tmp);
    }

    /// Repeats the previous interval (0 when none), counting it toward the
    /// total like a real observation.
    pub(crate) fn carry_interval(&self) {
        let mut intervals = self.intervals.lock().unwrap();
        let prev = intervals.last().copied().unwrap_or(0);
        intervals.push(prev);
        self.total.fetch_add(prev, Ordering::Relaxed);
    }

    /// Samples attributed over the process lifetime.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Largest single-interval count.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-interval series.
    pub fn intervals(&self) -> Vec<u64> {
        self.intervals.lock().unwrap().clone()
    }
}

/// Residency series for one arena.
pub struct RssArenaProfile {
    peak: AtomicUsize,
    tmp: AtomicUsize,
    intervals: Mutex<Vec<usize>>,
}

impl RssArenaProfile {
    fn new() -> Self {
        Self {
            peak: AtomicUsize::new(0),
            tmp: AtomicUsize::new(0),
            intervals: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn zero_tmp(&self) {
        self.tmp.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add_tmp(&self, bytes: usize) {
        self.tmp.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn post_interval(&self) {
        let tmp = self.tmp.load(Ordering::Relaxed);
        self.peak.fetch_max(tmp, Ordering::Relaxed);
        self.intervals.lock().unwrap().push(tmp);
    }

    pub(crate) fn carry_interval(&self) {
        let mut intervals = self.intervals.lock().unwrap();
        let prev = intervals.last().copied().unwrap_or(0);
        intervals.push(prev);
    }

    /// Largest resident set seen in any interval.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-interval series.
    pub fn intervals(&self) -> Vec<usize> {
        self.intervals.lock().unwrap().clone()
    }
}

/// Interval bookkeeping plus the per-profiler sub-records for one arena.
pub struct ProfileRecord {
    num_intervals: AtomicUsize,
    first_interval: AtomicUsize,
    pmu: Option<Vec<PerEventProfile>>,
    rss: Option<RssArenaProfile>,
}

impl ProfileRecord {
    fn new(num_events: usize, rss_enabled: bool) -> Self {
        Self {
            num_intervals: AtomicUsize::new(0),
            first_interval: AtomicUsize::new(0),
            pmu: (num_events > 0).then(|| (0..num_events).map(|_| PerEventProfile::new()).collect()),
            rss: rss_enabled.then(RssArenaProfile::new),
        }
    }

    /// Ticks this arena has been live for.
    pub fn num_intervals(&self) -> usize {
        self.num_intervals.load(Ordering::Acquire)
    }

    /// The scheduler interval during which the arena appeared.
    pub fn first_interval(&self) -> usize {
        self.first_interval.load(Ordering::Relaxed)
    }

    pub(crate) fn set_first_interval(&self, interval: usize) {
        self.first_interval.store(interval, Ordering::Relaxed);
    }

    pub(crate) fn advance_interval(&self) {
        self.num_intervals.fetch_add(1, Ordering::Release);
    }

    /// PMU series, one per configured event.
    pub fn pmu_events(&self) -> Option<&[PerEventProfile]> {
        self.pmu.as_deref()
    }

    /// Residency series.
    pub fn rss(&self) -> Option<&RssArenaProfile> {
        self.rss.as_ref()
    }
}

/// Slot-indexed profile records, created in step with arenas.
pub struct ProfileRegistry {
    records: Box<[OnceLock<ProfileRecord>]>,
    num_events: usize,
    rss_enabled: bool,
}

impl ProfileRegistry {
    pub(crate) fn new(max_arenas: usize, num_events: usize, rss_enabled: bool) -> Self {
        Self {
            records: (0..max_arenas).map(|_| OnceLock::new()).collect(),
            num_events,
            rss_enabled,
        }
    }

    /// Creates the record for a freshly created arena.
    pub(crate) fn create_arena_profile(&self, slot: usize) {
        let _ = self.records[slot].set(ProfileRecord::new(self.num_events, self.rss_enabled));
    }

    /// The record for `slot`, if its arena exists and profiling is on.
    pub fn get(&self, slot: usize) -> Option<&ProfileRecord> {
        self.records.get(slot)?.get()
    }

    /// Live records with their slots.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProfileRecord)> {
        self.records.iter().enumerate().filter_map(|(slot, cell)| Some((slot, cell.get()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_created_once_per_slot() {
        let reg = ProfileRegistry::new(8, 1, true);
        assert!(reg.get(2).is_none());
        reg.create_arena_profile(2);
        reg.create_arena_profile(2);
        let rec = reg.get(2).unwrap();
        assert_eq!(rec.num_intervals(), 0);
        assert_eq!(reg.iter().count(), 1);
    }

    #[test]
    fn sub_records_follow_enabled_profilers() {
        let reg = ProfileRegistry::new(4, 2, false);
        reg.create_arena_profile(0);
        let rec = reg.get(0).unwrap();
        assert_eq!(rec.pmu_events().unwrap().len(), 2);
        assert!(rec.rss().is_none());
    }

    #[test]
    fn event_series_tracks_total_and_peak() {
        let ev = PerEventProfile::new();
        ev.zero_tmp();
        ev.bump_tmp();
        ev.bump_tmp();
        ev.post_interval();
        ev.zero_tmp();
        ev.bump_tmp();
        ev.post_interval();
        assert_eq!(ev.intervals(), vec![2, 1]);
        assert_eq!(ev.total(), 3);
        assert_eq!(ev.peak(), 2);
    }

    #[test]
    fn carry_repeats_the_previous_interval() {
        let ev = PerEventProfile::new();
        ev.carry_interval();
        assert_eq!(ev.intervals(), vec![0]);
        ev.zero_tmp();
        ev.bump_tmp();
        ev.post_interval();
        ev.carry_interval();
        assert_eq!(ev.intervals(), vec![0, 1, 1]);
        assert_eq!(ev.total(), 2);
    }

    #[test]
    fn rss_series_tracks_peak() {
        let rss = RssArenaProfile::new();
        rss.zero_tmp();
        rss.add_tmp(4096);
        rss.add_tmp(4096);
        rss.post_interval();
        rss.zero_tmp();
        rss.post_interval();
        rss.carry_interval();
        assert_eq!(rss.intervals(), vec![8192, 0, 0]);
        assert_eq!(rss.peak(), 8192);
    }
}
