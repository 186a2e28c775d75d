//! Pagemap residency profiler.
//!
//! Walks every live extent each interval, reads the corresponding slice of
//! `/proc/self/pagemap`, and counts pages with the present bit set. The
//! per-extent byte counts accumulate into the owning arena's record. A
//! short read skips that extent's contribution for the interval; the series
//! stays dense either way.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use zerocopy::AsBytes;

use crate::extent::ExtentTable;
use crate::profile::{IntervalProfiler, ProfileRegistry};

/// Bit 63 of a pagemap entry: page is present in RAM.
const PM_PRESENT: u64 = 1 << 63;

pub(crate) struct RssProfiler {
    pagemap: File,
    page_size: usize,
    registry: Arc<ProfileRegistry>,
    extents: Arc<ExtentTable>,
    /// Entry buffer, reused across extents and intervals.
    scratch: Mutex<Vec<u64>>,
}

impl RssProfiler {
    pub(crate) fn init(registry: Arc<ProfileRegistry>, extents: Arc<ExtentTable>) -> Result<Self> {
        let pagemap =
            File::open("/proc/self/pagemap").context("cannot open /proc/self/pagemap")?;
        Ok(Self {
            pagemap,
            page_size: crate::device::mmap::page_size(),
            registry,
            extents,
            scratch: Mutex::new(Vec::new()),
        })
    }

    /// Resident bytes of `[start, end)`, or `None` on a short read.
    fn resident_bytes(&self, start: usize, end: usize, scratch: &mut Vec<u64>) -> Option<usize> {
        let numpages = (end - start) / self.page_size;
        if numpages == 0 {
            return Some(0);
        }
        scratch.clear();
        scratch.resize(numpages, 0);
        let bytes = scratch.as_mut_slice().as_bytes_mut();
        let offset = (start / self.page_size) as u64 * 8;
        match self.pagemap.read_at(bytes, offset) {
            Ok(n) if n == numpages * 8 => {}
            _ => return None,
        }
        let resident = scratch.iter().filter(|&&entry| entry & PM_PRESENT != 0).count();
        Some(resident * self.page_size)
    }
}

impl IntervalProfiler for RssProfiler {
    fn name(&self) -> &'static str {
        "rss"
    }

    fn interval(&self) {
        for (_, rec) in self.registry.iter() {
            if let Some(rss) = rec.rss() {
                rss.zero_tmp();
            }
        }

        let mut scratch = self.scratch.lock().unwrap();
        self.extents.with_spans(|spans| {
            for span in spans {
                let Some(rec) = self.registry.get(span.slot) else {
                    continue;
                };
                let Some(rss) = rec.rss() else {
                    continue;
                };
                match self.resident_bytes(span.start, span.end, &mut scratch) {
                    Some(bytes) => rss.add_tmp(bytes),
                    None => {
                        tracing::debug!(
                            start = span.start,
                            end = span.end,
                            "short pagemap read, skipping extent"
                        );
                    }
                }
            }
        });

        for (_, rec) in self.registry.iter() {
            if rec.num_intervals() == 0 {
                continue;
            }
            if let Some(rss) = rec.rss() {
                rss.post_interval();
            }
        }
    }

    fn skip_interval(&self) {
        for (_, rec) in self.registry.iter() {
            if rec.num_intervals() == 0 {
                continue;
            }
            if let Some(rss) = rec.rss() {
                rss.carry_interval();
            }
        }
    }

    fn deinit(&self) {
        // The pagemap descriptor closes with the profiler.
        tracing::debug!("rss profiler torn down");
    }
}
