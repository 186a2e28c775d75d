//! The shutdown report.
//!
//! The downstream placement optimizer consumes this: per arena, the sites
//! that allocated there, when the arena appeared, and the full per-interval
//! series for every sampled event and for residency. Two renderings share
//! one structure — a human-readable text dump and JSON.

use std::io::{self, Write};

use serde::Serialize;

use crate::arena::ArenaTable;
use crate::config::Config;
use crate::profile::ProfileRegistry;

/// Per-interval series for one PMU event on one arena.
#[derive(Debug, Serialize)]
pub struct EventSeries {
    /// Event name as configured.
    pub name: String,
    /// Samples attributed over the arena's lifetime.
    pub total: u64,
    /// Largest single-interval count.
    pub peak: u64,
    /// One entry per interval the arena was live.
    pub intervals: Vec<u64>,
}

/// Residency series for one arena.
#[derive(Debug, Serialize)]
pub struct RssSeries {
    /// Largest resident byte count seen in any interval.
    pub peak: usize,
    /// One entry per interval the arena was live.
    pub intervals: Vec<usize>,
}

/// Everything the profiler learned about one arena.
#[derive(Debug, Serialize)]
pub struct ArenaReport {
    /// The arena's slot.
    pub slot: usize,
    /// Sites that allocated here, in arrival order.
    pub sites: Vec<u32>,
    /// Scheduler interval during which the arena appeared.
    pub first_interval: usize,
    /// Intervals the arena was live for.
    pub num_intervals: usize,
    /// One series per configured PMU event.
    pub events: Vec<EventSeries>,
    /// Residency series, when the pagemap profiler ran.
    pub rss: Option<RssSeries>,
}

/// The full shutdown report.
#[derive(Debug, Serialize)]
pub struct Report {
    /// One entry per live arena, slot order.
    pub arenas: Vec<ArenaReport>,
}

impl Report {
    /// Snapshots the registry against the arena table.
    pub(crate) fn collect(cfg: &Config, arenas: &ArenaTable, registry: &ProfileRegistry) -> Self {
        let mut out = Vec::new();
        for arena in arenas.iter() {
            let Some(rec) = registry.get(arena.slot()) else {
                continue;
            };
            let events = match rec.pmu_events() {
                Some(series) => cfg
                    .pmu_events
                    .iter()
                    .zip(series)
                    .map(|(event, profile)| EventSeries {
                        name: event.name.clone(),
                        total: profile.total(),
                        peak: profile.peak(),
                        intervals: profile.intervals(),
                    })
                    .collect(),
                None => Vec::new(),
            };
            let rss = rec.rss().map(|profile| RssSeries {
                peak: profile.peak(),
                intervals: profile.intervals(),
            });
            out.push(ArenaReport {
                slot: arena.slot(),
                sites: arena.sites(),
                first_interval: rec.first_interval(),
                num_intervals: rec.num_intervals(),
                events,
                rss,
            });
        }
        Self { arenas: out }
    }

    /// True when no arena was profiled.
    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// The human-readable rendering.
    pub fn write_text<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "===== PROFILE RESULTS =====")?;
        for arena in &self.arenas {
            write!(w, "arena {} sites:", arena.slot)?;
            for site in &arena.sites {
                write!(w, " {site}")?;
            }
            writeln!(w)?;
            writeln!(w, "  first interval: {}", arena.first_interval)?;
            writeln!(w, "  intervals: {}", arena.num_intervals)?;
            if let Some(rss) = &arena.rss {
                writeln!(w, "  rss peak: {}", rss.peak)?;
                for value in &rss.intervals {
                    writeln!(w, "    {value}")?;
                }
            }
            for event in &arena.events {
                writeln!(w, "  event {}:", event.name)?;
                writeln!(w, "    total: {}", event.total)?;
                writeln!(w, "    peak: {}", event.peak)?;
                for value in &event.intervals {
                    writeln!(w, "      {value}")?;
                }
            }
        }
        writeln!(w, "===== END PROFILE RESULTS =====")
    }

    /// The JSON rendering.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        Report {
            arenas: vec![ArenaReport {
                slot: 3,
                sites: vec![7, 9],
                first_interval: 1,
                num_intervals: 2,
                events: vec![EventSeries {
                    name: "cache-misses".into(),
                    total: 5,
                    peak: 4,
                    intervals: vec![4, 1],
                }],
                rss: Some(RssSeries { peak: 8192, intervals: vec![8192, 4096] }),
            }],
        }
    }

    #[test]
    fn text_rendering_lists_sites_and_series() {
        let mut buf = Vec::new();
        sample_report().write_text(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("arena 3 sites: 7 9"));
        assert!(text.contains("rss peak: 8192"));
        assert!(text.contains("event cache-misses:"));
        assert!(text.contains("total: 5"));
    }

    #[test]
    fn json_rendering_round_trips() {
        let json = sample_report().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["arenas"][0]["slot"], 3);
        assert_eq!(value["arenas"][0]["rss"]["peak"], 8192);
        assert_eq!(value["arenas"][0]["events"][0]["intervals"][0], 4);
    }

    #[test]
    fn empty_reports_say_so() {
        assert!(Report { arenas: Vec::new() }.is_empty());
        assert!(!sample_report().is_empty());
    }
}
