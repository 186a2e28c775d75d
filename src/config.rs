//! Runtime configuration.
//!
//! The embedded runtime reads everything from `SH_*` environment variables;
//! embedders and tests fill a [`Config`] directly. Malformed numeric values
//! fall back to their defaults with a warning, the way a runtime linked
//! into someone else's binary has to. Unresolvable event names and illegal
//! profiling parameters are errors: silently profiling the wrong thing is
//! worse than not starting.

use std::env;

use anyhow::{bail, Context, Result};

use crate::device::{Device, DeviceList};
use crate::events::{self, ResolvedEvent};
use crate::layout::ArenaLayout;

/// Upstream allocator limit on arena count.
pub const MAX_ARENAS_LIMIT: usize = 4096;

const DEFAULT_MAX_SITES: usize = 4096;
const DEFAULT_BIG_SMALL_THRESHOLD: usize = 4 << 20;
const DEFAULT_PROFILE_RATE_NSEC: u64 = 1_000_000_000;
const DEFAULT_MAX_SAMPLE_PAGES: usize = 64;
const DEFAULT_SAMPLE_PERIOD: u64 = 2048;

/// Everything the runtime needs to know before the first allocation.
#[derive(Clone, Debug)]
pub struct Config {
    /// Arena layout policy.
    pub layout: ArenaLayout,
    /// Threads the runtime will ever index; exceeding it is fatal.
    pub max_threads: usize,
    /// Arena slots; site slots wrap modulo this.
    pub max_arenas: usize,
    /// Site ids must stay below this bound.
    pub max_sites: usize,
    /// Device used when a site has no preference.
    pub default_device: Device,
    /// Fast tier for the device-keyed and big/small layouts.
    pub upper_device: Device,
    /// Slow tier for the device-keyed layout.
    pub lower_device: Device,
    /// Static site → device seeding.
    pub site_devices: Vec<(u32, Device)>,
    /// Promotion threshold for the big/small layout, in bytes.
    pub big_small_threshold: usize,
    /// Run the interval profiler.
    pub should_profile: bool,
    /// Track every allocation's size against its arena.
    pub profile_allocs: bool,
    /// Invoke the read-distance hook on alloc/realloc/free.
    pub run_rdspy: bool,
    /// Scheduler tick period in nanoseconds.
    pub profile_rate_nsec: u64,
    /// PMU events to sample; empty disables the PMU profiler.
    pub pmu_events: Vec<ResolvedEvent>,
    /// Enable the pagemap residency profiler.
    pub profile_rss: bool,
    /// The RSS profiler runs every this-many ticks.
    pub rss_skip_intervals: usize,
    /// Ring-buffer data pages per event; power of two.
    pub max_sample_pages: usize,
    /// PMU sample period.
    pub sample_period: u64,
}

impl Config {
    /// A pass-through configuration over the given devices. Tests and
    /// embedders start here and override what they need.
    pub fn defaults(devices: &DeviceList) -> Self {
        Self {
            layout: ArenaLayout::Invalid,
            max_threads: possible_cpus(),
            max_arenas: MAX_ARENAS_LIMIT,
            max_sites: DEFAULT_MAX_SITES,
            default_device: devices.first(),
            upper_device: devices.first(),
            lower_device: devices.last(),
            site_devices: Vec::new(),
            big_small_threshold: DEFAULT_BIG_SMALL_THRESHOLD,
            should_profile: false,
            profile_allocs: false,
            run_rdspy: false,
            profile_rate_nsec: DEFAULT_PROFILE_RATE_NSEC,
            pmu_events: Vec::new(),
            profile_rss: false,
            rss_skip_intervals: 1,
            max_sample_pages: DEFAULT_MAX_SAMPLE_PAGES,
            sample_period: DEFAULT_SAMPLE_PERIOD,
        }
    }

    /// Reads the `SH_*` environment surface.
    pub fn from_env(devices: &DeviceList) -> Result<Self> {
        let mut cfg = Self::defaults(devices);

        // Unset and unparseable are different cases: no variable means the
        // site-keyed default, a value that does not parse means pass-through.
        cfg.layout = match env::var("SH_ARENA_LAYOUT") {
            Ok(raw) => raw.parse().unwrap_or_else(|()| {
                tracing::warn!(layout = %raw, "unknown arena layout, passing through");
                ArenaLayout::Invalid
            }),
            Err(_) => ArenaLayout::SharedSiteArenas,
        };

        cfg.max_threads = env_count("SH_MAX_THREADS", cfg.max_threads);
        cfg.max_arenas = env_count("SH_MAX_ARENAS", cfg.max_arenas);
        if cfg.max_arenas > MAX_ARENAS_LIMIT {
            tracing::warn!(
                max_arenas = cfg.max_arenas,
                limit = MAX_ARENAS_LIMIT,
                "arena count above the allocator limit, clamping"
            );
            cfg.max_arenas = MAX_ARENAS_LIMIT;
        }
        cfg.max_sites = env_count("SH_MAX_SITES", cfg.max_sites);
        if let Ok(raw) = env::var("SH_BIG_SMALL_THRESHOLD") {
            cfg.big_small_threshold = raw
                .parse()
                .ok()
                .filter(|&n: &usize| n > 0)
                .with_context(|| format!("SH_BIG_SMALL_THRESHOLD: invalid threshold {raw:?}"))?;
        }

        if let Ok(tag) = env::var("SH_DEFAULT_DEVICE") {
            match devices.find(&tag) {
                Some(device) => cfg.default_device = device,
                None => tracing::warn!(
                    tag = %tag,
                    "default device tag not enumerated, using the first device"
                ),
            }
        }
        cfg.upper_device = env_device(devices, "SH_UPPER_DEVICE", cfg.default_device);
        cfg.lower_device = env_device(devices, "SH_LOWER_DEVICE", devices.last());
        cfg.site_devices = parse_site_devices(devices)?;

        cfg.should_profile = env::var_os("SH_PROFILING").is_some();
        cfg.profile_allocs = env::var_os("SH_PROFILE_ALLOCS").is_some();
        cfg.run_rdspy = env::var_os("SH_RDSPY").is_some();
        cfg.profile_rss = env::var_os("SH_PROFILE_RSS").is_some();

        if let Ok(raw) = env::var("SH_PROFILE_RATE_NSEC") {
            cfg.profile_rate_nsec = raw
                .parse()
                .ok()
                .filter(|&n: &u64| n > 0)
                .with_context(|| format!("SH_PROFILE_RATE_NSEC: invalid period {raw:?}"))?;
        }
        if let Ok(raw) = env::var("SH_PROFILE_RSS_SKIP_INTERVALS") {
            cfg.rss_skip_intervals = raw
                .parse()
                .ok()
                .filter(|&n: &usize| n >= 1)
                .with_context(|| format!("SH_PROFILE_RSS_SKIP_INTERVALS: must be >= 1, got {raw:?}"))?;
        }
        if let Ok(raw) = env::var("SH_MAX_SAMPLE_PAGES") {
            cfg.max_sample_pages = raw
                .parse()
                .ok()
                .filter(|&n: &usize| n.is_power_of_two())
                .with_context(|| format!("SH_MAX_SAMPLE_PAGES: must be a power of two, got {raw:?}"))?;
        }
        if let Ok(raw) = env::var("SH_SAMPLE_PERIOD") {
            cfg.sample_period = raw
                .parse()
                .ok()
                .filter(|&n: &u64| n > 0)
                .with_context(|| format!("SH_SAMPLE_PERIOD: invalid period {raw:?}"))?;
        }

        if let Ok(raw) = env::var("SH_PROFILE_ALL_EVENTS") {
            for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match events::resolve(name, cfg.sample_period) {
                    Some(ev) => cfg.pmu_events.push(ev),
                    None => bail!("SH_PROFILE_ALL_EVENTS: cannot resolve event {name:?}"),
                }
            }
        }

        Ok(cfg)
    }

    /// Echoes the effective configuration, the way operators expect to see
    /// it in the log.
    pub fn log(&self) {
        tracing::info!(
            layout = %self.layout,
            max_threads = self.max_threads,
            max_arenas = self.max_arenas,
            max_sites = self.max_sites,
            default_device = self.default_device.kind.tag(),
            default_node = self.default_device.numa_node,
            "arena runtime configured"
        );
        if self.should_profile {
            tracing::info!(
                rate_nsec = self.profile_rate_nsec,
                pmu_events = self.pmu_events.len(),
                rss = self.profile_rss,
                rss_skip = self.rss_skip_intervals,
                "profiling enabled"
            );
        }
    }
}

/// Number of CPUs the system could ever online.
fn possible_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Positive-integer option; malformed or zero values keep the default.
fn env_count(name: &str, default: usize) -> usize {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            tracing::warn!(option = name, value = %raw, default, "invalid value, using default");
            default
        }
    }
}

fn env_device(devices: &DeviceList, name: &str, default: Device) -> Device {
    let Ok(spec) = env::var(name) else {
        return default;
    };
    match devices.find(&spec) {
        Some(device) => device,
        None => {
            tracing::warn!(option = name, spec = %spec, "device not enumerated, using default");
            default
        }
    }
}

/// `SH_SITE_DEVICES=site:device,...` — the placement a downstream
/// optimizer computed from the previous run's report.
fn parse_site_devices(devices: &DeviceList) -> Result<Vec<(u32, Device)>> {
    let Ok(raw) = env::var("SH_SITE_DEVICES") else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (site, spec) = entry
            .split_once(':')
            .with_context(|| format!("SH_SITE_DEVICES: malformed entry {entry:?}"))?;
        let site: u32 = site
            .parse()
            .with_context(|| format!("SH_SITE_DEVICES: bad site id in {entry:?}"))?;
        let device = devices
            .find(spec)
            .with_context(|| format!("SH_SITE_DEVICES: unknown device in {entry:?}"))?;
        out.push((site, device));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn one_device() -> DeviceList {
        DeviceList::new(vec![Device { id: 0, kind: DeviceKind::Dram, numa_node: 0 }])
    }

    #[test]
    fn defaults_are_passthrough() {
        let cfg = Config::defaults(&one_device());
        assert!(cfg.layout.is_passthrough());
        assert!(!cfg.should_profile);
        assert_eq!(cfg.max_arenas, MAX_ARENAS_LIMIT);
        assert_eq!(cfg.rss_skip_intervals, 1);
    }

    #[test]
    fn tier_endpoints_default_to_the_edges() {
        let devices = DeviceList::new(vec![
            Device { id: 0, kind: DeviceKind::HighBandwidth, numa_node: 0 },
            Device { id: 1, kind: DeviceKind::Dram, numa_node: 1 },
        ]);
        let cfg = Config::defaults(&devices);
        assert_eq!(cfg.upper_device, devices.first());
        assert_eq!(cfg.lower_device, devices.last());
    }
}
