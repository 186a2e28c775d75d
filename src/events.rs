//! Hardware-event descriptors.
//!
//! The profiler asks for events by symbolic name; this module fills the
//! kernel's `perf_event_attr` for them. A small table covers the generic
//! hardware and cache events; anything micro-architectural is spelled the
//! way the perf tool spells it, as a raw descriptor `r<hex>` (for PEBS
//! load-address sampling that is the usual route). It also owns the perf
//! ABI types the sample reader needs: the mmap metadata page and the
//! record header.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// `PERF_ATTR_SIZE_VER5`: the attribute ABI revision this layout matches.
pub const PERF_ATTR_SIZE_VER5: u32 = 112;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;

const PERF_COUNT_HW_CACHE_LL: u64 = 2;
const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

/// `sample_type` flag: each record carries the sampled data address.
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;

/// Record type for samples.
pub const PERF_RECORD_SAMPLE: u32 = 9;

// perf_event_attr flag bits (bit positions in the packed flag word).
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
const ATTR_PRECISE_IP_SHIFT: u32 = 15;

/// The kernel's `perf_event_attr`, VER5 layout, flags packed into one word.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

/// The metadata page at the front of a perf mmap region. Only the ring
/// cursors matter here; everything before them is carried to keep the
/// kernel's layout.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub reserved: [u8; 116 * 8],
    /// Producer cursor; read with acquire semantics before parsing.
    pub data_head: u64,
    /// Consumer cursor; written with release semantics after parsing.
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Header preceding every ring-buffer record.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes, AsBytes)]
pub struct PerfEventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

/// A symbolic event resolved to a ready-to-open attribute.
#[derive(Clone, Debug)]
pub struct ResolvedEvent {
    /// The name as configured, kept for the report.
    pub name: String,
    /// The filled attribute.
    pub attr: PerfEventAttr,
}

/// Resolves a symbolic event name into a sampling attribute with the given
/// period. `None` means the name is unknown; the configuration surface
/// treats that as fatal.
pub fn resolve(name: &str, sample_period: u64) -> Option<ResolvedEvent> {
    let (kind, config) = lookup(name)?;
    let mut attr = PerfEventAttr {
        kind,
        size: PERF_ATTR_SIZE_VER5,
        config,
        sample_period,
        sample_type: PERF_SAMPLE_ADDR,
        flags: ATTR_DISABLED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
        ..PerfEventAttr::default()
    };
    // Ask for the most precise sampling the PMU offers; address samples
    // are useless when skid smears them across extents.
    attr.flags |= 2 << ATTR_PRECISE_IP_SHIFT;
    Some(ResolvedEvent { name: name.to_owned(), attr })
}

fn lookup(name: &str) -> Option<(u32, u64)> {
    if let Some(hex) = name.strip_prefix('r') {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some((PERF_TYPE_RAW, u64::from_str_radix(hex, 16).ok()?));
        }
    }
    let cache = |id: u64, op: u64, result: u64| (PERF_TYPE_HW_CACHE, id | (op << 8) | (result << 16));
    Some(match name {
        "cpu-cycles" | "cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        "instructions" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
        "cache-references" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
        "cache-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        "branch-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        "page-faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        "llc-loads" => cache(
            PERF_COUNT_HW_CACHE_LL,
            PERF_COUNT_HW_CACHE_OP_READ,
            PERF_COUNT_HW_CACHE_RESULT_ACCESS,
        ),
        "llc-load-misses" => cache(
            PERF_COUNT_HW_CACHE_LL,
            PERF_COUNT_HW_CACHE_OP_READ,
            PERF_COUNT_HW_CACHE_RESULT_MISS,
        ),
        "dtlb-load-misses" => cache(
            PERF_COUNT_HW_CACHE_DTLB,
            PERF_COUNT_HW_CACHE_OP_READ,
            PERF_COUNT_HW_CACHE_RESULT_MISS,
        ),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_names_resolve() {
        let ev = resolve("cache-misses", 1024).unwrap();
        assert_eq!(ev.attr.kind, PERF_TYPE_HARDWARE);
        assert_eq!(ev.attr.config, PERF_COUNT_HW_CACHE_MISSES);
        assert_eq!(ev.attr.sample_period, 1024);
        assert_eq!(ev.attr.sample_type, PERF_SAMPLE_ADDR);
        assert_eq!(ev.attr.size, PERF_ATTR_SIZE_VER5);
    }

    #[test]
    fn raw_descriptors_resolve() {
        let ev = resolve("r01d1", 512).unwrap();
        assert_eq!(ev.attr.kind, PERF_TYPE_RAW);
        assert_eq!(ev.attr.config, 0x01d1);
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        assert!(resolve("definitely-not-an-event", 1).is_none());
        assert!(resolve("rnothex", 1).is_none());
        assert!(resolve("", 1).is_none());
    }

    #[test]
    fn cache_events_pack_op_and_result() {
        let ev = resolve("llc-load-misses", 1).unwrap();
        assert_eq!(ev.attr.kind, PERF_TYPE_HW_CACHE);
        assert_eq!(ev.attr.config, 2 | (1 << 16));
    }
}
