//! PMU address-sample profiler.
//!
//! One `perf_event_open` descriptor per configured event, opened against
//! the thread that initializes the runtime and any CPU, each with its own
//! mmap'd ring. Every interval the ring is drained under the perf ABI
//! contract — acquire `data_head`, copy the readable region out, parse,
//! release `data_tail` — and each sampled data address is attributed to
//! the arena whose extent covers it.

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use zerocopy::FromBytes;

use crate::events::{PerfEventHeader, PerfEventMmapPage, ResolvedEvent, PERF_RECORD_SAMPLE};
use crate::extent::ExtentTable;
use crate::profile::{IntervalProfiler, ProfileRegistry};

// perf_event ioctls.
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

/// One open event: the descriptor and its ring mapping.
struct EventSampler {
    name: String,
    fd: libc::c_int,
    ring: *mut PerfEventMmapPage,
    ring_len: usize,
}

pub(crate) struct PmuProfiler {
    samplers: Vec<EventSampler>,
    registry: Arc<ProfileRegistry>,
    extents: Arc<ExtentTable>,
    page_size: usize,
    /// Bytes of sample data per ring (the metadata page is extra).
    data_size: usize,
}

// Ring pointers are only touched by the worker's handler and by `deinit`
// after the worker is joined.
unsafe impl Send for PmuProfiler {}
unsafe impl Sync for PmuProfiler {}

impl PmuProfiler {
    /// Opens and enables every configured event.
    ///
    /// Must run on the thread whose memory traffic should be sampled; the
    /// descriptors are scoped to the calling thread on any CPU.
    pub(crate) fn init(
        events: &[ResolvedEvent],
        max_sample_pages: usize,
        registry: Arc<ProfileRegistry>,
        extents: Arc<ExtentTable>,
    ) -> Result<Self> {
        let page_size = crate::device::mmap::page_size();
        let data_size = max_sample_pages * page_size;
        let mut samplers = Vec::with_capacity(events.len());

        for event in events {
            let fd = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &event.attr as *const _,
                    0 as libc::pid_t,  // calling thread
                    -1 as libc::c_int, // any CPU
                    -1 as libc::c_int, // no group
                    0 as libc::c_ulong,
                ) as libc::c_int
            };
            if fd < 0 {
                bail!(
                    "perf_event_open failed for {:?}: {}",
                    event.name,
                    std::io::Error::last_os_error()
                );
            }
            let ring_len = page_size + data_size;
            let ring = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    ring_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if ring == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err).with_context(|| {
                    format!("cannot map {ring_len} bytes of sample ring for {:?}", event.name)
                });
            }
            unsafe {
                libc::ioctl(fd, PERF_EVENT_IOC_RESET, 0);
                libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0);
            }
            samplers.push(EventSampler {
                name: event.name.clone(),
                fd,
                ring: ring.cast::<PerfEventMmapPage>(),
                ring_len,
            });
        }

        Ok(Self { samplers, registry, extents, page_size, data_size })
    }

    /// Drains one event's ring into a scratch buffer, honoring the ring
    /// cursor protocol.
    fn drain(&self, sampler: &EventSampler) -> Vec<u8> {
        unsafe {
            let head = ptr::read_volatile(ptr::addr_of!((*sampler.ring).data_head));
            fence(Ordering::Acquire);
            let tail = ptr::read_volatile(ptr::addr_of!((*sampler.ring).data_tail));

            let avail = (head.wrapping_sub(tail) as usize).min(self.data_size);
            let mut buf = vec![0u8; avail];
            if avail > 0 {
                let base = sampler.ring.cast::<u8>().add(self.page_size);
                let off = (tail as usize) % self.data_size;
                let first = avail.min(self.data_size - off);
                ptr::copy_nonoverlapping(base.add(off), buf.as_mut_ptr(), first);
                if first < avail {
                    ptr::copy_nonoverlapping(base, buf.as_mut_ptr().add(first), avail - first);
                }
            }

            fence(Ordering::Release);
            ptr::write_volatile(ptr::addr_of_mut!((*sampler.ring).data_tail), head);
            buf
        }
    }

    /// Walks the copied records and collects non-null sample addresses.
    fn parse_addrs(buf: &[u8]) -> Vec<u64> {
        let mut addrs = Vec::new();
        let mut off = 0;
        while off + core::mem::size_of::<PerfEventHeader>() <= buf.len() {
            let Some(header) = PerfEventHeader::read_from_prefix(&buf[off..]) else {
                break;
            };
            let size = header.size as usize;
            if size == 0 {
                break;
            }
            if header.kind == PERF_RECORD_SAMPLE && size >= 16 && off + 16 <= buf.len() {
                if let Some(addr) = u64::read_from_prefix(&buf[off + 8..]) {
                    if addr != 0 {
                        addrs.push(addr);
                    }
                }
            }
            off += size;
        }
        addrs
    }
}

impl IntervalProfiler for PmuProfiler {
    fn name(&self) -> &'static str {
        "pmu"
    }

    fn interval(&self) {
        for (index, sampler) in self.samplers.iter().enumerate() {
            for (_, rec) in self.registry.iter() {
                if let Some(events) = rec.pmu_events() {
                    events[index].zero_tmp();
                }
            }

            let buf = self.drain(sampler);
            let addrs = Self::parse_addrs(&buf);

            self.extents.with_spans(|spans| {
                for &addr in &addrs {
                    let addr = addr as usize;
                    for span in spans {
                        if span.start <= addr && addr <= span.end {
                            if let Some(rec) = self.registry.get(span.slot) {
                                if let Some(events) = rec.pmu_events() {
                                    events[index].bump_tmp();
                                }
                            }
                        }
                    }
                }
            });
        }

        for (_, rec) in self.registry.iter() {
            if rec.num_intervals() == 0 {
                continue;
            }
            if let Some(events) = rec.pmu_events() {
                for event in events {
                    event.post_interval();
                }
            }
        }
    }

    fn skip_interval(&self) {
        for (_, rec) in self.registry.iter() {
            if rec.num_intervals() == 0 {
                continue;
            }
            if let Some(events) = rec.pmu_events() {
                for event in events {
                    event.carry_interval();
                }
            }
        }
    }

    fn deinit(&self) {
        for sampler in &self.samplers {
            unsafe {
                libc::ioctl(sampler.fd, PERF_EVENT_IOC_DISABLE, 0);
                libc::munmap(sampler.ring.cast(), sampler.ring_len);
                libc::close(sampler.fd);
            }
        }
        tracing::debug!(events = self.samplers.len(), "pmu profiler torn down");
    }
}
