//! Bounded-memory eviction (C6, spec §4.6).
//!
//! Runs once per capture-loop tick (§4.7), never inline with per-packet
//! processing. Two independent passes: an age sweep that drops anything
//! older than `MAX_AGE_MS` regardless of category, and a memory cap that
//! only ever bites fragment buffers, since every other state category
//! reports `expected_memory() == 0` (spec §4.6 defines the formula only in
//! terms of buffered bytes). Ascending sort means the zero-weight entries
//! are always in the retained prefix; the cap can only ever trim the
//! largest in-flight fragment buffers.

use tracing::info;

use crate::state::{Expirable, PipelineState};

/// Spec §4.6: "drop if `latest_ts - ts > 120_000 ms`".
pub const MAX_AGE_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub aged_out: usize,
    pub memory_capped: usize,
    pub before_bytes: usize,
    pub after_bytes: usize,
}

impl EvictionReport {
    pub fn total_dropped(&self) -> usize {
        self.aged_out + self.memory_capped
    }
}

/// Reads the process's address-space resource limit to derive `M` for the
/// memory cap (spec §4.6: "the process's maximum heap/address budget
/// (platform-reported)").
///
/// Open question (spec §9): not every runtime can report this reliably. On
/// non-Linux/Unix targets, or when the limit is reported as unlimited, we
/// fall back to a fixed 2 GiB budget rather than disabling the cap.
pub fn detect_max_memory() -> usize {
    const FALLBACK: usize = 2 * 1024 * 1024 * 1024;
    #[cfg(unix)]
    {
        unsafe {
            let mut limit: libc::rlimit = std::mem::zeroed();
            if libc::getrlimit(libc::RLIMIT_AS, &mut limit) == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
                return limit.rlim_cur as usize;
            }
        }
    }
    FALLBACK
}

/// Formats a byte count the way the progress log wants it (spec §4.6:
/// "human-friendly byte units").
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Runs the age sweep then the memory cap against `state`, logging a
/// summary line, and returns the counts for callers that want them (tests,
/// mostly — the capture loop only needs the log line).
pub fn evict(state: &mut PipelineState, latest_ts: i64, max_memory: usize) -> EvictionReport {
    let mut report = EvictionReport::default();

    let before = state.framer.buffers().len();
    state.framer.buffers_mut().retain(|_, buf| latest_ts - buf.ts() <= MAX_AGE_MS);
    report.aged_out += before - state.framer.buffers().len();

    let before = state.calls.len();
    state.calls.retain(|rec| latest_ts - rec.ts() <= MAX_AGE_MS);
    report.aged_out += before - state.calls.len();

    let before = state.scanners.open_scanner_count();
    state.scanners.retain_scanners(|rec| latest_ts - rec.ts() <= MAX_AGE_MS);
    report.aged_out += before - state.scanners.open_scanner_count();

    let before = state.scanners.pending_count();
    state.scanners.retain_pending(|ts| latest_ts - ts <= MAX_AGE_MS);
    report.aged_out += before - state.scanners.pending_count();

    let total: usize = state.framer.buffers().values().map(|b| b.expected_memory()).sum();
    report.before_bytes = total;
    let budget = max_memory / 2;
    if total > budget {
        let mut by_size: Vec<_> = state
            .framer
            .buffers()
            .iter()
            .map(|(k, v)| (*k, v.expected_memory()))
            .collect();
        by_size.sort_by_key(|(_, mem)| *mem);

        let mut running = 0usize;
        let mut to_drop = Vec::new();
        for (key, mem) in by_size {
            if running + mem < budget {
                running += mem;
            } else {
                to_drop.push(key);
            }
        }
        report.memory_capped = to_drop.len();
        for key in to_drop {
            state.framer.buffers_mut().remove(&key);
        }
        report.after_bytes = state.framer.buffers().values().map(|b| b.expected_memory()).sum();
    } else {
        report.after_bytes = total;
    }

    if report.total_dropped() > 0 {
        info!(
            dropped = report.total_dropped(),
            before = %format_bytes(report.before_bytes),
            after = %format_bytes(report.after_bytes),
            "Expired {} state object(s)",
            report.total_dropped()
        );
    }

    report
}
