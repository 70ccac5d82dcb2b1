//! Telemetry counters for the submission subsystem.
//!
//! Counters are updated with relaxed atomics on the recording threads and are
//! safe to snapshot from anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GpuStats {
    frames: AtomicU64,
    submissions: AtomicU64,
    flushes: AtomicU64,
    sync_waits: AtomicU64,

    barriers: AtomicU64,
    deferred_transitions: AtomicU64,
    deferred_coalesced: AtomicU64,

    graphics_items: AtomicU64,
    compute_items: AtomicU64,
    raytrace_items: AtomicU64,

    pso_cache_hits: AtomicU64,
    pso_local_cache_hits: AtomicU64,
    pso_cache_misses: AtomicU64,
    pso_builds_failed: AtomicU64,
    pso_evictions: AtomicU64,

    transient_stalls: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $add:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl GpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_frames, add_frames, frames);
    counter!(inc_submissions, add_submissions, submissions);
    counter!(inc_flushes, add_flushes, flushes);
    counter!(inc_sync_waits, add_sync_waits, sync_waits);
    counter!(inc_barriers, add_barriers, barriers);
    counter!(inc_deferred_transitions, add_deferred_transitions, deferred_transitions);
    counter!(inc_deferred_coalesced, add_deferred_coalesced, deferred_coalesced);
    counter!(inc_graphics_items, add_graphics_items, graphics_items);
    counter!(inc_compute_items, add_compute_items, compute_items);
    counter!(inc_raytrace_items, add_raytrace_items, raytrace_items);
    counter!(inc_pso_cache_hits, add_pso_cache_hits, pso_cache_hits);
    counter!(inc_pso_local_cache_hits, add_pso_local_cache_hits, pso_local_cache_hits);
    counter!(inc_pso_cache_misses, add_pso_cache_misses, pso_cache_misses);
    counter!(inc_pso_builds_failed, add_pso_builds_failed, pso_builds_failed);
    counter!(inc_pso_evictions, add_pso_evictions, pso_evictions);
    counter!(inc_transient_stalls, add_transient_stalls, transient_stalls);

    pub fn snapshot(&self) -> GpuStatsSnapshot {
        GpuStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            sync_waits: self.sync_waits.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            deferred_transitions: self.deferred_transitions.load(Ordering::Relaxed),
            deferred_coalesced: self.deferred_coalesced.load(Ordering::Relaxed),
            graphics_items: self.graphics_items.load(Ordering::Relaxed),
            compute_items: self.compute_items.load(Ordering::Relaxed),
            raytrace_items: self.raytrace_items.load(Ordering::Relaxed),
            pso_cache_hits: self.pso_cache_hits.load(Ordering::Relaxed),
            pso_local_cache_hits: self.pso_local_cache_hits.load(Ordering::Relaxed),
            pso_cache_misses: self.pso_cache_misses.load(Ordering::Relaxed),
            pso_builds_failed: self.pso_builds_failed.load(Ordering::Relaxed),
            pso_evictions: self.pso_evictions.load(Ordering::Relaxed),
            transient_stalls: self.transient_stalls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuStatsSnapshot {
    pub frames: u64,
    pub submissions: u64,
    pub flushes: u64,
    pub sync_waits: u64,
    pub barriers: u64,
    pub deferred_transitions: u64,
    pub deferred_coalesced: u64,
    pub graphics_items: u64,
    pub compute_items: u64,
    pub raytrace_items: u64,
    pub pso_cache_hits: u64,
    pub pso_local_cache_hits: u64,
    pub pso_cache_misses: u64,
    pub pso_builds_failed: u64,
    pub pso_evictions: u64,
    pub transient_stalls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = GpuStats::new();
        stats.inc_frames();
        stats.inc_barriers();
        stats.add_barriers(3);
        stats.inc_pso_cache_misses();

        let snap = stats.snapshot();
        assert_eq!(snap.frames, 1);
        assert_eq!(snap.barriers, 4);
        assert_eq!(snap.pso_cache_misses, 1);
        assert_eq!(snap.pso_cache_hits, 0);
    }
}
