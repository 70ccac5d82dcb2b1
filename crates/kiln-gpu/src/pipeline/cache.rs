//! Shared find-or-create pipeline cache.
//!
//! One cache exists per pipeline kind. Lookups take the read lock; a miss
//! upgrades to the write lock just long enough to insert an unresolved entry,
//! and the build itself runs with no lock held. A failed build resolves the
//! entry to "no pipeline" and the entry stays in the map, so the same
//! description is never handed to the driver twice.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use hashbrown::HashMap;

use crate::device::FRAME_RING_SIZE;
use crate::native::{NativeDevice, NativePipeline, PipelineKind};
use crate::stats::GpuStats;

use super::key::{seal_key, KeyHashState, MAX_KEY_STORAGE};
use super::local::HashedCircularCache;
use super::PipelineDesc;

/// Frames of disuse after which a sweep may drop an entry. Must exceed the
/// frame ring depth so an entry referenced by an in-flight frame is never
/// dropped.
pub const UNUSED_AGE_THRESHOLD: u64 = 50_000;

const _: () = assert!(UNUSED_AGE_THRESHOLD > FRAME_RING_SIZE as u64);

const SWEEP_CREDIT: f32 = 2.0;
const SWEEP_EVICTION_REFUND: f32 = 0.8;

pub const LOCAL_CACHE_BUCKETS: usize = 137;
pub const LOCAL_CACHE_WAYS: usize = 16;

/// Per-recorder lookaside over the shared map, addressed by sealed key hash.
pub type LocalPipelineCache =
    HashedCircularCache<Box<[u8]>, Arc<CachedPipeline>, LOCAL_CACHE_BUCKETS, LOCAL_CACHE_WAYS>;

/// A cache entry. The slot starts unresolved while the inserting thread
/// builds; it resolves exactly once, to either a pipeline or a permanent
/// failure marker.
pub struct CachedPipeline {
    kind: PipelineKind,
    slot: OnceLock<Option<NativePipeline>>,
    last_used_frame: AtomicU64,
}

impl CachedPipeline {
    fn new(kind: PipelineKind, frame: u64) -> Self {
        Self {
            kind,
            slot: OnceLock::new(),
            last_used_frame: AtomicU64::new(frame),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn pipeline(&self) -> Option<&NativePipeline> {
        self.slot.get().and_then(|slot| slot.as_ref())
    }

    /// False while the inserting thread is still building.
    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// True once a build has failed. Failed entries are permanent.
    pub fn is_failed(&self) -> bool {
        matches!(self.slot.get(), Some(None))
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame.load(Ordering::Relaxed)
    }

    fn touch(&self, frame: u64) {
        self.last_used_frame.store(frame, Ordering::Relaxed);
    }

    fn resolve(&self, built: Option<NativePipeline>) {
        if self.slot.set(built).is_err() {
            debug_assert!(false, "cache entry resolved twice");
        }
    }
}

struct SweepState {
    cursor: Option<Box<[u8]>>,
}

pub struct PipelineCache<D: PipelineDesc> {
    map: RwLock<HashMap<Box<[u8]>, Arc<CachedPipeline>, KeyHashState>>,
    sweep: Mutex<SweepState>,
    _kind: PhantomData<fn() -> D>,
}

impl<D: PipelineDesc> PipelineCache<D> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::with_hasher(KeyHashState::default())),
            sweep: Mutex::new(SweepState { cursor: None }),
            _kind: PhantomData,
        }
    }

    /// Returns the cache entry for `desc`, creating and building it if this
    /// is the first time the description is seen.
    ///
    /// The entry is returned even when the build failed or is still running
    /// on another thread; callers inspect the slot to decide how to proceed.
    pub fn find_or_create(
        &self,
        desc: &D,
        local: &mut LocalPipelineCache,
        native: &NativeDevice,
        stats: &GpuStats,
        current_frame: u64,
    ) -> Arc<CachedPipeline> {
        let mut scratch = [0u8; MAX_KEY_STORAGE];
        let len = desc.write_key(&mut scratch);
        debug_assert_eq!(len, D::KEY_SIZE);
        let hash = seal_key(&mut scratch[..len]);
        let key = &scratch[..len];

        if let Some(entry) = local.find_hashed(hash, key) {
            stats.inc_pso_local_cache_hits();
            entry.touch(current_frame);
            return Arc::clone(entry);
        }

        if let Some(entry) = self.map.read().unwrap().get(key).cloned() {
            stats.inc_pso_cache_hits();
            entry.touch(current_frame);
            local.insert_hashed(hash, Box::from(key), Arc::clone(&entry));
            return entry;
        }

        stats.inc_pso_cache_misses();
        let (entry, build_here) = {
            let mut map = self.map.write().unwrap();
            match map.get(key) {
                // Lost the race; the other thread owns the build.
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let entry = Arc::new(CachedPipeline::new(D::KIND, current_frame));
                    map.insert(Box::from(key), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if build_here {
            let built = desc.build(native);
            if built.is_none() {
                stats.inc_pso_builds_failed();
            }
            entry.resolve(built);
        }

        entry.touch(current_frame);
        local.insert_hashed(hash, Box::from(key), Arc::clone(&entry));
        entry
    }

    /// Incremental eviction pass. Each call examines a bounded run of
    /// entries starting where the previous call stopped, and drops built
    /// pipelines that have gone unused for [`UNUSED_AGE_THRESHOLD`] frames.
    /// Failed and unresolved entries are never dropped. Returns the number
    /// of evictions.
    pub fn sweep(&self, current_frame: u64, stats: &GpuStats) -> usize {
        let mut sweep = self.sweep.lock().unwrap();
        let mut map = self.map.write().unwrap();

        let mut resume_at = sweep.cursor.take();
        if let Some(cursor) = &resume_at {
            if !map.contains_key(cursor.as_ref()) {
                resume_at = None;
            }
        }

        let mut credit = SWEEP_CREDIT;
        let mut skipping = resume_at.is_some();
        let mut evict: Vec<Box<[u8]>> = Vec::new();
        let mut next_cursor = None;
        for (key, entry) in map.iter() {
            if skipping {
                if Some(key) != resume_at.as_ref() {
                    continue;
                }
                // This is the saved resume point; examine it.
                skipping = false;
            }
            if credit <= 0.0 {
                next_cursor = Some(key.clone());
                break;
            }
            credit -= 1.0;
            let age = current_frame.saturating_sub(entry.last_used_frame());
            if age > UNUSED_AGE_THRESHOLD && entry.pipeline().is_some() {
                evict.push(key.clone());
                credit += SWEEP_EVICTION_REFUND;
            }
        }

        for key in &evict {
            map.remove(key.as_ref());
        }
        sweep.cursor = next_cursor;
        if !evict.is_empty() {
            stats.add_pso_evictions(evict.len() as u64);
        }
        evict.len()
    }

    /// Drops every entry and resets the sweep cursor.
    pub fn clear_all(&self) -> usize {
        let mut sweep = self.sweep.lock().unwrap();
        let mut map = self.map.write().unwrap();
        sweep.cursor = None;
        let count = map.len();
        map.clear();
        count
    }

    pub fn entry_count(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

impl<D: PipelineDesc> Default for PipelineCache<D> {
    fn default() -> Self {
        Self::new()
    }
}
