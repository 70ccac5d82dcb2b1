//! Device: frame timeline, descriptor storage, pipeline caches, worker pool.
//!
//! The device owns everything recorders share and drives the frame loop:
//! `begin_frame` waits out the oldest in-flight frame and recycles its
//! storage, `end_frame` submits and signals the frame fence. In between, item
//! recording happens through the main recorder or a forked worker batch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use tracing::{debug, error};

use crate::descriptor::{DescriptorHeap, DescriptorHeapKind, TransientDescriptorRing};
use crate::error::GpuError;
use crate::native::NativeDevice;
use crate::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, PipelineCache, RaytracePipelineDesc,
};
use crate::recorder::{
    BeginFrameCallback, DrawResultFlags, FrameDoneCallback, GlobalBindings, ItemRecorder,
    MainRecorder, RenderOutputs, WorkerRecorder, MAX_ITEMS_PER_BEGIN_END, MIN_ITEMS_PER_WORKER,
    TRANSIENT_RANGE,
};
use crate::resource::{GpuResource, ResourceDesc, ResourceId};
use crate::shader::{Shader, ShaderRegistry};
use crate::state::ResourceState;
use crate::stats::GpuStats;

/// Number of frames that may be in flight on the GPU. Shared by the frame
/// fence ring, the transient descriptor barriers and deferred releases.
pub const FRAME_RING_SIZE: usize = 2;

pub const MAX_WORKERS: usize = 128;

/// Construction-time device configuration.
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    /// Worker recorders available for batched execution; 0 disables forking.
    pub worker_count: usize,
    /// Splice worker commands into the main buffer instead of submitting
    /// them as separate buffers of one group.
    pub workers_use_inline_buffers: bool,
    pub persistent_descriptor_count: u32,
    pub transient_descriptor_count: u32,
    pub sampler_descriptor_count: u32,
    pub rtv_descriptor_count: u32,
    pub dsv_descriptor_count: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            worker_count: 0,
            workers_use_inline_buffers: false,
            persistent_descriptor_count: 200_000,
            transient_descriptor_count: 500_000,
            sampler_descriptor_count: 128,
            rtv_descriptor_count: 4096,
            dsv_descriptor_count: 1024,
        }
    }
}

impl DeviceOptions {
    fn validate(&self) -> Result<(), GpuError> {
        if self.worker_count > MAX_WORKERS {
            return Err(GpuError::InvalidOptions(format!(
                "worker_count {} exceeds the maximum of {}",
                self.worker_count, MAX_WORKERS
            )));
        }
        // The stall loop can only terminate if a full sync frees enough ring
        // space for one range, which needs the ring to hold several.
        let transient_floor = 4 * TRANSIENT_RANGE;
        if self.transient_descriptor_count < transient_floor {
            return Err(GpuError::InvalidOptions(format!(
                "transient_descriptor_count {} is below the minimum of {}",
                self.transient_descriptor_count, transient_floor
            )));
        }
        Ok(())
    }
}

/// A worker's request to move `resource` into `target` before its buffer
/// runs, parked until the main recorder drains the queue at submit.
pub(crate) struct PendingTransition {
    pub(crate) resource: Arc<GpuResource>,
    pub(crate) target: ResourceState,
    pub(crate) worker_index: u32,
}

enum FrameDoneTask {
    User(FrameDoneCallback),
    ReleaseDescriptor(u32),
}

#[derive(Debug, Default)]
struct FrameTimeline {
    /// Index into the per-frame rings; advances once per `begin_frame`.
    flip: usize,
    /// Fence value signaled when the frame that last used each flip slot
    /// ended; 0 means the slot was never used.
    fence_values: [u64; FRAME_RING_SIZE],
    last_fence: u64,
}

/// State shared between the device, its recorders and live resources.
pub(crate) struct DeviceShared {
    pub(crate) native: NativeDevice,
    pub(crate) options: DeviceOptions,

    pub(crate) srv_heap: DescriptorHeap,
    pub(crate) sampler_heap: DescriptorHeap,
    pub(crate) rtv_heap: DescriptorHeap,
    pub(crate) dsv_heap: DescriptorHeap,
    transient: Mutex<TransientDescriptorRing>,

    pub(crate) graphics_pipelines: PipelineCache<GraphicsPipelineDesc>,
    pub(crate) compute_pipelines: PipelineCache<ComputePipelineDesc>,
    pub(crate) raytrace_pipelines: PipelineCache<RaytracePipelineDesc>,

    pub(crate) shaders: Arc<ShaderRegistry>,
    pub(crate) stats: GpuStats,

    timeline: Mutex<FrameTimeline>,
    current_frame: AtomicU64,
    batch_epoch: AtomicU64,
    workers_active: AtomicU32,
    next_resource_id: AtomicU64,
    removed: AtomicBool,

    deferred: Mutex<HashMap<ResourceId, PendingTransition>>,
    begin_frame_callbacks: Mutex<Vec<BeginFrameCallback>>,
    frame_done: Mutex<[Vec<FrameDoneTask>; FRAME_RING_SIZE]>,
}

impl DeviceShared {
    fn new(options: DeviceOptions) -> Self {
        let srv_capacity = options.transient_descriptor_count + options.persistent_descriptor_count;
        Self {
            native: NativeDevice::new(),
            srv_heap: DescriptorHeap::new(
                DescriptorHeapKind::CbvSrvUav,
                srv_capacity,
                options.transient_descriptor_count,
            ),
            sampler_heap: DescriptorHeap::new(
                DescriptorHeapKind::Sampler,
                options.sampler_descriptor_count,
                0,
            ),
            rtv_heap: DescriptorHeap::new(DescriptorHeapKind::Rtv, options.rtv_descriptor_count, 0),
            dsv_heap: DescriptorHeap::new(DescriptorHeapKind::Dsv, options.dsv_descriptor_count, 0),
            transient: Mutex::new(TransientDescriptorRing::new(
                options.transient_descriptor_count,
            )),
            graphics_pipelines: PipelineCache::new(),
            compute_pipelines: PipelineCache::new(),
            raytrace_pipelines: PipelineCache::new(),
            shaders: Arc::new(ShaderRegistry::new()),
            stats: GpuStats::new(),
            timeline: Mutex::new(FrameTimeline::default()),
            current_frame: AtomicU64::new(0),
            batch_epoch: AtomicU64::new(0),
            workers_active: AtomicU32::new(0),
            next_resource_id: AtomicU64::new(1),
            removed: AtomicBool::new(false),
            deferred: Mutex::new(HashMap::new()),
            begin_frame_callbacks: Mutex::new(Vec::new()),
            frame_done: Mutex::new(std::array::from_fn(|_| Vec::new())),
            options,
        }
    }

    /// Fails once the native device reports removal; the failure latches.
    pub(crate) fn health(&self) -> Result<(), GpuError> {
        if self.removed.load(Ordering::Acquire) {
            return Err(GpuError::DeviceRemoved);
        }
        if self.native.is_removed() {
            self.removed.store(true, Ordering::Release);
            return Err(GpuError::DeviceRemoved);
        }
        Ok(())
    }

    /// Monotonic frame counter, advanced by `begin_frame`.
    pub(crate) fn frame_index(&self) -> u64 {
        self.current_frame.load(Ordering::Relaxed)
    }

    /// A fresh batch-claim epoch for resource state trackers.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.batch_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn allocate_transient_range(&self) -> Option<u32> {
        self.transient.lock().unwrap().allocate(TRANSIENT_RANGE)
    }

    pub(crate) fn transient_capacity(&self) -> u32 {
        self.transient.lock().unwrap().capacity()
    }

    /// Retires one more in-flight frame's ring barrier mid-frame, returning
    /// the new sync age.
    pub(crate) fn transient_sync_age_increment(&self) -> usize {
        let mut ring = self.transient.lock().unwrap();
        ring.sync_age_increment();
        ring.sync_age()
    }

    /// Blocks until the frame `frames_back` frames ago has retired on the
    /// GPU. 0 waits for everything submitted so far and retires every ring
    /// barrier.
    pub(crate) fn sync_gpu_frame(&self, frames_back: usize) {
        if frames_back == 0 {
            self.fence_signal_and_wait();
            self.retire_all_transient_frames();
            return;
        }
        debug_assert!(frames_back <= FRAME_RING_SIZE);
        let value = {
            let timeline = self.timeline.lock().unwrap();
            timeline.fence_values[(timeline.flip + FRAME_RING_SIZE - frames_back) % FRAME_RING_SIZE]
        };
        if self.native.completed_value() < value {
            self.native.wait(value);
            self.stats.inc_sync_waits();
        }
    }

    fn fence_signal_and_wait(&self) {
        let value = {
            let mut timeline = self.timeline.lock().unwrap();
            timeline.last_fence += 1;
            timeline.last_fence
        };
        self.native.signal(value);
        self.native.wait(value);
        self.stats.inc_sync_waits();
    }

    fn retire_all_transient_frames(&self) {
        let mut ring = self.transient.lock().unwrap();
        for _ in 0..FRAME_RING_SIZE {
            ring.next_frame();
        }
    }

    /// Parks a worker-requested transition. Requests for the same resource
    /// coalesce when the targets agree; disagreeing targets are a recording
    /// bug on the callers' side.
    pub(crate) fn defer_transition(
        &self,
        resource: &Arc<GpuResource>,
        target: ResourceState,
        worker_index: u32,
    ) {
        debug_assert!(
            self.workers_active.load(Ordering::Relaxed) > 0,
            "deferred transition outside a worker batch"
        );
        let mut pending = self.deferred.lock().unwrap();
        match pending.entry(resource.id()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.target == target {
                    self.stats.inc_deferred_coalesced();
                } else {
                    error!(
                        resource = resource.id().0,
                        requested = ?target,
                        pending = ?existing.target,
                        workers = ?(existing.worker_index, worker_index),
                        "conflicting deferred transitions for one resource"
                    );
                    debug_assert!(false, "conflicting deferred transition targets");
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingTransition {
                    resource: Arc::clone(resource),
                    target,
                    worker_index,
                });
                self.stats.inc_deferred_transitions();
            }
        }
    }

    pub(crate) fn take_deferred_transitions(&self) -> Vec<PendingTransition> {
        let mut pending = self.deferred.lock().unwrap();
        pending.drain().map(|(_, transition)| transition).collect()
    }

    /// Queues `callback` for when the current frame's fence retires.
    pub(crate) fn push_frame_done(&self, callback: FrameDoneCallback) {
        self.push_frame_done_task(FrameDoneTask::User(callback));
    }

    /// Frees a shader-visible descriptor once the GPU can no longer read it.
    pub(crate) fn defer_descriptor_release(&self, index: u32) {
        self.push_frame_done_task(FrameDoneTask::ReleaseDescriptor(index));
    }

    fn push_frame_done_task(&self, task: FrameDoneTask) {
        let flip = self.timeline.lock().unwrap().flip;
        self.frame_done.lock().unwrap()[flip].push(task);
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        // Resources dropped after the device leave their view releases
        // queued here; apply them so the heap accounting closes out.
        let mut slots = self.frame_done.lock().unwrap();
        for slot in slots.iter_mut() {
            for task in slot.drain(..) {
                if let FrameDoneTask::ReleaseDescriptor(index) = task {
                    self.srv_heap.release(index);
                }
            }
        }
    }
}

impl fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("frame", &self.frame_index())
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct Device {
    shared: Arc<DeviceShared>,
    main: MainRecorder,
    workers: Vec<WorkerRecorder>,
    sweep_order: u32,
    frame_started: bool,
}

impl Device {
    pub fn new(options: DeviceOptions) -> Result<Self, GpuError> {
        options.validate()?;
        let worker_count = options.worker_count;
        let shared = Arc::new(DeviceShared::new(options));
        let main = MainRecorder::new(Arc::clone(&shared));
        let workers = (0..worker_count)
            .map(|i| WorkerRecorder::new(i as u32 + 1, Arc::clone(&shared)))
            .collect();
        Ok(Self {
            shared,
            main,
            workers,
            sweep_order: 0,
            frame_started: false,
        })
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.shared.options
    }

    pub fn stats(&self) -> &GpuStats {
        &self.shared.stats
    }

    pub fn native(&self) -> &NativeDevice {
        &self.shared.native
    }

    pub fn heap(&self, kind: DescriptorHeapKind) -> &DescriptorHeap {
        match kind {
            DescriptorHeapKind::CbvSrvUav => &self.shared.srv_heap,
            DescriptorHeapKind::Sampler => &self.shared.sampler_heap,
            DescriptorHeapKind::Rtv => &self.shared.rtv_heap,
            DescriptorHeapKind::Dsv => &self.shared.dsv_heap,
        }
    }

    pub fn shaders(&self) -> &Arc<ShaderRegistry> {
        &self.shared.shaders
    }

    pub fn create_shader(&self) -> Arc<Shader> {
        Arc::new(Shader::new(Arc::clone(&self.shared.shaders)))
    }

    pub fn is_removed(&self) -> bool {
        self.shared.health().is_err()
    }

    pub fn is_frame_started(&self) -> bool {
        self.frame_started
    }

    pub fn current_frame_index(&self) -> u64 {
        self.shared.frame_index()
    }

    pub fn main(&mut self) -> &mut MainRecorder {
        &mut self.main
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Creates a resource and its descriptor views per `desc`.
    pub fn create_resource(&self, desc: ResourceDesc) -> Result<Arc<GpuResource>, GpuError> {
        self.shared.health()?;
        let srv_slot = if desc.shader_visible {
            match self.shared.srv_heap.allocate() {
                Some(slot) => Some(slot),
                None => return Err(heap_exhausted(&self.shared.srv_heap)),
            }
        } else {
            None
        };
        let rtv_slot = if desc.render_target {
            match self.shared.rtv_heap.allocate() {
                Some(slot) => Some(slot),
                None => {
                    if let Some(slot) = srv_slot {
                        self.shared.srv_heap.release(slot.index);
                    }
                    return Err(heap_exhausted(&self.shared.rtv_heap));
                }
            }
        } else {
            None
        };
        let dsv_slot = if desc.depth_stencil {
            match self.shared.dsv_heap.allocate() {
                Some(slot) => Some(slot),
                None => {
                    if let Some(slot) = rtv_slot {
                        self.shared.rtv_heap.release(slot.index);
                    }
                    if let Some(slot) = srv_slot {
                        self.shared.srv_heap.release(slot.index);
                    }
                    return Err(heap_exhausted(&self.shared.dsv_heap));
                }
            }
        } else {
            None
        };

        let id = ResourceId(self.shared.next_resource_id.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(GpuResource::new(
            id,
            desc,
            srv_slot,
            rtv_slot,
            dsv_slot,
            Arc::clone(&self.shared),
        )))
    }

    /// Opens the next frame: waits for the frame that last used this flip
    /// slot, recycles its transient storage, runs its retirement callbacks,
    /// sweeps one pipeline cache and reopens the main recorder.
    pub fn begin_frame(&mut self) -> Result<(), GpuError> {
        self.shared.health()?;
        debug_assert!(!self.frame_started, "begin_frame inside an open frame");
        self.frame_started = true;

        {
            let mut timeline = self.shared.timeline.lock().unwrap();
            timeline.flip = (timeline.flip + 1) % FRAME_RING_SIZE;
        }
        self.shared.sync_gpu_frame(FRAME_RING_SIZE);
        self.shared.transient.lock().unwrap().next_frame();
        self.drain_frame_done_tasks(1);

        let frame = self.shared.current_frame.fetch_add(1, Ordering::Relaxed) + 1;
        self.sweep_pipeline_caches();
        debug!(frame, "frame started");

        let epoch = self.shared.next_epoch();
        self.main.reset_for_frame(epoch);
        self.drain_begin_frame_callbacks()?;
        self.shared.stats.inc_frames();
        Ok(())
    }

    /// Closes the frame: submits the main buffer and signals the frame
    /// fence for this flip slot.
    pub fn end_frame(&mut self) -> Result<(), GpuError> {
        debug_assert!(self.frame_started, "end_frame without begin_frame");
        self.frame_started = false;

        for worker in &mut self.workers {
            worker.end_frame();
        }
        self.main.finish_frame()?;

        let value = {
            let mut timeline = self.shared.timeline.lock().unwrap();
            timeline.last_fence += 1;
            let flip = timeline.flip;
            timeline.fence_values[flip] = timeline.last_fence;
            timeline.last_fence
        };
        self.shared.native.signal(value);
        self.shared.health()
    }

    /// Waits for every submission to retire. With `execute_callbacks`, also
    /// drains all pending frame-done callbacks.
    pub fn sync_gpu(&mut self, execute_callbacks: bool) {
        self.shared.fence_signal_and_wait();
        if execute_callbacks {
            self.drain_frame_done_tasks(FRAME_RING_SIZE);
        }
        self.shared.retire_all_transient_frames();
    }

    /// Waits only for the frame `frames_back` frames ago (0 is a full sync).
    pub fn sync_gpu_frame(&mut self, frames_back: usize) {
        self.shared.sync_gpu_frame(frames_back);
    }

    /// Queues work that needs an open main recorder; runs at the start of
    /// the next frame, after which the recorder is flushed.
    pub fn execute_at_begin_frame(
        &self,
        callback: impl FnOnce(&mut MainRecorder) + Send + 'static,
    ) {
        self.shared
            .begin_frame_callbacks
            .lock()
            .unwrap()
            .push(Box::new(callback));
    }

    /// Queues work for when the current frame's fence retires on the GPU.
    pub fn execute_after_gpu_frame_done(&self, callback: impl FnOnce(&Device) + Send + 'static) {
        self.shared.push_frame_done(Box::new(callback));
    }

    /// Tears down and recreates the worker pool behind a full GPU sync.
    pub fn set_workers(&mut self, worker_count: usize) -> Result<(), GpuError> {
        debug_assert!(
            !self.frame_started,
            "cannot reconfigure workers inside a frame"
        );
        if worker_count > MAX_WORKERS {
            return Err(GpuError::InvalidOptions(format!(
                "worker_count {} exceeds the maximum of {}",
                worker_count, MAX_WORKERS
            )));
        }
        self.sync_gpu(true);
        self.workers.clear();
        for i in 0..worker_count {
            self.workers
                .push(WorkerRecorder::new(i as u32 + 1, Arc::clone(&self.shared)));
        }
        debug!(worker_count, "worker pool reconfigured");
        Ok(())
    }

    /// Empties all three pipeline caches and every recorder's lookaside.
    /// Returns the number of entries dropped.
    pub fn clear_pipeline_caches(&mut self) -> usize {
        let cleared = self.shared.graphics_pipelines.clear_all()
            + self.shared.compute_pipelines.clear_all()
            + self.shared.raytrace_pipelines.clear_all();
        self.main.reset_local_caches();
        for worker in &mut self.workers {
            worker.reset_local_caches();
        }
        cleared
    }

    /// Records `item_count` graphics items through `callback`, forking
    /// across the worker pool when the batch is large enough to pay for it.
    /// The callback must be safe to call from multiple threads at once;
    /// item index order is preserved within each worker's shard.
    pub fn execute_graphics_batch<F>(
        &mut self,
        item_count: usize,
        outputs: &RenderOutputs,
        globals: &GlobalBindings,
        callback: F,
    ) -> Result<DrawResultFlags, GpuError>
    where
        F: Fn(usize, &mut dyn ItemRecorder) -> DrawResultFlags + Sync,
    {
        if item_count == 0 {
            return Ok(DrawResultFlags::empty());
        }
        let by_items = (item_count + MIN_ITEMS_PER_WORKER - 1) / MIN_ITEMS_PER_WORKER;
        let workers_active = self.workers.len().min(by_items);
        if workers_active <= 1 {
            return self.execute_batch_single(item_count, outputs, globals, &callback);
        }

        self.shared
            .workers_active
            .store(workers_active as u32, Ordering::Release);
        let result =
            self.execute_batch_wide(item_count, outputs, globals, &callback, workers_active);
        self.shared.workers_active.store(0, Ordering::Release);
        result
    }

    fn execute_batch_single<F>(
        &mut self,
        item_count: usize,
        outputs: &RenderOutputs,
        globals: &GlobalBindings,
        callback: &F,
    ) -> Result<DrawResultFlags, GpuError>
    where
        F: Fn(usize, &mut dyn ItemRecorder) -> DrawResultFlags,
    {
        let mut result = DrawResultFlags::empty();
        let batch_count = (item_count + MAX_ITEMS_PER_BEGIN_END - 1) / MAX_ITEMS_PER_BEGIN_END;
        for batch in 0..batch_count {
            let from = batch * MAX_ITEMS_PER_BEGIN_END;
            let count = (item_count - from).min(MAX_ITEMS_PER_BEGIN_END);
            self.main.begin_graphics_items(outputs, globals)?;
            for index in from..from + count {
                result |= callback(index, &mut self.main);
            }
            self.main.end_items();
        }
        Ok(result)
    }

    fn execute_batch_wide<F>(
        &mut self,
        item_count: usize,
        outputs: &RenderOutputs,
        globals: &GlobalBindings,
        callback: &F,
        workers_active: usize,
    ) -> Result<DrawResultFlags, GpuError>
    where
        F: Fn(usize, &mut dyn ItemRecorder) -> DrawResultFlags + Sync,
    {
        let mut result = DrawResultFlags::empty();
        let batch_count = (item_count + MAX_ITEMS_PER_BEGIN_END - 1) / MAX_ITEMS_PER_BEGIN_END;
        let items_per_batch = (item_count + batch_count - 1) / batch_count;
        for batch in 0..batch_count {
            let from = batch * items_per_batch;
            let count = (item_count - from).min(items_per_batch);

            self.main.begin_graphics_items(outputs, globals)?;
            let snapshot = match self.main.batch_snapshot() {
                Some(snapshot) => snapshot,
                None => break,
            };

            let per_worker = (count + workers_active - 1) / workers_active;
            let active = &mut self.workers[..workers_active];
            for worker in active.iter_mut() {
                worker.prepare_for_batch(&snapshot);
            }

            // Fork: every worker but the last runs on its own thread; this
            // thread takes the last shard itself, then the scope joins.
            std::thread::scope(|scope| {
                let (spawned, local) = active.split_at_mut(workers_active - 1);
                for (slot, worker) in spawned.iter_mut().enumerate() {
                    let first = from + (slot * per_worker).min(count);
                    let last = from + ((slot + 1) * per_worker).min(count);
                    scope.spawn(move || worker.record_range(first..last, callback));
                }
                let slot = workers_active - 1;
                let first = from + (slot * per_worker).min(count);
                let last = from + ((slot + 1) * per_worker).min(count);
                local[0].record_range(first..last, callback);
            });

            // Transitions the workers parked must precede their buffers, so
            // they go into the main buffer before it closes.
            self.main.apply_deferred_transitions();

            let mut worker_buffers = Vec::with_capacity(workers_active);
            for worker in &mut self.workers[..workers_active] {
                worker_buffers.push(worker.close_buffer());
                result |= worker.take_result();
            }
            self.main.submit_group(worker_buffers)?;

            let mut recorded = 0;
            for worker in &mut self.workers[..workers_active] {
                recorded += worker.post_cleanup();
            }
            self.main.absorb_worker_items(recorded);
            self.main.end_items();
        }
        Ok(result)
    }

    fn sweep_pipeline_caches(&mut self) {
        let frame = self.shared.frame_index();
        let evicted = match self.sweep_order {
            0 => self.shared.graphics_pipelines.sweep(frame, &self.shared.stats),
            1 => self.shared.compute_pipelines.sweep(frame, &self.shared.stats),
            _ => self.shared.raytrace_pipelines.sweep(frame, &self.shared.stats),
        };
        self.sweep_order = (self.sweep_order + 1) % 3;
        if evicted > 0 {
            debug!(evicted, "dropped unused pipelines");
        }
    }

    /// Drains frame-done tasks for `slot_count` flip slots, oldest first.
    /// Runs newest-queued first within a slot, with the queue unlocked
    /// around each callback so callbacks may queue more work.
    fn drain_frame_done_tasks(&self, slot_count: usize) {
        let flip = self.shared.timeline.lock().unwrap().flip;
        for i in 0..slot_count {
            let slot = (flip + i) % FRAME_RING_SIZE;
            loop {
                let task = {
                    let mut slots = self.shared.frame_done.lock().unwrap();
                    slots[slot].pop()
                };
                match task {
                    Some(FrameDoneTask::User(callback)) => callback(self),
                    Some(FrameDoneTask::ReleaseDescriptor(index)) => {
                        self.shared.srv_heap.release(index)
                    }
                    None => break,
                }
            }
        }
    }

    fn drain_begin_frame_callbacks(&mut self) -> Result<(), GpuError> {
        let mut ran_any = false;
        loop {
            let callback = {
                let mut callbacks = self.shared.begin_frame_callbacks.lock().unwrap();
                callbacks.pop()
            };
            match callback {
                Some(callback) => {
                    callback(&mut self.main);
                    ran_any = true;
                }
                None => break,
            }
        }
        if ran_any {
            self.main.flush()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if std::thread::panicking() || self.shared.health().is_err() {
            return;
        }
        self.sync_gpu(true);
    }
}

fn heap_exhausted(heap: &DescriptorHeap) -> GpuError {
    GpuError::DescriptorHeapExhausted {
        kind: heap.kind(),
        capacity: heap.capacity(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cmd::NativeCmd;
    use crate::native::QueueEvent;
    use crate::recorder::{GraphicsDraw, GraphicsItem};
    use crate::resource::Format;

    fn test_options() -> DeviceOptions {
        DeviceOptions {
            worker_count: 0,
            persistent_descriptor_count: 64,
            transient_descriptor_count: 4 * TRANSIENT_RANGE,
            sampler_descriptor_count: 8,
            rtv_descriptor_count: 8,
            dsv_descriptor_count: 8,
            ..DeviceOptions::default()
        }
    }

    #[test]
    fn options_validation_rejects_invalid_setups() {
        let too_many_workers = DeviceOptions {
            worker_count: MAX_WORKERS + 1,
            ..DeviceOptions::default()
        };
        assert!(matches!(
            Device::new(too_many_workers),
            Err(GpuError::InvalidOptions(_))
        ));

        let tiny_ring = DeviceOptions {
            transient_descriptor_count: TRANSIENT_RANGE,
            ..DeviceOptions::default()
        };
        assert!(matches!(
            Device::new(tiny_ring),
            Err(GpuError::InvalidOptions(_))
        ));
    }

    #[test]
    fn frame_timeline_waits_for_flip_slot_reuse() {
        let mut device = Device::new(test_options()).unwrap();
        for _ in 0..3 {
            device.begin_frame().unwrap();
            device.end_frame().unwrap();
        }
        assert_eq!(device.stats().snapshot().frames, 3);
        // Two frames fit in flight; only the third has to wait, and it waits
        // on the first frame's fence.
        assert_eq!(device.stats().snapshot().sync_waits, 1);

        let events = device.native().events();
        let signals: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::Signal { value } => Some(*value),
                _ => None,
            })
            .collect();
        let waits: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::Wait { value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![1, 2, 3]);
        assert_eq!(waits, vec![1]);
    }

    #[test]
    fn frame_done_callbacks_run_when_their_frame_retires() {
        let mut device = Device::new(test_options()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        device.begin_frame().unwrap();
        let counter = Arc::clone(&runs);
        device.execute_after_gpu_frame_done(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        device.end_frame().unwrap();

        // One frame later the fence has not necessarily retired.
        device.begin_frame().unwrap();
        device.end_frame().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Ring-size frames later the flip slot is reclaimed and the callback
        // must have run.
        device.begin_frame().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        device.end_frame().unwrap();

        // A full sync drains without waiting for the ring to come around.
        device.begin_frame().unwrap();
        let counter = Arc::clone(&runs);
        device.execute_after_gpu_frame_done(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        device.end_frame().unwrap();
        device.sync_gpu(true);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn begin_frame_callbacks_run_newest_first_then_flush() {
        let mut device = Device::new(test_options()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&order);
        device.execute_at_begin_frame(move |_| log.lock().unwrap().push("first"));
        let log = Arc::clone(&order);
        device.execute_at_begin_frame(move |_| log.lock().unwrap().push("second"));

        let flushes_before = device.stats().snapshot().flushes;
        device.begin_frame().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(device.stats().snapshot().flushes, flushes_before + 1);
        device.end_frame().unwrap();

        // Drained; the next frame does not rerun them.
        device.begin_frame().unwrap();
        assert_eq!(order.lock().unwrap().len(), 2);
        device.end_frame().unwrap();
    }

    #[test]
    fn transient_exhaustion_stalls_and_recovers() {
        // Ring of exactly four ranges: the fourth span in one frame cannot
        // fit without wrapping over unretired barriers.
        let mut device = Device::new(test_options()).unwrap();
        let globals = GlobalBindings::default();

        device.begin_frame().unwrap();
        for _ in 0..4 {
            device.main().begin_compute_items(&globals).unwrap();
            device.main().end_items();
        }
        device.end_frame().unwrap();

        let snap = device.stats().snapshot();
        assert_eq!(snap.transient_stalls, 1);
        assert!(snap.sync_waits >= 1);
    }

    #[test]
    fn small_batches_fall_back_to_the_main_recorder() {
        let mut device = Device::new(test_options()).unwrap();
        let shader = Shader::cooked(Arc::clone(device.shaders()), b"vs");
        let items: Vec<GraphicsItem> = (0..10)
            .map(|_| GraphicsItem::new(Arc::clone(&shader), GraphicsDraw::Draw { vertex_count: 3 }))
            .collect();

        device.begin_frame().unwrap();
        let result = device
            .execute_graphics_batch(
                items.len(),
                &RenderOutputs::default(),
                &GlobalBindings::default(),
                |index, recorder| recorder.execute_graphics_item(&items[index]),
            )
            .unwrap();
        device.end_frame().unwrap();

        assert_eq!(result, DrawResultFlags::empty());
        assert_eq!(device.stats().snapshot().graphics_items, 10);

        let draws: usize = device
            .native()
            .events()
            .iter()
            .filter_map(|e| match e {
                QueueEvent::Submit { buffers, .. } => Some(
                    buffers
                        .iter()
                        .flatten()
                        .filter(|c| matches!(c, NativeCmd::Draw { .. }))
                        .count(),
                ),
                _ => None,
            })
            .sum();
        assert_eq!(draws, 10);
    }

    #[test]
    fn resource_views_release_through_the_frame_queue() {
        let mut device = Device::new(test_options()).unwrap();
        let texture = device
            .create_resource(ResourceDesc::texture(Format::R8G8B8A8Unorm, 1).with_render_target())
            .unwrap();
        assert!(texture.srv_slot().is_some());
        assert!(texture.rtv_slot().is_some());
        assert_eq!(device.heap(DescriptorHeapKind::CbvSrvUav).live(), 1);
        assert_eq!(device.heap(DescriptorHeapKind::Rtv).live(), 1);

        drop(texture);
        // The CPU-only view frees immediately; the shader-visible view waits
        // for frame retirement.
        assert_eq!(device.heap(DescriptorHeapKind::Rtv).live(), 0);
        assert_eq!(device.heap(DescriptorHeapKind::CbvSrvUav).live(), 1);

        device.sync_gpu(true);
        assert_eq!(device.heap(DescriptorHeapKind::CbvSrvUav).live(), 0);
    }

    #[test]
    fn removal_latches_and_fails_operations_fast() {
        let mut device = Device::new(test_options()).unwrap();
        device.begin_frame().unwrap();
        device.native().simulate_removal();

        assert!(matches!(device.end_frame(), Err(GpuError::DeviceRemoved)));
        assert!(matches!(device.begin_frame(), Err(GpuError::DeviceRemoved)));
        assert!(matches!(
            device.create_resource(ResourceDesc::buffer(16)),
            Err(GpuError::DeviceRemoved)
        ));
        assert!(device.is_removed());
    }
}
