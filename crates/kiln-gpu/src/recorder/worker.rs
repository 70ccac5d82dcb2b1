//! Worker recorders for concurrent batch recording.
//!
//! A worker records one shard of a batch into its own buffer and never
//! submits. Everything ordering-sensitive is routed elsewhere: resource
//! transitions park on the device for the main recorder, and frame-done
//! callbacks buffer locally until the post-join cleanup on the main thread.

use std::ops::Range;
use std::sync::Arc;

use crate::cmd::NativeCmd;
use crate::device::DeviceShared;
use crate::resource::GpuResource;
use crate::state::ResourceState;

use super::base::{BatchBindings, RecorderCore};
use super::{
    ComputeItem, DrawResultFlags, ExecuteItemFlags, FrameDoneCallback, GraphicsItem, ItemRecorder,
    RaytraceItem,
};

pub struct WorkerRecorder {
    core: RecorderCore,
    result: DrawResultFlags,
    items_recorded: u64,
}

impl WorkerRecorder {
    pub(crate) fn new(index: u32, shared: Arc<DeviceShared>) -> Self {
        debug_assert!(index >= 1, "worker indices start at 1");
        Self {
            core: RecorderCore::new(index, shared),
            result: DrawResultFlags::empty(),
            items_recorded: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.core.index
    }

    /// Opens this worker's buffer for one batch, inheriting the main
    /// recorder's committed span bindings.
    pub(crate) fn prepare_for_batch(&mut self, batch: &BatchBindings) {
        self.core.buf.reset();
        self.core.bound.invalidate();
        self.core.batch_epoch = batch.epoch;
        self.core.items_started = Some(batch.bindings.kind);
        self.core.committed = Some(batch.bindings);
        self.result = DrawResultFlags::empty();
        self.items_recorded = 0;
        self.core.rebind_committed();
    }

    /// Runs `callback` for every item index in this worker's shard.
    pub(crate) fn record_range<F>(&mut self, range: Range<usize>, callback: &F)
    where
        F: Fn(usize, &mut dyn ItemRecorder) -> DrawResultFlags,
    {
        for index in range {
            let flags = callback(index, self);
            self.result |= flags;
        }
    }

    /// Closes the batch buffer and hands its commands to the submitter.
    pub(crate) fn close_buffer(&mut self) -> Vec<NativeCmd> {
        self.core.buf.close();
        self.core.buf.take_commands()
    }

    /// Post-join cleanup, run on the main thread: publishes locally captured
    /// frame-done callbacks and drops per-batch state. Returns how many
    /// items this worker recorded.
    pub(crate) fn post_cleanup(&mut self) -> u64 {
        for callback in self.core.frame_done_local.drain(..) {
            self.core.shared.push_frame_done(callback);
        }
        self.core.items_started = None;
        self.core.committed = None;
        self.core.invalidate_volatile();
        std::mem::take(&mut self.items_recorded)
    }

    pub(crate) fn take_result(&mut self) -> DrawResultFlags {
        std::mem::take(&mut self.result)
    }

    pub(crate) fn end_frame(&mut self) {
        debug_assert!(
            self.core.frame_done_local.is_empty(),
            "worker frame-done callbacks left unflushed at end of frame"
        );
        self.core.reset_local_caches();
    }

    pub(crate) fn reset_local_caches(&mut self) {
        self.core.reset_local_caches();
    }
}

impl ItemRecorder for WorkerRecorder {
    fn execute_graphics_item_with(
        &mut self,
        item: &GraphicsItem,
        flags: ExecuteItemFlags,
    ) -> DrawResultFlags {
        let result = self.core.record_graphics(item, flags);
        self.result |= result;
        self.items_recorded += 1;
        result
    }

    fn execute_compute_item(&mut self, item: &ComputeItem) -> DrawResultFlags {
        let result = self.core.record_compute(item);
        self.result |= result;
        self.items_recorded += 1;
        result
    }

    fn execute_raytrace_item(&mut self, item: &RaytraceItem) -> DrawResultFlags {
        let result = self.core.record_raytrace(item);
        self.result |= result;
        self.items_recorded += 1;
        result
    }

    fn queue_resource_transition(&mut self, resource: &Arc<GpuResource>, target: ResourceState) {
        self.core.transition(resource, target);
    }

    fn execute_after_gpu_frame_done(&mut self, callback: FrameDoneCallback) {
        self.core.frame_done_local.push(callback);
    }
}
