//! Main-thread recorder.
//!
//! The main recorder owns what workers may not touch: span begin/end, the
//! transient descriptor window, immediate resource transitions, and the
//! submission path. It is also an [`ItemRecorder`], so single-threaded item
//! recording goes through the same code path a batch worker uses.

use std::sync::Arc;

use tracing::{error, warn};

use crate::cmd::NativeCmd;
use crate::descriptor::DescriptorHeapKind;
use crate::device::{DeviceShared, FRAME_RING_SIZE};
use crate::error::GpuError;
use crate::native::PipelineKind;
use crate::resource::GpuResource;
use crate::state::ResourceState;

use super::base::{BatchBindings, CommittedBindings, RecorderCore};
use super::{
    ComputeItem, DrawResultFlags, ExecuteItemFlags, FrameDoneCallback, GlobalBindings,
    GraphicsItem, ItemRecorder, RaytraceItem, RenderOutputs, GLOBAL_CBV_SLOTS, GLOBAL_SRV_SLOTS,
    GLOBAL_UAV_SLOTS, MAX_ITEMS_PER_BEGIN_END, MAX_RENDER_TARGETS,
};

pub struct MainRecorder {
    core: RecorderCore,
}

impl MainRecorder {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self {
            core: RecorderCore::new(0, shared),
        }
    }

    pub(crate) fn reset_for_frame(&mut self, epoch: u64) {
        self.core.reset_for_frame(epoch);
    }

    fn check_health(&self) -> Result<(), GpuError> {
        self.core.shared.health()
    }

    /// Opens a span of graphics items drawn into `outputs`, with `globals`
    /// visible to every item. Transitions the outputs and globals into their
    /// span states and reserves this span's transient descriptor window.
    pub fn begin_graphics_items(
        &mut self,
        outputs: &RenderOutputs,
        globals: &GlobalBindings,
    ) -> Result<(), GpuError> {
        self.check_health()?;
        debug_assert!(
            self.core.items_started.is_none(),
            "begin_items while a span is open"
        );
        debug_assert!(outputs.render_targets.len() <= MAX_RENDER_TARGETS);
        debug_assert!(outputs.sample_count >= 1);
        self.assert_global_limits(globals);
        self.core.batch_epoch = self.core.shared.next_epoch();

        let mut rt_formats = [0i32; 8];
        for (slot, target) in outputs.render_targets.iter().enumerate() {
            rt_formats[slot] = target.desc().format.as_i32();
            self.core.transition(target, ResourceState::RENDER_TARGET);
        }
        let mut dsv_format = 0;
        if let Some(depth) = &outputs.depth_stencil {
            dsv_format = depth.desc().format.as_i32();
            self.core.transition(depth, ResourceState::DEPTH_WRITE);
        }
        self.transition_globals(globals);

        let transient_base = self.allocate_transient()?;
        self.core.committed = Some(CommittedBindings {
            kind: PipelineKind::Graphics,
            rt_count: outputs.render_targets.len() as u32,
            rt_formats,
            dsv_format,
            has_depth: outputs.depth_stencil.is_some(),
            sample_count: outputs.sample_count,
            transient_base,
        });
        self.core.items_started = Some(PipelineKind::Graphics);
        self.core.rebind_committed();
        Ok(())
    }

    pub fn begin_compute_items(&mut self, globals: &GlobalBindings) -> Result<(), GpuError> {
        self.begin_pass_items(PipelineKind::Compute, globals)
    }

    pub fn begin_raytrace_items(&mut self, globals: &GlobalBindings) -> Result<(), GpuError> {
        self.begin_pass_items(PipelineKind::Raytrace, globals)
    }

    fn begin_pass_items(
        &mut self,
        kind: PipelineKind,
        globals: &GlobalBindings,
    ) -> Result<(), GpuError> {
        self.check_health()?;
        debug_assert!(
            self.core.items_started.is_none(),
            "begin_items while a span is open"
        );
        self.assert_global_limits(globals);
        self.core.batch_epoch = self.core.shared.next_epoch();
        self.transition_globals(globals);

        let transient_base = self.allocate_transient()?;
        self.core.committed = Some(CommittedBindings {
            kind,
            rt_count: 0,
            rt_formats: [0; 8],
            dsv_format: 0,
            has_depth: false,
            sample_count: 1,
            transient_base,
        });
        self.core.items_started = Some(kind);
        self.core.rebind_committed();
        Ok(())
    }

    /// Closes the open span. Bound native state survives into the next span
    /// on this buffer; resolved scratch shaders do not.
    pub fn end_items(&mut self) {
        debug_assert!(
            self.core.items_started.is_some(),
            "end_items without begin_items"
        );
        self.core.items_started = None;
        self.core.committed = None;
        self.core.scratch_graphics.invalidate_shaders();
        self.core.scratch_compute.invalidate_shaders();
        self.core.scratch_raytrace.invalidate_shaders();
    }

    /// Submits everything recorded so far and recycles the buffer. An open
    /// span stays open: its bindings are re-established on the fresh buffer.
    pub fn flush(&mut self) -> Result<(), GpuError> {
        self.submit_group(Vec::new())
    }

    /// Immediate resource transition, recorded into the main buffer.
    pub fn transition_resource(
        &mut self,
        resource: &Arc<GpuResource>,
        target: ResourceState,
        subresource: u32,
    ) {
        self.core.transition_subresource(resource, target, subresource);
    }

    pub fn execute_single_graphics_item(
        &mut self,
        item: &GraphicsItem,
        outputs: &RenderOutputs,
        globals: &GlobalBindings,
    ) -> Result<DrawResultFlags, GpuError> {
        self.begin_graphics_items(outputs, globals)?;
        let result = self.execute_graphics_item(item);
        self.end_items();
        Ok(result)
    }

    pub fn execute_single_compute_item(
        &mut self,
        item: &ComputeItem,
        globals: &GlobalBindings,
    ) -> Result<DrawResultFlags, GpuError> {
        self.begin_compute_items(globals)?;
        let result = self.execute_compute_item(item);
        self.end_items();
        Ok(result)
    }

    pub fn execute_single_raytrace_item(
        &mut self,
        item: &RaytraceItem,
        globals: &GlobalBindings,
    ) -> Result<DrawResultFlags, GpuError> {
        self.begin_raytrace_items(globals)?;
        let result = self.execute_raytrace_item(item);
        self.end_items();
        Ok(result)
    }

    /// Submits the main buffer plus closed worker buffers as one native
    /// submission, main first. With inline buffers enabled the worker
    /// commands splice into the main buffer instead.
    pub(crate) fn submit_group(
        &mut self,
        worker_buffers: Vec<Vec<NativeCmd>>,
    ) -> Result<(), GpuError> {
        self.check_health()?;
        if self.core.shared.options.workers_use_inline_buffers {
            for cmds in worker_buffers {
                self.core.buf.append(cmds);
            }
            self.core.buf.close();
            let cmds = self.core.buf.take_commands();
            if !cmds.is_empty() {
                self.core.shared.native.submit(vec![cmds]);
                self.core.shared.stats.inc_submissions();
            }
        } else {
            self.core.buf.close();
            let main_cmds = self.core.buf.take_commands();
            let mut group = Vec::with_capacity(1 + worker_buffers.len());
            if !main_cmds.is_empty() {
                group.push(main_cmds);
            }
            for cmds in worker_buffers {
                if !cmds.is_empty() {
                    group.push(cmds);
                }
            }
            if !group.is_empty() {
                self.core.shared.native.submit(group);
                self.core.shared.stats.inc_submissions();
            }
        }
        self.core.shared.stats.inc_flushes();
        self.core.items_since_flush = 0;
        self.core.buf.reset();
        self.core.invalidate_volatile();

        // The span's descriptors were staged at begin_items and their window
        // stays reserved until the frame retires, so the fresh buffer rebinds
        // the same transient base.
        if self.core.committed.is_some() {
            self.core.rebind_committed();
        }
        Ok(())
    }

    /// Submits whatever the frame still holds. The buffer stays closed until
    /// the next frame reset.
    pub(crate) fn finish_frame(&mut self) -> Result<(), GpuError> {
        debug_assert!(
            self.core.items_started.is_none(),
            "end_frame inside an item span"
        );
        self.check_health()?;
        self.core.buf.close();
        let cmds = self.core.buf.take_commands();
        if !cmds.is_empty() {
            self.core.shared.native.submit(vec![cmds]);
            self.core.shared.stats.inc_submissions();
        }
        self.core.invalidate_volatile();
        self.core.reset_local_caches();
        Ok(())
    }

    /// Folds worker item counts into this recorder's flush counter after a
    /// batch submit zeroed it.
    pub(crate) fn absorb_worker_items(&mut self, items: u64) {
        self.core.items_since_flush += items as usize;
    }

    pub(crate) fn reset_local_caches(&mut self) {
        self.core.reset_local_caches();
    }

    pub(crate) fn batch_snapshot(&self) -> Option<BatchBindings> {
        self.core.committed.map(|bindings| BatchBindings {
            bindings,
            epoch: self.core.batch_epoch,
        })
    }

    /// Emits every transition workers parked during the batch. Runs after
    /// the join, so the barriers land in the main buffer ahead of every
    /// worker buffer in the submission group.
    pub(crate) fn apply_deferred_transitions(&mut self) {
        let pending = self.core.shared.take_deferred_transitions();
        for transition in pending {
            let emitted = transition.resource.transition_into(
                0,
                self.core.batch_epoch,
                transition.target,
                crate::resource::ALL_SUBRESOURCES,
                &mut self.core.buf,
            );
            if emitted > 0 {
                self.core.shared.stats.add_barriers(emitted as u64);
            }
        }
    }

    fn transition_globals(&mut self, globals: &GlobalBindings) {
        for view in &globals.shader_resources {
            self.core.transition(view, ResourceState::SHADER_RESOURCE);
        }
        for uav in &globals.unordered_accesses {
            self.core.transition(uav, ResourceState::UNORDERED_ACCESS);
        }
        for buffer in &globals.constant_buffers {
            self.core.transition(buffer, ResourceState::VERTEX_AND_CONSTANT_BUFFER);
        }
    }

    fn assert_global_limits(&self, globals: &GlobalBindings) {
        debug_assert!(globals.shader_resources.len() <= GLOBAL_SRV_SLOTS);
        debug_assert!(globals.unordered_accesses.len() <= GLOBAL_UAV_SLOTS);
        debug_assert!(globals.constant_buffers.len() <= GLOBAL_CBV_SLOTS);
    }

    /// Reserves the span's transient descriptor window, stalling on GPU
    /// progress when the ring is full of unretired ranges.
    fn allocate_transient(&mut self) -> Result<u32, GpuError> {
        if let Some(base) = self.core.shared.allocate_transient_range() {
            return Ok(base);
        }

        self.core.shared.stats.inc_transient_stalls();
        warn!(
            capacity = self.core.shared.transient_capacity(),
            "transient descriptor ring exhausted; stalling until the GPU retires a frame"
        );
        loop {
            // Unsubmitted work would deadlock the waits below.
            self.flush()?;
            let age = self.core.shared.transient_sync_age_increment();
            self.core.shared.sync_gpu_frame(FRAME_RING_SIZE.saturating_sub(age));
            if let Some(base) = self.core.shared.allocate_transient_range() {
                return Ok(base);
            }
            if age >= FRAME_RING_SIZE {
                // Every in-flight frame has been waited out; the ring is
                // simply too small for the request.
                return Err(GpuError::DescriptorHeapExhausted {
                    kind: DescriptorHeapKind::CbvSrvUav,
                    capacity: self.core.shared.transient_capacity(),
                });
            }
        }
    }

    fn auto_flush_check(&mut self) -> DrawResultFlags {
        if self.core.items_since_flush < MAX_ITEMS_PER_BEGIN_END {
            return DrawResultFlags::empty();
        }
        match self.flush() {
            Ok(()) => DrawResultFlags::empty(),
            Err(err) => {
                error!(error = %err, "mid-span flush failed");
                DrawResultFlags::UNSPECIFIED_ERROR
            }
        }
    }
}

impl ItemRecorder for MainRecorder {
    fn execute_graphics_item_with(
        &mut self,
        item: &GraphicsItem,
        flags: ExecuteItemFlags,
    ) -> DrawResultFlags {
        let mut result = self.core.record_graphics(item, flags);
        result |= self.auto_flush_check();
        result
    }

    fn execute_compute_item(&mut self, item: &ComputeItem) -> DrawResultFlags {
        let mut result = self.core.record_compute(item);
        result |= self.auto_flush_check();
        result
    }

    fn execute_raytrace_item(&mut self, item: &RaytraceItem) -> DrawResultFlags {
        let mut result = self.core.record_raytrace(item);
        result |= self.auto_flush_check();
        result
    }

    fn queue_resource_transition(&mut self, resource: &Arc<GpuResource>, target: ResourceState) {
        self.core.transition(resource, target);
    }

    fn execute_after_gpu_frame_done(&mut self, callback: FrameDoneCallback) {
        self.core.shared.push_frame_done(callback);
    }
}
