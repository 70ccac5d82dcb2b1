//! Recording core shared by the main and worker recorders.
//!
//! The core owns one command buffer plus everything needed to turn an item
//! into native commands: the bound-state mirror for elision, scratch pipeline
//! descriptions, and the per-recorder pipeline lookasides. Policy differences
//! between main and workers (submission, auto-flush, how transitions are
//! applied) live in the wrapping types.

use std::sync::Arc;

use crate::cmd::{CommandBuffer, NativeCmd, PipelineId, PrimitiveTopology, ShadingRate};
use crate::device::DeviceShared;
use crate::native::PipelineKind;
use crate::pipeline::key::pack_entry_name;
use crate::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, LocalPipelineCache, RaytracePipelineDesc,
};
use crate::resource::{GpuResource, ResourceId, ALL_SUBRESOURCES};
use crate::shader::{Shader, ShaderBlob, ShaderState, INVALID_CONTENTS_ID};
use crate::state::ResourceState;

use super::{
    ComputeItem, DrawResultFlags, ExecuteItemFlags, FrameDoneCallback, GraphicsDraw, GraphicsItem,
    RaytraceItem, BINDINGS_TABLE_ROOT_INDEX, ITEM_CBV_SLOTS,
};

/// Native state last set on this recorder's buffer. `None` means unknown,
/// which forces the next item to set it.
#[derive(Default)]
pub(crate) struct BoundState {
    pub(crate) pipeline: Option<PipelineId>,
    pub(crate) topology: Option<PrimitiveTopology>,
    pub(crate) shading_rate: Option<ShadingRate>,
    pub(crate) vertex_buffer: Option<ResourceId>,
    pub(crate) index_buffer: Option<ResourceId>,
}

impl BoundState {
    pub(crate) fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Span-level bindings fixed by `begin_items`: what the pipeline keys must
/// carry and what a recorder rebinds after its buffer is recycled.
#[derive(Clone, Copy)]
pub(crate) struct CommittedBindings {
    pub(crate) kind: PipelineKind,
    pub(crate) rt_count: u32,
    pub(crate) rt_formats: [i32; 8],
    pub(crate) dsv_format: i32,
    pub(crate) has_depth: bool,
    pub(crate) sample_count: u32,
    pub(crate) transient_base: u32,
}

/// What a worker inherits from the main recorder for one batch.
#[derive(Clone, Copy)]
pub(crate) struct BatchBindings {
    pub(crate) bindings: CommittedBindings,
    pub(crate) epoch: u64,
}

pub(crate) struct RecorderCore {
    /// 0 is the main recorder; workers count from 1.
    pub(crate) index: u32,
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) buf: CommandBuffer,
    pub(crate) bound: BoundState,
    pub(crate) scratch_graphics: GraphicsPipelineDesc,
    pub(crate) scratch_compute: ComputePipelineDesc,
    pub(crate) scratch_raytrace: RaytracePipelineDesc,
    pub(crate) local_graphics: LocalPipelineCache,
    pub(crate) local_compute: LocalPipelineCache,
    pub(crate) local_raytrace: LocalPipelineCache,
    pub(crate) items_started: Option<PipelineKind>,
    pub(crate) committed: Option<CommittedBindings>,
    pub(crate) items_since_flush: usize,
    pub(crate) batch_epoch: u64,
    pub(crate) frame_done_local: Vec<FrameDoneCallback>,
}

impl RecorderCore {
    pub(crate) fn new(index: u32, shared: Arc<DeviceShared>) -> Self {
        Self {
            index,
            shared,
            buf: CommandBuffer::new(),
            bound: BoundState::default(),
            scratch_graphics: GraphicsPipelineDesc::default(),
            scratch_compute: ComputePipelineDesc::default(),
            scratch_raytrace: RaytracePipelineDesc::default(),
            local_graphics: LocalPipelineCache::new(),
            local_compute: LocalPipelineCache::new(),
            local_raytrace: LocalPipelineCache::new(),
            items_started: None,
            committed: None,
            items_since_flush: 0,
            batch_epoch: 0,
            frame_done_local: Vec::new(),
        }
    }

    pub(crate) fn reset_for_frame(&mut self, epoch: u64) {
        debug_assert!(
            self.frame_done_local.is_empty(),
            "frame-done callbacks left unflushed across a frame boundary"
        );
        self.buf.reset();
        self.invalidate_volatile();
        self.items_started = None;
        self.committed = None;
        self.items_since_flush = 0;
        self.batch_epoch = epoch;
    }

    /// Forgets bound state and resolved scratch shaders. Required whenever
    /// the buffer's recorded prefix stops being this recorder's history:
    /// after a flush, a batch hand-off, or a span end.
    pub(crate) fn invalidate_volatile(&mut self) {
        self.bound.invalidate();
        self.scratch_graphics.invalidate_shaders();
        self.scratch_compute.invalidate_shaders();
        self.scratch_raytrace.invalidate_shaders();
    }

    /// Drops the lookaside entries so swept shared-cache entries are not
    /// kept alive into the next frame.
    pub(crate) fn reset_local_caches(&mut self) {
        self.local_graphics.reset();
        self.local_compute.reset();
        self.local_raytrace.reset();
    }

    /// Re-pushes the committed span bindings onto the (fresh) buffer.
    pub(crate) fn rebind_committed(&mut self) {
        if let Some(committed) = self.committed {
            if committed.kind == PipelineKind::Graphics {
                self.buf.push(NativeCmd::SetRenderTargets {
                    count: committed.rt_count,
                    has_depth: committed.has_depth,
                });
            }
            self.buf.push(NativeCmd::SetDescriptorTable {
                root_index: BINDINGS_TABLE_ROOT_INDEX,
                base_offset: committed.transient_base,
            });
        }
    }

    pub(crate) fn transition(&mut self, resource: &Arc<GpuResource>, target: ResourceState) {
        self.transition_subresource(resource, target, ALL_SUBRESOURCES);
    }

    /// Ensures `resource` is in `target` state before this batch executes.
    /// The main recorder emits the barrier in place. Workers must not: their
    /// buffers execute in an order unrelated to recording order, so the
    /// request is parked on the device and the main recorder emits it ahead
    /// of every worker buffer at submit.
    pub(crate) fn transition_subresource(
        &mut self,
        resource: &Arc<GpuResource>,
        target: ResourceState,
        subresource: u32,
    ) {
        if self.index != 0 {
            if resource.is_transition_required(target, subresource) {
                debug_assert_eq!(
                    subresource, ALL_SUBRESOURCES,
                    "worker transitions must cover the whole resource"
                );
                self.shared.defer_transition(resource, target, self.index);
            }
            return;
        }
        let emitted = resource.transition_into(
            self.index,
            self.batch_epoch,
            target,
            subresource,
            &mut self.buf,
        );
        if emitted > 0 {
            self.shared.stats.add_barriers(emitted as u64);
        }
    }

    pub(crate) fn record_graphics(
        &mut self,
        item: &GraphicsItem,
        flags: ExecuteItemFlags,
    ) -> DrawResultFlags {
        let committed = match self.committed {
            Some(c) if c.kind == PipelineKind::Graphics => c,
            _ => {
                debug_assert!(false, "graphics item recorded outside a graphics span");
                return DrawResultFlags::UNSPECIFIED_ERROR;
            }
        };
        debug_assert!(item.constant_buffers.len() <= ITEM_CBV_SLOTS);
        self.shared.stats.inc_graphics_items();

        let reuse = flags.contains(ExecuteItemFlags::SHADERS_UNCHANGED)
            && self.scratch_graphics.vs_id != INVALID_CONTENTS_ID;
        if !reuse {
            if let Err(result) = fill_graphics_shaders(&mut self.scratch_graphics, item) {
                self.scratch_graphics.invalidate_shaders();
                return result;
            }
        }

        {
            let desc = &mut self.scratch_graphics;
            desc.rtv_formats = committed.rt_formats;
            desc.dsv_format = committed.dsv_format;
            desc.sample_count = committed.sample_count;
            desc.render_target_count = committed.rt_count as i8;
            desc.blend_mode = item.blend_mode as i8;
            desc.fill_mode = item.fill_mode as i8;
            desc.cull_mode = item.cull_mode as i8;
            desc.depth_func = item.depth_func as i8;
            desc.topology = item.topology as i8;
            desc.front_counter_clockwise = item.front_counter_clockwise;
            desc.multisample_enable = item.multisample_enable;
            desc.depth_enable = item.depth_enable;
            desc.depth_write_enable = item.depth_write_enable;
        }

        for buffer in &item.constant_buffers {
            self.transition(buffer, ResourceState::VERTEX_AND_CONSTANT_BUFFER);
        }
        for view in &item.shader_resources {
            self.transition(view, ResourceState::SHADER_RESOURCE);
        }
        if let Some(vb) = &item.vertex_buffer {
            self.transition(vb, ResourceState::VERTEX_AND_CONSTANT_BUFFER);
        }
        if let Some(ib) = &item.index_buffer {
            self.transition(ib, ResourceState::INDEX_BUFFER);
        }

        let frame = self.shared.frame_index();
        let entry = self.shared.graphics_pipelines.find_or_create(
            &self.scratch_graphics,
            &mut self.local_graphics,
            &self.shared.native,
            &self.shared.stats,
            frame,
        );
        let pipeline_id = match entry.pipeline() {
            Some(pipeline) => pipeline.id,
            None => {
                return if entry.is_failed() {
                    DrawResultFlags::UNSPECIFIED_ERROR
                } else {
                    DrawResultFlags::SHADERS_STILL_COMPILING
                };
            }
        };

        if self.bound.pipeline != Some(pipeline_id) {
            self.bound.pipeline = Some(pipeline_id);
            self.buf.push(NativeCmd::SetPipeline {
                pipeline: pipeline_id,
            });
        }
        if self.bound.topology != Some(item.topology) {
            self.bound.topology = Some(item.topology);
            self.buf.push(NativeCmd::SetTopology(item.topology));
        }
        if self.bound.shading_rate != Some(item.shading_rate) {
            self.bound.shading_rate = Some(item.shading_rate);
            self.buf.push(NativeCmd::SetShadingRate(item.shading_rate));
        }
        if let Some(vb) = &item.vertex_buffer {
            if self.bound.vertex_buffer != Some(vb.id()) {
                self.bound.vertex_buffer = Some(vb.id());
                self.buf.push(NativeCmd::SetVertexBuffer { resource: vb.id() });
            }
        }
        if let Some(ib) = &item.index_buffer {
            if self.bound.index_buffer != Some(ib.id()) {
                self.bound.index_buffer = Some(ib.id());
                self.buf.push(NativeCmd::SetIndexBuffer { resource: ib.id() });
            }
        }
        for (slot, buffer) in item.constant_buffers.iter().enumerate() {
            self.buf.push(NativeCmd::SetRootConstantBuffer {
                slot: slot as u32,
                virtual_address: buffer.virtual_address(),
            });
        }

        match item.draw {
            GraphicsDraw::Draw { vertex_count } => {
                self.buf.push(NativeCmd::Draw {
                    vertex_count,
                    instance_count: item.instance_count,
                });
            }
            GraphicsDraw::DrawIndexed { index_count } => {
                debug_assert!(
                    item.index_buffer.is_some(),
                    "indexed draw without an index buffer"
                );
                self.buf.push(NativeCmd::DrawIndexed {
                    index_count,
                    instance_count: item.instance_count,
                });
            }
        }

        self.items_since_flush += 1;
        DrawResultFlags::empty()
    }

    pub(crate) fn record_compute(&mut self, item: &ComputeItem) -> DrawResultFlags {
        match self.committed {
            Some(c) if c.kind == PipelineKind::Compute => {}
            _ => {
                debug_assert!(false, "compute item recorded outside a compute span");
                return DrawResultFlags::UNSPECIFIED_ERROR;
            }
        }
        if item.dispatch_x == 0 || item.dispatch_y == 0 || item.dispatch_z == 0 {
            debug_assert!(false, "zero-sized compute dispatch");
            return DrawResultFlags::UNSPECIFIED_ERROR;
        }
        debug_assert!(item.constant_buffers.len() <= ITEM_CBV_SLOTS);
        self.shared.stats.inc_compute_items();

        match resolve_shader(&item.compute_shader) {
            Ok((blob, id)) => {
                self.scratch_compute.cs_id = id;
                self.scratch_compute.cs_blob = Some(blob);
            }
            Err(result) => {
                self.scratch_compute.invalidate_shaders();
                return result;
            }
        }

        for buffer in &item.constant_buffers {
            self.transition(buffer, ResourceState::VERTEX_AND_CONSTANT_BUFFER);
        }
        for view in &item.shader_resources {
            self.transition(view, ResourceState::SHADER_RESOURCE);
        }
        for uav in &item.unordered_accesses {
            self.transition(uav, ResourceState::UNORDERED_ACCESS);
        }

        let frame = self.shared.frame_index();
        let entry = self.shared.compute_pipelines.find_or_create(
            &self.scratch_compute,
            &mut self.local_compute,
            &self.shared.native,
            &self.shared.stats,
            frame,
        );
        let pipeline_id = match entry.pipeline() {
            Some(pipeline) => pipeline.id,
            None if entry.is_failed() => {
                // A cooked compute shader the driver rejects is a content
                // bug, not a transient condition.
                debug_assert!(false, "compute pipeline build failed");
                return DrawResultFlags::UNSPECIFIED_ERROR;
            }
            None => return DrawResultFlags::SHADERS_STILL_COMPILING,
        };

        if self.bound.pipeline != Some(pipeline_id) {
            self.bound.pipeline = Some(pipeline_id);
            self.buf.push(NativeCmd::SetPipeline {
                pipeline: pipeline_id,
            });
        }
        for (slot, buffer) in item.constant_buffers.iter().enumerate() {
            self.buf.push(NativeCmd::SetRootConstantBuffer {
                slot: slot as u32,
                virtual_address: buffer.virtual_address(),
            });
        }

        if item.global_uav_barrier_before {
            self.buf.push(NativeCmd::UavBarrier);
        }
        self.buf.push(NativeCmd::Dispatch {
            x: item.dispatch_x,
            y: item.dispatch_y,
            z: item.dispatch_z,
        });
        if item.global_uav_barrier_after {
            self.buf.push(NativeCmd::UavBarrier);
        }

        self.items_since_flush += 1;
        DrawResultFlags::empty()
    }

    pub(crate) fn record_raytrace(&mut self, item: &RaytraceItem) -> DrawResultFlags {
        match self.committed {
            Some(c) if c.kind == PipelineKind::Raytrace => {}
            _ => {
                debug_assert!(false, "raytrace item recorded outside a raytrace span");
                return DrawResultFlags::UNSPECIFIED_ERROR;
            }
        }
        if item.width == 0 || item.height == 0 || item.depth == 0 {
            debug_assert!(false, "zero-sized ray dispatch");
            return DrawResultFlags::UNSPECIFIED_ERROR;
        }
        debug_assert!(item.constant_buffers.len() <= ITEM_CBV_SLOTS);
        self.shared.stats.inc_raytrace_items();

        // Raytrace pipelines link exports across libraries, so any compile
        // still in flight anywhere can invalidate the link result. Wait for
        // a globally quiet compiler.
        if self.shared.shaders.compiling_count() > 0 {
            return DrawResultFlags::SHADERS_STILL_COMPILING;
        }

        debug_assert!(
            item.any_hit_name.is_empty() || item.material_any_hit_name.is_empty(),
            "any-hit export named in both libraries"
        );
        debug_assert!(
            item.closest_hit_name.is_empty() || item.material_closest_hit_name.is_empty(),
            "closest-hit export named in both libraries"
        );
        debug_assert!(
            item.callable_name.is_empty() || item.material_callable_name.is_empty(),
            "callable export named in both libraries"
        );

        {
            let desc = &mut self.scratch_raytrace;
            match resolve_shader(&item.item_library) {
                Ok((blob, id)) => {
                    desc.item_library_id = id;
                    desc.item_blob = Some(blob);
                }
                Err(result) => {
                    desc.invalidate_shaders();
                    return result;
                }
            }
            match item.materials_library.as_deref() {
                Some(materials) => match resolve_shader(materials) {
                    Ok((blob, id)) => {
                        desc.materials_library_id = id;
                        desc.materials_blob = Some(blob);
                    }
                    Err(result) => {
                        desc.invalidate_shaders();
                        return result;
                    }
                },
                None => {
                    desc.materials_library_id = 0;
                    desc.materials_blob = None;
                }
            }
            desc.entry_names[0] = pack_entry_name(&item.ray_generation_name);
            desc.entry_names[1] = pack_entry_name(&item.miss_name);
            desc.entry_names[2] = pack_entry_name(&item.miss_secondary_name);
            desc.entry_names[3] = pack_entry_name(&item.any_hit_name);
            desc.entry_names[4] = pack_entry_name(&item.closest_hit_name);
            desc.entry_names[5] = pack_entry_name(&item.callable_name);
            desc.entry_names[6] = pack_entry_name(&item.material_any_hit_name);
            desc.entry_names[7] = pack_entry_name(&item.material_closest_hit_name);
            desc.entry_names[8] = pack_entry_name(&item.material_callable_name);
            desc.max_recursion_depth = item.max_recursion_depth;
            desc.max_payload_size = item.max_payload_size;
        }

        self.transition(
            &item.acceleration_structure,
            ResourceState::ACCELERATION_STRUCTURE,
        );
        for buffer in &item.constant_buffers {
            self.transition(buffer, ResourceState::VERTEX_AND_CONSTANT_BUFFER);
        }
        for view in &item.shader_resources {
            self.transition(view, ResourceState::SHADER_RESOURCE);
        }

        let frame = self.shared.frame_index();
        let entry = self.shared.raytrace_pipelines.find_or_create(
            &self.scratch_raytrace,
            &mut self.local_raytrace,
            &self.shared.native,
            &self.shared.stats,
            frame,
        );
        // Raytrace links routinely outlive a frame; an absent pipeline,
        // even a failed link, reports as still compiling so callers retry
        // once shader work settles.
        let (pipeline_id, incomplete) = match entry.pipeline() {
            Some(pipeline) => (pipeline.id, pipeline.incomplete),
            None => return DrawResultFlags::SHADERS_STILL_COMPILING,
        };
        let mut result = DrawResultFlags::empty();
        if incomplete {
            result |= DrawResultFlags::SHADERS_STILL_COMPILING;
        }

        if self.bound.pipeline != Some(pipeline_id) {
            self.bound.pipeline = Some(pipeline_id);
            self.buf.push(NativeCmd::SetPipeline {
                pipeline: pipeline_id,
            });
        }
        for (slot, buffer) in item.constant_buffers.iter().enumerate() {
            self.buf.push(NativeCmd::SetRootConstantBuffer {
                slot: slot as u32,
                virtual_address: buffer.virtual_address(),
            });
        }

        if item.global_uav_barrier_before {
            self.buf.push(NativeCmd::UavBarrier);
        }
        self.buf.push(NativeCmd::DispatchRays {
            width: item.width,
            height: item.height,
            depth: item.depth,
        });
        if item.global_uav_barrier_after {
            self.buf.push(NativeCmd::UavBarrier);
        }

        self.items_since_flush += 1;
        result
    }
}

fn fill_graphics_shaders(
    desc: &mut GraphicsPipelineDesc,
    item: &GraphicsItem,
) -> Result<(), DrawResultFlags> {
    let (blob, id) = resolve_shader(&item.vertex_shader)?;
    desc.vs_id = id;
    desc.vs_blob = Some(blob);
    resolve_stage(&mut desc.ps_id, &mut desc.ps_blob, item.pixel_shader.as_deref())?;
    resolve_stage(&mut desc.ds_id, &mut desc.ds_blob, item.domain_shader.as_deref())?;
    resolve_stage(&mut desc.hs_id, &mut desc.hs_blob, item.hull_shader.as_deref())?;
    resolve_stage(&mut desc.gs_id, &mut desc.gs_blob, item.geometry_shader.as_deref())?;
    Ok(())
}

/// Absent stages key as content id 0, which no real shader ever gets.
fn resolve_stage(
    id: &mut i64,
    blob: &mut Option<ShaderBlob>,
    shader: Option<&Shader>,
) -> Result<(), DrawResultFlags> {
    match shader {
        Some(shader) => {
            let (resolved, contents_id) = resolve_shader(shader)?;
            *id = contents_id;
            *blob = Some(resolved);
        }
        None => {
            *id = 0;
            *blob = None;
        }
    }
    Ok(())
}

fn resolve_shader(shader: &Shader) -> Result<(ShaderBlob, i64), DrawResultFlags> {
    if let Some((blob, id)) = shader.cooked_blob() {
        return Ok((blob, id));
    }
    if shader.state() == ShaderState::Failed {
        return Err(DrawResultFlags::UNSPECIFIED_ERROR);
    }
    Err(DrawResultFlags::SHADERS_STILL_COMPILING)
}
