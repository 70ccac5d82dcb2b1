//! Item recording.
//!
//! Callers describe work as self-contained items (a draw, a dispatch, a ray
//! dispatch) and hand them to a recorder. The main recorder owns frame-level
//! binding state and submission; worker recorders record shards of a batch
//! concurrently and never submit. Both elide redundant native state and
//! resolve pipelines through the shared caches.

mod base;
pub mod main;
pub mod worker;

pub use main::MainRecorder;
pub use worker::WorkerRecorder;

use std::sync::Arc;

use bitflags::bitflags;

use crate::cmd::{PrimitiveTopology, ShadingRate};
use crate::device::Device;
use crate::resource::GpuResource;
use crate::shader::Shader;
use crate::state::ResourceState;

/// Most items a single `begin_items` span may hold; also the point at which
/// the main recorder flushes mid-span to bound command memory.
pub const MAX_ITEMS_PER_BEGIN_END: usize = 131_072;

/// Below this many items per worker, extra workers cost more than they save.
pub const MIN_ITEMS_PER_WORKER: usize = 64;

pub const MAX_RENDER_TARGETS: usize = 8;
pub const GLOBAL_SRV_SLOTS: usize = 16;
pub const GLOBAL_UAV_SLOTS: usize = 8;
pub const GLOBAL_CBV_SLOTS: usize = 8;

/// Root constant-buffer slots available to a single item.
pub const ITEM_CBV_SLOTS: usize = 8;

/// Transient descriptor slots reserved per `begin_items` span: the global
/// binding window every item in the span indexes into.
pub const TRANSIENT_RANGE: u32 = 32;

pub(crate) const BINDINGS_TABLE_ROOT_INDEX: u32 = 0;

bitflags! {
    /// Per-item execution outcome. Flags accumulate across a batch with OR,
    /// so a batch result reports every condition any item hit.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DrawResultFlags: u32 {
        /// The item could not be recorded and was dropped.
        const UNSPECIFIED_ERROR = 1 << 0;
        /// A required shader or pipeline is not ready yet; retry next frame.
        const SHADERS_STILL_COMPILING = 1 << 1;
        /// A referenced asset is still streaming in; retry next frame.
        const ASSETS_STILL_LOADING = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ExecuteItemFlags: u32 {
        /// The item uses the same shader set as the previous item on this
        /// recorder, so shader resolution may be skipped.
        const SHADERS_UNCHANGED = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum BlendMode {
    Opaque = 0,
    Additive = 1,
    AlphaBlend = 2,
    PremultAlphaBlend = 3,
    Mult = 4,
    OffscreenAccumulate = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum FillMode {
    Wireframe = 2,
    Solid = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum CullMode {
    None = 1,
    Front = 2,
    Back = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum CompareFunc {
    Never = 1,
    Less = 2,
    Equal = 3,
    LessEqual = 4,
    Greater = 5,
    NotEqual = 6,
    GreaterEqual = 7,
    Always = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphicsDraw {
    Draw { vertex_count: u32 },
    DrawIndexed { index_count: u32 },
}

/// One draw plus everything it binds. Items are plain data; recording them
/// has no effect on the item itself, so one item can be recorded many times.
#[derive(Clone)]
pub struct GraphicsItem {
    pub vertex_shader: Arc<Shader>,
    pub pixel_shader: Option<Arc<Shader>>,
    pub domain_shader: Option<Arc<Shader>>,
    pub hull_shader: Option<Arc<Shader>>,
    pub geometry_shader: Option<Arc<Shader>>,
    pub blend_mode: BlendMode,
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: CompareFunc,
    pub multisample_enable: bool,
    pub topology: PrimitiveTopology,
    pub shading_rate: ShadingRate,
    pub vertex_buffer: Option<Arc<GpuResource>>,
    pub index_buffer: Option<Arc<GpuResource>>,
    pub constant_buffers: Vec<Arc<GpuResource>>,
    pub shader_resources: Vec<Arc<GpuResource>>,
    pub draw: GraphicsDraw,
    pub instance_count: u32,
}

impl GraphicsItem {
    pub fn new(vertex_shader: Arc<Shader>, draw: GraphicsDraw) -> Self {
        Self {
            vertex_shader,
            pixel_shader: None,
            domain_shader: None,
            hull_shader: None,
            geometry_shader: None,
            blend_mode: BlendMode::Opaque,
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_enable: true,
            depth_write_enable: true,
            depth_func: CompareFunc::LessEqual,
            multisample_enable: false,
            topology: PrimitiveTopology::TriangleList,
            shading_rate: ShadingRate::Rate1x1,
            vertex_buffer: None,
            index_buffer: None,
            constant_buffers: Vec::new(),
            shader_resources: Vec::new(),
            draw,
            instance_count: 1,
        }
    }
}

#[derive(Clone)]
pub struct ComputeItem {
    pub compute_shader: Arc<Shader>,
    pub constant_buffers: Vec<Arc<GpuResource>>,
    pub shader_resources: Vec<Arc<GpuResource>>,
    pub unordered_accesses: Vec<Arc<GpuResource>>,
    pub dispatch_x: u32,
    pub dispatch_y: u32,
    pub dispatch_z: u32,
    /// Make prior UAV writes visible before this dispatch runs.
    pub global_uav_barrier_before: bool,
    /// Make this dispatch's UAV writes visible to whatever follows.
    pub global_uav_barrier_after: bool,
}

impl ComputeItem {
    pub fn new(
        compute_shader: Arc<Shader>,
        dispatch_x: u32,
        dispatch_y: u32,
        dispatch_z: u32,
    ) -> Self {
        Self {
            compute_shader,
            constant_buffers: Vec::new(),
            shader_resources: Vec::new(),
            unordered_accesses: Vec::new(),
            dispatch_x,
            dispatch_y,
            dispatch_z,
            global_uav_barrier_before: true,
            global_uav_barrier_after: true,
        }
    }
}

/// One ray dispatch. Entry points are named exports of the item library;
/// when a materials library is present, the `material_*` names replace their
/// plain counterparts and the two sets must not overlap.
#[derive(Clone)]
pub struct RaytraceItem {
    pub item_library: Arc<Shader>,
    pub materials_library: Option<Arc<Shader>>,
    pub ray_generation_name: String,
    pub miss_name: String,
    pub miss_secondary_name: String,
    pub any_hit_name: String,
    pub closest_hit_name: String,
    pub callable_name: String,
    pub material_any_hit_name: String,
    pub material_closest_hit_name: String,
    pub material_callable_name: String,
    pub acceleration_structure: Arc<GpuResource>,
    pub constant_buffers: Vec<Arc<GpuResource>>,
    pub shader_resources: Vec<Arc<GpuResource>>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
    pub global_uav_barrier_before: bool,
    pub global_uav_barrier_after: bool,
}

impl RaytraceItem {
    pub fn new(
        item_library: Arc<Shader>,
        acceleration_structure: Arc<GpuResource>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            item_library,
            materials_library: None,
            ray_generation_name: String::new(),
            miss_name: String::new(),
            miss_secondary_name: String::new(),
            any_hit_name: String::new(),
            closest_hit_name: String::new(),
            callable_name: String::new(),
            material_any_hit_name: String::new(),
            material_closest_hit_name: String::new(),
            material_callable_name: String::new(),
            acceleration_structure,
            constant_buffers: Vec::new(),
            shader_resources: Vec::new(),
            width,
            height,
            depth: 1,
            max_recursion_depth: 1,
            max_payload_size: 0,
            global_uav_barrier_before: true,
            global_uav_barrier_after: true,
        }
    }
}

/// Render target set a `begin_graphics_items` span draws into.
#[derive(Clone)]
pub struct RenderOutputs {
    pub render_targets: Vec<Arc<GpuResource>>,
    pub depth_stencil: Option<Arc<GpuResource>>,
    pub sample_count: u32,
}

impl Default for RenderOutputs {
    fn default() -> Self {
        Self {
            render_targets: Vec::new(),
            depth_stencil: None,
            sample_count: 1,
        }
    }
}

/// Bindings shared by every item in a span, staged into the span's transient
/// descriptor window.
#[derive(Clone, Default)]
pub struct GlobalBindings {
    pub shader_resources: Vec<Arc<GpuResource>>,
    pub unordered_accesses: Vec<Arc<GpuResource>>,
    pub constant_buffers: Vec<Arc<GpuResource>>,
}

pub type FrameDoneCallback = Box<dyn FnOnce(&Device) + Send>;
pub type BeginFrameCallback = Box<dyn FnOnce(&mut MainRecorder) + Send>;

/// Recording surface shared by the main recorder and batch workers. Batch
/// item callbacks receive it as `&mut dyn ItemRecorder` so the same callback
/// body runs single-threaded or sharded.
pub trait ItemRecorder {
    fn execute_graphics_item(&mut self, item: &GraphicsItem) -> DrawResultFlags {
        self.execute_graphics_item_with(item, ExecuteItemFlags::empty())
    }

    fn execute_graphics_item_with(
        &mut self,
        item: &GraphicsItem,
        flags: ExecuteItemFlags,
    ) -> DrawResultFlags;

    fn execute_compute_item(&mut self, item: &ComputeItem) -> DrawResultFlags;

    fn execute_raytrace_item(&mut self, item: &RaytraceItem) -> DrawResultFlags;

    /// Requests that `resource` be in `target` state before this batch's
    /// commands execute. On workers the barrier lands in the main recorder's
    /// buffer, which the native queue runs ahead of every worker buffer.
    fn queue_resource_transition(&mut self, resource: &Arc<GpuResource>, target: ResourceState);

    /// Runs `callback` once the GPU has retired the frame being recorded.
    fn execute_after_gpu_frame_done(&mut self, callback: FrameDoneCallback);
}
