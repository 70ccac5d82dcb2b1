//! GPU resources and their descriptions.
//!
//! A [`GpuResource`] pairs an opaque native handle (id, virtual address,
//! descriptor slots) with the state tracker that owns its barrier emission.
//! Resources are created through [`crate::Device`]; dropping one releases its
//! CPU-only views immediately and defers shader-visible view release to the
//! end of the current GPU frame.

use std::sync::{Arc, Mutex};

use crate::cmd::CommandBuffer;
use crate::descriptor::DescriptorSlot;
use crate::device::DeviceShared;
use crate::state::{ResourceState, ResourceStateTracker};

/// Targets every subresource of a resource (native all-subresources value).
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

const GPU_VA_BASE: u64 = 0x0001_0000_0000;
const GPU_VA_STRIDE: u64 = 0x1_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Texel formats the subsystem cares about (native format codes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Format {
    #[default]
    Unknown = 0,
    R16G16B16A16Float = 10,
    R11G11B10Float = 26,
    R8G8B8A8Unorm = 28,
    D32Float = 40,
    R32Float = 41,
    R32Uint = 42,
    D24UnormS8Uint = 45,
    B8G8R8A8Unorm = 87,
}

impl Format {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Texture,
    AccelerationStructure,
}

#[derive(Clone, Copy, Debug)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    pub format: Format,
    pub subresource_count: u32,
    pub size_bytes: u64,
    pub initial_state: ResourceState,
    /// Allocates a persistent shader-visible view at creation.
    pub shader_visible: bool,
    pub render_target: bool,
    pub depth_stencil: bool,
}

impl ResourceDesc {
    pub fn buffer(size_bytes: u64) -> Self {
        Self {
            kind: ResourceKind::Buffer,
            format: Format::Unknown,
            subresource_count: 1,
            size_bytes,
            initial_state: ResourceState::COMMON,
            shader_visible: false,
            render_target: false,
            depth_stencil: false,
        }
    }

    pub fn texture(format: Format, subresource_count: u32) -> Self {
        debug_assert!(subresource_count >= 1);
        Self {
            kind: ResourceKind::Texture,
            format,
            subresource_count,
            size_bytes: 0,
            initial_state: ResourceState::COMMON,
            shader_visible: true,
            render_target: false,
            depth_stencil: false,
        }
    }

    pub fn acceleration_structure(size_bytes: u64) -> Self {
        Self {
            kind: ResourceKind::AccelerationStructure,
            format: Format::Unknown,
            subresource_count: 1,
            size_bytes,
            initial_state: ResourceState::ACCELERATION_STRUCTURE,
            shader_visible: true,
            render_target: false,
            depth_stencil: false,
        }
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_render_target(mut self) -> Self {
        debug_assert!(self.kind == ResourceKind::Texture);
        self.render_target = true;
        self
    }

    pub fn with_depth_stencil(mut self) -> Self {
        debug_assert!(self.kind == ResourceKind::Texture);
        self.depth_stencil = true;
        self
    }

    pub fn with_shader_visible(mut self, visible: bool) -> Self {
        self.shader_visible = visible;
        self
    }
}

/// A GPU resource plus its tracked state.
///
/// Must be dropped with no per-subresource state overrides outstanding.
#[derive(Debug)]
pub struct GpuResource {
    id: ResourceId,
    desc: ResourceDesc,
    tracker: Mutex<ResourceStateTracker>,
    srv_slot: Option<DescriptorSlot>,
    rtv_slot: Option<DescriptorSlot>,
    dsv_slot: Option<DescriptorSlot>,
    shared: Arc<DeviceShared>,
}

impl GpuResource {
    pub(crate) fn new(
        id: ResourceId,
        desc: ResourceDesc,
        srv_slot: Option<DescriptorSlot>,
        rtv_slot: Option<DescriptorSlot>,
        dsv_slot: Option<DescriptorSlot>,
        shared: Arc<DeviceShared>,
    ) -> Self {
        Self {
            id,
            desc,
            tracker: Mutex::new(ResourceStateTracker::new(
                desc.initial_state,
                desc.subresource_count,
            )),
            srv_slot,
            rtv_slot,
            dsv_slot,
            shared,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn size_bytes(&self) -> u64 {
        self.desc.size_bytes
    }

    pub fn subresource_count(&self) -> u32 {
        self.desc.subresource_count
    }

    pub fn virtual_address(&self) -> u64 {
        GPU_VA_BASE + self.id.0 * GPU_VA_STRIDE
    }

    /// Persistent shader-visible view, when the resource has one. The slot
    /// index doubles as the resource's bindless handle.
    pub fn srv_slot(&self) -> Option<DescriptorSlot> {
        self.srv_slot
    }

    pub fn rtv_slot(&self) -> Option<DescriptorSlot> {
        self.rtv_slot
    }

    pub fn dsv_slot(&self) -> Option<DescriptorSlot> {
        self.dsv_slot
    }

    /// Uniform tracked state (overrides excluded).
    pub fn current_state(&self) -> ResourceState {
        self.tracker.lock().unwrap().uniform_state()
    }

    pub fn subresource_state(&self, subresource: u32) -> ResourceState {
        self.tracker.lock().unwrap().subresource_state(subresource)
    }

    pub fn is_transition_required(&self, target: ResourceState, subresource: u32) -> bool {
        self.tracker
            .lock()
            .unwrap()
            .is_transition_required(target, subresource)
    }

    /// Records a state change applied outside the recorded command streams.
    pub fn adopt_state(&self, target: ResourceState, subresource: u32) {
        self.tracker.lock().unwrap().adopt_state(target, subresource);
    }

    /// Transitions on behalf of recorder `owner` in batch `epoch`, emitting
    /// into `buf`. Returns the number of barriers emitted.
    pub(crate) fn transition_into(
        &self,
        owner: u32,
        epoch: u64,
        target: ResourceState,
        subresource: u32,
        buf: &mut CommandBuffer,
    ) -> usize {
        let mut tracker = self.tracker.lock().unwrap();
        tracker.claim_for_batch(owner, epoch);
        tracker.transition(self.id, target, subresource, buf)
    }
}

impl Drop for GpuResource {
    fn drop(&mut self) {
        if let Some(slot) = self.rtv_slot.take() {
            self.shared.rtv_heap.release(slot.index);
        }
        if let Some(slot) = self.dsv_slot.take() {
            self.shared.dsv_heap.release(slot.index);
        }
        if let Some(slot) = self.srv_slot.take() {
            // The GPU may still dereference this view during in-flight
            // frames; release once the current frame's fence retires.
            self.shared.defer_descriptor_release(slot.index);
        }
        if !std::thread::panicking() {
            self.tracker.lock().unwrap().detach();
        }
    }
}
