//! Typed native command stream.
//!
//! Recorders append [`NativeCmd`]s to a [`CommandBuffer`]; closed buffers are
//! handed to the native queue as a group (see [`crate::NativeDevice`]). The
//! command set is the D3D12-class subset this subsystem actually drives:
//! barriers, pipeline/root binding, draws and dispatches.

use crate::resource::{ResourceId, ALL_SUBRESOURCES};
use crate::state::ResourceState;

/// Opaque identifier of a built native pipeline object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum PrimitiveTopology {
    PointList = 0,
    LineList = 1,
    TriangleList = 2,
    TriangleStrip = 3,
}

/// Coarse pixel shading rate (D3D12 packing: x in bits 2..4, y in bits 0..2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum ShadingRate {
    Rate1x1 = 0x0,
    Rate1x2 = 0x1,
    Rate2x1 = 0x4,
    Rate2x2 = 0x5,
    Rate2x4 = 0x6,
    Rate4x2 = 0x9,
    Rate4x4 = 0xa,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeCmd {
    TransitionBarrier {
        resource: ResourceId,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    },
    /// Global UAV barrier (all UAV writes visible before subsequent reads).
    UavBarrier,
    SetPipeline {
        pipeline: PipelineId,
    },
    SetTopology(PrimitiveTopology),
    SetShadingRate(ShadingRate),
    SetVertexBuffer {
        resource: ResourceId,
    },
    SetIndexBuffer {
        resource: ResourceId,
    },
    /// Binds the shader-visible descriptor heap window for this batch; the
    /// offset is a slot index into the transient prefix.
    SetDescriptorTable {
        root_index: u32,
        base_offset: u32,
    },
    SetRootConstantBuffer {
        slot: u32,
        virtual_address: u64,
    },
    SetRenderTargets {
        count: u32,
        has_depth: bool,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchRays {
        width: u32,
        height: u32,
        depth: u32,
    },
}

impl NativeCmd {
    pub fn whole_resource_barrier(
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> Self {
        NativeCmd::TransitionBarrier {
            resource,
            subresource: ALL_SUBRESOURCES,
            before,
            after,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferState {
    Open,
    Closed,
}

/// An ordered native command list with an explicit open/closed lifecycle.
///
/// Mirrors the native API contract: recording requires an open buffer,
/// submission requires a closed one, and `reset` recycles the allocator for
/// the next frame's recording.
#[derive(Debug)]
pub struct CommandBuffer {
    cmds: Vec<NativeCmd>,
    state: BufferState,
}

impl CommandBuffer {
    /// New buffers start closed; call [`CommandBuffer::reset`] before recording.
    pub fn new() -> Self {
        Self {
            cmds: Vec::new(),
            state: BufferState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BufferState::Open
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn commands(&self) -> &[NativeCmd] {
        &self.cmds
    }

    /// Discards any recorded commands and reopens the buffer for recording.
    pub fn reset(&mut self) {
        self.cmds.clear();
        self.state = BufferState::Open;
    }

    pub fn push(&mut self, cmd: NativeCmd) {
        debug_assert!(self.is_open(), "recording into a closed command buffer");
        self.cmds.push(cmd);
    }

    /// Splices commands recorded elsewhere onto the end of this buffer.
    pub fn append(&mut self, mut cmds: Vec<NativeCmd>) {
        debug_assert!(self.is_open(), "recording into a closed command buffer");
        self.cmds.append(&mut cmds);
    }

    pub fn close(&mut self) {
        debug_assert!(self.is_open(), "closing a command buffer twice");
        self.state = BufferState::Closed;
    }

    /// Takes the recorded commands for submission, leaving the buffer empty
    /// and closed.
    pub fn take_commands(&mut self) -> Vec<NativeCmd> {
        debug_assert!(
            !self.is_open(),
            "taking commands from a buffer that was never closed"
        );
        std::mem::take(&mut self.cmds)
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}
