//! `kiln-gpu` is the command submission core of Kiln.
//!
//! Currently this crate provides:
//! - Per-subresource resource state tracking with automatic barrier emission
//!   (see [`ResourceStateTracker`]).
//! - Descriptor heaps with a frame-recycled transient window (see
//!   [`descriptor`]).
//! - Content-hashed pipeline state caching with per-recorder lookasides and
//!   age-based sweeping (see [`pipeline`]).
//! - Item recording through a main recorder plus fork-join worker batches
//!   (see [`recorder`] and [`Device::execute_graphics_batch`]).

mod device;
mod error;
mod native;
mod resource;
mod shader;
mod state;
mod stats;

pub mod cmd;
pub mod descriptor;
pub mod pipeline;
pub mod recorder;

pub use device::{Device, DeviceOptions, FRAME_RING_SIZE, MAX_WORKERS};
pub use error::GpuError;
pub use native::{NativeDevice, NativePipeline, PipelineKind, QueueEvent};
pub use resource::{Format, GpuResource, ResourceDesc, ResourceId, ResourceKind, ALL_SUBRESOURCES};
pub use shader::{Shader, ShaderBlob, ShaderRegistry, ShaderState, INVALID_CONTENTS_ID};
pub use state::{ResourceState, ResourceStateTracker};
pub use stats::{GpuStats, GpuStatsSnapshot};
