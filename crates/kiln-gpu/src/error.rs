//! Crate-level error type.
//!
//! Per-item outcomes (shader still compiling, skipped draws) are result
//! flags, not errors; `GpuError` covers the conditions that abort an
//! operation outright.

use thiserror::Error;

use crate::descriptor::DescriptorHeapKind;

#[derive(Debug, Error)]
pub enum GpuError {
    /// The native device reported removal. Not retryable; the owner must
    /// recreate the device.
    #[error("device removed")]
    DeviceRemoved,

    #[error("{kind:?} descriptor heap exhausted (capacity {capacity})")]
    DescriptorHeapExhausted {
        kind: DescriptorHeapKind,
        capacity: u32,
    },

    #[error("invalid device options: {0}")]
    InvalidOptions(String),
}
