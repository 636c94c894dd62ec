use thiserror::Error;

use crate::device::DeviceLimits;

#[derive(Debug, Error)]
pub enum FluidError {
    #[error("failed to allocate {texels} texels: {reason}")]
    Allocation { texels: usize, reason: String },

    #[error("failed to bind shared surface {handle}: {reason}")]
    ResourceBind { handle: u32, reason: String },

    #[error("failed to create kernel `{entry}`: {reason}")]
    KernelBuild { entry: String, reason: String },

    #[error("device query failed: {0}")]
    DeviceQuery(String),

    #[error("kernel `{kernel}` expected a {expected:?} field, got {found:?}")]
    DimensionMismatch {
        kernel: String,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("acquire/release protocol violated: {0}")]
    ProtocolViolation(String),

    #[error("failed to dispatch `{kernel}`: {reason} ({limits})")]
    Dispatch {
        kernel: String,
        reason: String,
        limits: DeviceLimits,
    },

    #[error("device error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not allowed in state {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("EXR error: {0}")]
    Exr(#[from] exr::error::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, FluidError>;
