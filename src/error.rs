//! Graphics error types.

use thiserror::Error;

/// Errors that can occur in the frame-pipeline core.
///
/// Configuration and resource errors are unrecoverable by design: a renderer
/// whose core allocation failed has no safe degraded mode, so callers are
/// expected to abort startup on any of these. Soft misses (a named resource
/// lookup that finds nothing) are not errors; they surface as unupgradable
/// `Weak` references instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// The render graph is malformed (cycle, missing or duplicate present node).
    #[error("invalid render graph: {0}")]
    InvalidGraph(String),
    /// Failed to create a GPU resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Out of GPU memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// Failed to acquire or present a swapchain image.
    #[error("surface error: {0}")]
    Surface(String),
}
