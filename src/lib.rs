//! Frame-pipeline core for the Vermilion engine.
//!
//! This crate contains the frame-rate-critical plumbing of a real-time
//! renderer, independent of any concrete graphics API:
//!
//! - [`graph`]: the render graph definition (steps, attachments,
//!   dependencies) and its validation;
//! - [`instance`]: per-step runtime state with memoized per-frame rendering
//!   and custom pass injection;
//! - [`buffer`]: frame-indexed GPU buffers with four update policies;
//! - [`deferred`]: per-slot deferred resource destruction;
//! - [`device`]: the shared device hub (frame cursor, pass-object cache);
//! - [`driver`]: the acquire/render/present loop over a [`driver::Surface`];
//! - [`jobs`]: the worker pool used for parallel command recording;
//! - [`backend`]: the [`backend::GpuBackend`] seam real graphics APIs plug
//!   into, plus the in-memory backend used by tests.
//!
//! A minimal frame loop:
//!
//! ```
//! use std::sync::Arc;
//! use glam::UVec2;
//! use vermilion_graphics::backend::DummyBackend;
//! use vermilion_graphics::device::GpuDevice;
//! use vermilion_graphics::driver::{FrameDriver, HeadlessSurface};
//! use vermilion_graphics::graph::{Renderer, RenderStep, RenderPassLogic};
//! use vermilion_graphics::instance::RecordContext;
//! use vermilion_graphics::types::ColorFormat;
//!
//! struct Clear;
//! impl RenderPassLogic for Clear {
//!     fn record(&self, _ctx: &mut RecordContext) {}
//! }
//!
//! # fn main() -> Result<(), vermilion_graphics::error::GraphicsError> {
//! let backend = Arc::new(DummyBackend::new());
//! let device = GpuDevice::new(backend.clone(), 2)?;
//! let surface = HeadlessSurface::new(
//!     backend.as_ref(),
//!     2,
//!     UVec2::new(640, 480),
//!     ColorFormat::Bgra8Unorm,
//! )?;
//!
//! let mut renderer = Renderer::new();
//! renderer.add_step(RenderStep::new("clear", Arc::new(Clear)).present());
//!
//! let mut driver = FrameDriver::new(device, surface, &renderer)?;
//! driver.render_frame()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod deferred;
pub mod device;
pub mod driver;
pub mod error;
pub mod graph;
pub mod instance;
pub mod jobs;
pub mod sync;
pub mod types;

pub use buffer::{Buffer, BufferPolicy, BufferUsage};
pub use device::GpuDevice;
pub use driver::{FrameDriver, Surface};
pub use error::GraphicsError;
pub use graph::{Attachment, RenderPassLogic, RenderStep, Renderer, StepHandle};
pub use instance::{ChunkContext, PassInstance, RecordContext};
pub use types::{ClearValue, ColorFormat};

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the crate version. Call once at startup, after the logger is set up.
pub fn init() {
    log::info!("vermilion-graphics {VERSION}");
}
