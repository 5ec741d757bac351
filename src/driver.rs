//! Frame driver: the per-frame submission and presentation loop.
//!
//! [`FrameDriver`] owns the cadence of the pipeline. One call to
//! [`FrameDriver::render_frame`] performs the full sequence:
//!
//! 1. fence-wait the frame slot about to be reused, so its previous
//!    submission has fully drained;
//! 2. advance the device cursor, which also flushes that slot's deferred
//!    destruction list;
//! 3. acquire the next swapchain image from the [`Surface`];
//! 4. reset the instance tree's per-frame flags and run
//!    `create_or_resize` at the surface's current resolution;
//! 5. render the tree root, attaching this slot's fence to the root
//!    submission;
//! 6. present, waiting on the root's render-finished semaphore.
//!
//! With a [`JobQueue`] attached, passes whose logic declares a
//! record-thread count above 1 split their command recording across its
//! workers; every chunk joins before the pass submits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;

use crate::backend::{GpuBackend, ImageViewId};
use crate::device::GpuDevice;
use crate::error::GraphicsError;
use crate::graph::Renderer;
use crate::instance::{create_graph, PassInstance};
use crate::jobs::JobQueue;
use crate::sync::{Fence, Semaphore};
use crate::types::ColorFormat;

/// The swapchain-owning collaborator.
///
/// Implementations must hand back images in cyclic order, in lockstep with
/// the device's frame cursor: the `k`-th acquire after startup returns
/// image `k % image_count`. FIFO-presented swapchains with a matching image
/// count satisfy this.
pub trait Surface: Send + Sync {
    fn image_count(&self) -> usize;

    /// Current drawable resolution. May change between frames.
    fn resolution(&self) -> UVec2;

    fn format(&self) -> ColorFormat;

    /// One view per swapchain image, in image order.
    fn image_views(&self) -> Vec<ImageViewId>;

    /// Acquire the next image, returning its index.
    fn acquire_next_image(&self) -> Result<usize, GraphicsError>;

    /// Queue the image for presentation once `wait` is signaled.
    fn present(&self, image_index: usize, wait: Semaphore) -> Result<(), GraphicsError>;
}

/// Windowless surface for tests and offscreen rendering.
pub struct HeadlessSurface {
    format: ColorFormat,
    resolution: Mutex<UVec2>,
    views: Vec<ImageViewId>,
    next_image: Mutex<usize>,
    presented: AtomicUsize,
}

impl HeadlessSurface {
    pub fn new(
        backend: &dyn GpuBackend,
        image_count: usize,
        resolution: UVec2,
        format: ColorFormat,
    ) -> Result<Arc<Self>, GraphicsError> {
        let mut views = Vec::with_capacity(image_count);
        for index in 0..image_count {
            views.push(backend.create_image_view(
                format,
                resolution,
                &format!("headless[{index}]"),
            )?);
        }
        Ok(Arc::new(Self {
            format,
            resolution: Mutex::new(resolution),
            views,
            next_image: Mutex::new(0),
            presented: AtomicUsize::new(0),
        }))
    }

    /// Change the reported resolution, as a window resize would.
    pub fn set_resolution(&self, resolution: UVec2) {
        *self.resolution.lock() = resolution;
    }

    /// Number of frames presented so far.
    pub fn presented_count(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }
}

impl Surface for HeadlessSurface {
    fn image_count(&self) -> usize {
        self.views.len()
    }

    fn resolution(&self) -> UVec2 {
        *self.resolution.lock()
    }

    fn format(&self) -> ColorFormat {
        self.format
    }

    fn image_views(&self) -> Vec<ImageViewId> {
        self.views.clone()
    }

    fn acquire_next_image(&self) -> Result<usize, GraphicsError> {
        let mut next = self.next_image.lock();
        let image = *next;
        *next = (*next + 1) % self.views.len();
        Ok(image)
    }

    fn present(&self, _image_index: usize, _wait: Semaphore) -> Result<(), GraphicsError> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FrameDriver {
    device: Arc<GpuDevice>,
    surface: Arc<dyn Surface>,
    root: Arc<PassInstance>,
    frame_fences: Vec<Option<Fence>>,
    frame_count: u64,
    pending_rebuild: bool,
}

impl FrameDriver {
    /// Instantiate `renderer` against the device and wire it to a surface.
    ///
    /// The surface must expose exactly as many images as the device has
    /// in-flight slots.
    pub fn new(
        device: Arc<GpuDevice>,
        surface: Arc<dyn Surface>,
        renderer: &Renderer,
    ) -> Result<Self, GraphicsError> {
        if surface.image_count() != device.image_count() {
            return Err(GraphicsError::InvalidParameter(format!(
                "surface has {} images but device has {} in-flight slots",
                surface.image_count(),
                device.image_count()
            )));
        }
        let root = create_graph(renderer, &device, surface.format())?;
        let slot_count = device.image_count();
        Ok(Self {
            device,
            surface,
            root,
            frame_fences: (0..slot_count).map(|_| None).collect(),
            frame_count: 0,
            pending_rebuild: false,
        })
    }

    /// Attach a job queue to the instance tree. Passes whose logic
    /// declares a record-thread count above 1 record their chunks on its
    /// workers.
    pub fn enable_parallel_recording(&mut self, jobs: Arc<JobQueue>) {
        self.root.set_job_queue(jobs);
    }

    /// The instance tree root (the present pass). Buffers and custom
    /// passes are registered through it.
    pub fn root(&self) -> &Arc<PassInstance> {
        &self.root
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.device
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Force every instance to rebuild its resources on the next frame.
    pub fn request_rebuild(&mut self) {
        self.pending_rebuild = true;
    }

    /// Render and present one frame.
    pub fn render_frame(&mut self) -> Result<(), GraphicsError> {
        // Reuse of a slot must wait for the submission that last used it.
        // The device flushes the slot's deferred list while advancing.
        if self.frame_count > 0 {
            let next = (self.device.current_image() + 1) % self.device.image_count();
            if let Some(fence) = &self.frame_fences[next] {
                fence.wait();
            }
            self.device.next_frame();
        }
        let slot = self.device.current_image();

        let image = self.surface.acquire_next_image()?;
        debug_assert_eq!(image, slot, "surface image out of step with frame cursor");

        self.root.reset_for_next_frame();
        let force = std::mem::take(&mut self.pending_rebuild);
        self.root.create_or_resize(
            self.surface.resolution(),
            &self.surface.image_views(),
            force,
        )?;

        let fence = Fence::new();
        let finished = self.root.render(slot, Some(fence.clone()));

        self.surface.present(image, finished)?;
        self.frame_fences[slot] = Some(fence);
        self.frame_count += 1;
        log::trace!("FrameDriver: frame {} on slot {slot}", self.frame_count);
        Ok(())
    }

    /// Wait for every in-flight frame, then drain all deferred destruction.
    pub fn wait_idle(&mut self) {
        for fence in self.frame_fences.iter_mut() {
            if let Some(fence) = fence.take() {
                fence.wait();
            }
        }
        self.device.wait_idle();
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

static_assertions::assert_impl_all!(FrameDriver: Send);
