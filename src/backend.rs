//! GPU backend abstraction layer.
//!
//! The frame-pipeline core never talks to a graphics API directly. Everything
//! it needs from the device bootstrap collaborator (allocation, image views,
//! framebuffers, pass objects, queue submission) goes through the
//! [`GpuBackend`] trait. Real backends (Vulkan, wgpu, ...) live outside this
//! crate; [`DummyBackend`] is the in-tree implementation used by tests and
//! headless development.
//!
//! The dummy backend is byte-accurate: buffer writes land in host memory and
//! can be read back, so the frame-indexed buffer policies are testable
//! without GPU hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::UVec2;
use parking_lot::Mutex;

use crate::buffer::BufferUsage;
use crate::error::GraphicsError;
use crate::graph::PassKey;
use crate::sync::Fence;
use crate::types::ColorFormat;

/// Raw handle to a GPU buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Raw handle to an image view (image + view pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewId(pub u64);

/// Raw handle to a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u64);

/// Raw handle to a pass object (the API-level render pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassObjectId(pub u64);

/// One queue submission: the commands recorded for a single pass instance
/// against one framebuffer.
#[derive(Debug)]
pub struct SubmitInfo {
    /// Debug name of the submitting pass.
    pub pass_name: String,
    pub pass_object: PassObjectId,
    pub framebuffer: FramebufferId,
    /// Semaphore ids this submission waits on (dependencies' render-finished).
    pub wait_semaphores: Vec<u64>,
    /// Semaphore id signaled when this submission completes.
    pub signal_semaphore: u64,
    /// Fence signaled when this submission completes, if the caller needs
    /// CPU-side completion tracking.
    pub signal_fence: Option<Fence>,
}

/// Interface to the device bootstrap collaborator.
///
/// The core only calls create/destroy/submit entry points; capability
/// negotiation happened before this trait object was handed over.
pub trait GpuBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        label: &str,
    ) -> Result<BufferId, GraphicsError>;

    /// Write bytes into a buffer at the given byte offset.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]);

    /// Read bytes back from a buffer. Used by the resize path to preserve
    /// contents across reallocation.
    fn read_buffer(&self, buffer: BufferId, offset: u64, size: u64) -> Vec<u8>;

    fn destroy_buffer(&self, buffer: BufferId);

    fn create_image_view(
        &self,
        format: ColorFormat,
        extent: UVec2,
        label: &str,
    ) -> Result<ImageViewId, GraphicsError>;

    fn destroy_image_view(&self, view: ImageViewId);

    fn create_framebuffer(
        &self,
        pass_object: PassObjectId,
        views: &[ImageViewId],
        extent: UVec2,
    ) -> Result<FramebufferId, GraphicsError>;

    fn destroy_framebuffer(&self, framebuffer: FramebufferId);

    /// Create the API-level pass object for an attachment layout. The device
    /// layer deduplicates by [`PassKey`]; backends may assume each distinct
    /// key is requested once.
    fn create_pass_object(&self, key: &PassKey) -> Result<PassObjectId, GraphicsError>;

    /// Submit recorded commands for one pass.
    fn submit(&self, info: &SubmitInfo);

    /// Block until the device is fully idle. Stop-the-world; only the static
    /// buffer write path and shutdown use this.
    fn wait_idle(&self);
}

/// In-memory backend for tests and headless development.
///
/// Buffers are real byte vectors, so writes and read-backs behave like a
/// mapped host-visible allocation. Submissions complete instantly and signal
/// their fence on the spot.
pub struct DummyBackend {
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    image_views: Mutex<HashMap<u64, (ColorFormat, UVec2)>>,
    framebuffers: Mutex<HashMap<u64, Vec<ImageViewId>>>,
    pass_objects: AtomicU64,
    submissions: Mutex<Vec<String>>,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            image_views: Mutex::new(HashMap::new()),
            framebuffers: Mutex::new(HashMap::new()),
            pass_objects: AtomicU64::new(0),
            submissions: Mutex::new(Vec::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live (not yet destroyed) buffer allocations.
    pub fn alive_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of live image views.
    pub fn alive_image_views(&self) -> usize {
        self.image_views.lock().len()
    }

    /// Number of live framebuffers.
    pub fn alive_framebuffers(&self) -> usize {
        self.framebuffers.lock().len()
    }

    /// Number of pass objects ever created (pass objects are never destroyed
    /// before shutdown).
    pub fn pass_object_count(&self) -> usize {
        self.pass_objects.load(Ordering::Relaxed) as usize
    }

    /// Total number of queue submissions so far.
    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Pass names of every submission, in submission order.
    pub fn submitted_passes(&self) -> Vec<String> {
        self.submissions.lock().clone()
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &str {
        "Dummy"
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        label: &str,
    ) -> Result<BufferId, GraphicsError> {
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let id = self.next_id();
        self.buffers.lock().insert(id, vec![0u8; size as usize]);
        log::trace!("DummyBackend: created buffer '{label}' ({usage:?}, {size} bytes)");
        Ok(BufferId(id))
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) {
        let mut buffers = self.buffers.lock();
        let bytes = buffers
            .get_mut(&buffer.0)
            .expect("write to destroyed buffer");
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, size: u64) -> Vec<u8> {
        let buffers = self.buffers.lock();
        let bytes = buffers.get(&buffer.0).expect("read from destroyed buffer");
        let start = offset as usize;
        bytes[start..start + size as usize].to_vec()
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.buffers.lock().remove(&buffer.0);
    }

    fn create_image_view(
        &self,
        format: ColorFormat,
        extent: UVec2,
        label: &str,
    ) -> Result<ImageViewId, GraphicsError> {
        if extent.x == 0 || extent.y == 0 {
            return Err(GraphicsError::InvalidParameter(
                "image extent cannot be zero".to_string(),
            ));
        }
        let id = self.next_id();
        self.image_views.lock().insert(id, (format, extent));
        log::trace!("DummyBackend: created image view '{label}' ({format:?}, {extent})");
        Ok(ImageViewId(id))
    }

    fn destroy_image_view(&self, view: ImageViewId) {
        self.image_views.lock().remove(&view.0);
    }

    fn create_framebuffer(
        &self,
        _pass_object: PassObjectId,
        views: &[ImageViewId],
        extent: UVec2,
    ) -> Result<FramebufferId, GraphicsError> {
        if views.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "framebuffer needs at least one attachment".to_string(),
            ));
        }
        let id = self.next_id();
        self.framebuffers.lock().insert(id, views.to_vec());
        log::trace!(
            "DummyBackend: created framebuffer ({} views, {extent})",
            views.len()
        );
        Ok(FramebufferId(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        self.framebuffers.lock().remove(&framebuffer.0);
    }

    fn create_pass_object(&self, key: &PassKey) -> Result<PassObjectId, GraphicsError> {
        self.pass_objects.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id();
        log::trace!(
            "DummyBackend: created pass object ({} attachments, present={})",
            key.attachments.len(),
            key.present
        );
        Ok(PassObjectId(id))
    }

    fn submit(&self, info: &SubmitInfo) {
        log::trace!(
            "DummyBackend: submit '{}' (waits on {} semaphores)",
            info.pass_name,
            info.wait_semaphores.len()
        );
        self.submissions.lock().push(info.pass_name.clone());
        // No real GPU behind this; work completes instantly.
        if let Some(fence) = &info.signal_fence {
            fence.signal();
        }
    }

    fn wait_idle(&self) {
        log::trace!("DummyBackend: wait_idle");
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);
