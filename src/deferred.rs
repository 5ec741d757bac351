//! Deferred GPU resource destruction.
//!
//! A resource retired while frame slot `k` is current may still be read by
//! the GPU until the commands recorded for slot `k` have drained. Instead of
//! destroying immediately, the handle goes into slot `k`'s pending list; the
//! list is flushed when slot `k` is about to become current again, at which
//! point the frame driver has already fence-waited on that slot's previous
//! submission.
//!
//! The destructor holds raw backend ids only. Ownership wrappers
//! ([`crate::buffer::Buffer`], the pass instance resource sets) enqueue
//! their ids here from `Drop`.

use parking_lot::Mutex;

use crate::backend::{BufferId, FramebufferId, GpuBackend, ImageViewId};

/// A retired resource awaiting destruction.
pub enum DeferredResource {
    Buffer(BufferId),
    ImageView(ImageViewId),
    Framebuffer(FramebufferId),
    /// Anything whose drop just has to be delayed until the slot is safe to
    /// reuse (staging memory, CPU-side mirrors, ...).
    Retained(Box<dyn std::any::Any + Send>),
}

impl DeferredResource {
    fn destroy(self, backend: &dyn GpuBackend) {
        match self {
            Self::Buffer(id) => backend.destroy_buffer(id),
            Self::ImageView(id) => backend.destroy_image_view(id),
            Self::Framebuffer(id) => backend.destroy_framebuffer(id),
            Self::Retained(any) => drop(any),
        }
    }
}

impl std::fmt::Debug for DeferredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(id) => write!(f, "Buffer({})", id.0),
            Self::ImageView(id) => write!(f, "ImageView({})", id.0),
            Self::Framebuffer(id) => write!(f, "Framebuffer({})", id.0),
            Self::Retained(_) => write!(f, "Retained"),
        }
    }
}

/// One pending-destruction list per in-flight frame slot.
pub struct DeferredDestructor {
    slots: Vec<Mutex<Vec<DeferredResource>>>,
}

impl DeferredDestructor {
    /// Create a destructor for `slot_count` in-flight slots.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is zero.
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "need at least one frame slot");
        Self {
            slots: (0..slot_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Enqueue a resource on the given slot's pending list.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn retire(&self, slot: usize, resource: DeferredResource) {
        log::trace!("DeferredDestructor: retire {resource:?} on slot {slot}");
        self.slots[slot].lock().push(resource);
    }

    /// Destroy everything pending on the given slot. Called by the device
    /// right before the slot becomes current again.
    pub fn flush_slot(&self, slot: usize, backend: &dyn GpuBackend) {
        let pending = std::mem::take(&mut *self.slots[slot].lock());
        if !pending.is_empty() {
            log::trace!(
                "DeferredDestructor: flushing {} resources on slot {slot}",
                pending.len()
            );
        }
        for resource in pending {
            resource.destroy(backend);
        }
    }

    /// Destroy everything pending on every slot. Only valid when the device
    /// is idle (shutdown path).
    pub fn flush_all(&self, backend: &dyn GpuBackend) {
        for slot in 0..self.slots.len() {
            self.flush_slot(slot, backend);
        }
    }

    /// Number of resources pending on one slot.
    pub fn pending_count(&self, slot: usize) -> usize {
        self.slots[slot].lock().len()
    }

    /// Number of resources pending across all slots.
    pub fn total_pending(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }
}
