//! Logical GPU device.
//!
//! [`GpuDevice`] is the shared hub of the frame pipeline: it owns the
//! backend handle, the in-flight frame cursor, the deferred destruction
//! queues, and the pass-object deduplication cache. Everything that outlives
//! a single frame (buffers, pass instances, the frame driver) holds an
//! `Arc<GpuDevice>` or a `Weak<GpuDevice>` back-reference.
//!
//! The frame cursor cycles through `image_count` slots. Advancing first
//! flushes the pending-destruction list of the slot about to become
//! current; by that point the frame driver has already fence-waited on that
//! slot, so nothing on the list can still be referenced by in-flight GPU
//! work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, PassObjectId};
use crate::deferred::{DeferredDestructor, DeferredResource};
use crate::error::GraphicsError;
use crate::graph::PassKey;

pub struct GpuDevice {
    backend: Arc<dyn GpuBackend>,
    image_count: usize,
    current_image: AtomicUsize,
    deferred: DeferredDestructor,
    pass_objects: Mutex<HashMap<PassKey, PassObjectId>>,
}

impl GpuDevice {
    /// Create a device over the given backend with `image_count` in-flight
    /// frame slots.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        image_count: usize,
    ) -> Result<Arc<Self>, GraphicsError> {
        if image_count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "device needs at least one in-flight image".to_string(),
            ));
        }
        log::trace!(
            "GpuDevice: created over '{}' backend with {image_count} in-flight images",
            backend.name()
        );
        Ok(Arc::new(Self {
            backend,
            image_count,
            current_image: AtomicUsize::new(0),
            deferred: DeferredDestructor::new(image_count),
            pass_objects: Mutex::new(HashMap::new()),
        }))
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Number of in-flight frame slots.
    pub fn image_count(&self) -> usize {
        self.image_count
    }

    /// Index of the current frame slot, in `0..image_count`.
    pub fn current_image(&self) -> usize {
        self.current_image.load(Ordering::Acquire)
    }

    /// Advance to the next frame slot.
    ///
    /// The incoming slot's pending-destruction list is flushed first; the
    /// caller must have fence-waited on that slot's previous submission
    /// before calling this.
    pub fn next_frame(&self) {
        let next = (self.current_image() + 1) % self.image_count;
        self.deferred.flush_slot(next, self.backend.as_ref());
        self.current_image.store(next, Ordering::Release);
        log::trace!("GpuDevice: frame slot -> {next}");
    }

    /// Retire a resource on the current frame slot. It is destroyed when
    /// this slot next becomes current.
    pub fn drop_resource(&self, resource: DeferredResource) {
        self.deferred.retire(self.current_image(), resource);
    }

    /// Retire a resource on a specific frame slot. Used by per-slot
    /// containers that know which slot last referenced the resource.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= image_count`.
    pub fn drop_resource_at(&self, slot: usize, resource: DeferredResource) {
        self.deferred.retire(slot, resource);
    }

    /// Number of resources pending destruction on one slot.
    pub fn pending_destruction(&self, slot: usize) -> usize {
        self.deferred.pending_count(slot)
    }

    /// Look up the pass object for an attachment layout, creating it on
    /// first use. Pass objects are shared between all passes with an equal
    /// layout and live until shutdown.
    pub fn find_or_create_pass_object(
        &self,
        key: &PassKey,
    ) -> Result<PassObjectId, GraphicsError> {
        let mut cache = self.pass_objects.lock();
        if let Some(id) = cache.get(key) {
            return Ok(*id);
        }
        let id = self.backend.create_pass_object(key)?;
        cache.insert(key.clone(), id);
        Ok(id)
    }

    /// Block until the device is idle, then destroy everything still
    /// pending. Stop-the-world; used by static buffer writes and shutdown.
    pub fn wait_idle(&self) {
        self.backend.wait_idle();
        self.deferred.flush_all(self.backend.as_ref());
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.backend.wait_idle();
        self.deferred.flush_all(self.backend.as_ref());
        log::trace!("GpuDevice: destroyed");
    }
}

static_assertions::assert_impl_all!(GpuDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::buffer::BufferUsage;
    use crate::types::ColorFormat;
    use rstest::rstest;

    fn test_device(image_count: usize) -> Arc<GpuDevice> {
        GpuDevice::new(Arc::new(DummyBackend::new()), image_count).unwrap()
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(4)]
    fn test_frame_slot_cycles_modulo_image_count(#[case] image_count: usize) {
        let device = test_device(image_count);
        assert_eq!(device.current_image(), 0);
        for frame in 1..=image_count * 3 {
            device.next_frame();
            assert_eq!(device.current_image(), frame % image_count);
        }
    }

    #[test]
    fn test_zero_images_rejected() {
        let result = GpuDevice::new(Arc::new(DummyBackend::new()), 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_drop_resource_destroyed_when_slot_reused() {
        let backend = Arc::new(DummyBackend::new());
        let device = GpuDevice::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, 3).unwrap();

        let id = backend
            .create_buffer(16, BufferUsage::Uniform, "doomed")
            .unwrap();
        device.drop_resource(DeferredResource::Buffer(id));
        assert_eq!(device.pending_destruction(0), 1);

        // Slots 1 and 2 become current; slot 0's list must survive.
        device.next_frame();
        device.next_frame();
        assert_eq!(backend.alive_buffers(), 1);
        assert_eq!(device.pending_destruction(0), 1);

        // Wrapping back to slot 0 flushes it.
        device.next_frame();
        assert_eq!(backend.alive_buffers(), 0);
        assert_eq!(device.pending_destruction(0), 0);
    }

    #[test]
    fn test_single_slot_flushes_every_frame() {
        let backend = Arc::new(DummyBackend::new());
        let device = GpuDevice::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, 1).unwrap();

        let id = backend
            .create_buffer(16, BufferUsage::Vertex, "doomed")
            .unwrap();
        device.drop_resource(DeferredResource::Buffer(id));
        device.next_frame();
        assert_eq!(backend.alive_buffers(), 0);
        assert_eq!(device.current_image(), 0);
    }

    #[test]
    fn test_pass_object_dedup() {
        let backend = Arc::new(DummyBackend::new());
        let device = GpuDevice::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, 2).unwrap();

        let key = PassKey {
            attachments: vec![(ColorFormat::Rgba8Unorm, true)],
            present: false,
        };
        let a = device.find_or_create_pass_object(&key).unwrap();
        let b = device.find_or_create_pass_object(&key).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.pass_object_count(), 1);

        // Same format but different clear policy is a different layout.
        let other = PassKey {
            attachments: vec![(ColorFormat::Rgba8Unorm, false)],
            present: false,
        };
        let c = device.find_or_create_pass_object(&other).unwrap();
        assert_ne!(a, c);
        assert_eq!(backend.pass_object_count(), 2);
    }

    #[test]
    fn test_wait_idle_flushes_all_slots() {
        let backend = Arc::new(DummyBackend::new());
        let device = GpuDevice::new(Arc::clone(&backend) as Arc<dyn GpuBackend>, 3).unwrap();

        for slot in 0..3 {
            let id = backend
                .create_buffer(8, BufferUsage::Index, "tmp")
                .unwrap();
            device.drop_resource_at(slot, DeferredResource::Buffer(id));
        }
        device.wait_idle();
        assert_eq!(backend.alive_buffers(), 0);
    }
}
