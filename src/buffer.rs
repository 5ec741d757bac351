//! Frame-indexed GPU buffers.
//!
//! A [`Buffer`] is a logical array of `element_count` elements of `stride`
//! bytes, backed by one or more GPU allocations depending on its update
//! policy:
//!
//! | Policy      | Allocations | Write behavior                              |
//! |-------------|-------------|---------------------------------------------|
//! | `Immutable` | 1           | write-once, never resized                    |
//! | `Static`    | 1           | device-idle wait, then in-place write        |
//! | `Dynamic`   | N (in-flight) | writes current slot, others refresh lazily |
//! | `Immediate` | N (in-flight) | writes current slot only                   |
//!
//! `Dynamic` keeps a retained CPU copy of the buffer's full contents while
//! any slot is stale (a write shorter than the buffer is completed by
//! reading the just-written slot back); [`Buffer::raw_current`] refreshes
//! the active slot from it before handing the handle out, and drops the
//! copy once every slot is fresh. A second write before a stale slot
//! becomes current simply replaces the retained copy, so the slot is
//! refreshed with the newest data.
//!
//! Writes past the end grow the buffer. Growing preserves the bytes already
//! written (via backend read-back) and retires the old allocations on the
//! current frame slot. Growing an `Immutable` buffer is a policy violation
//! and panics.

use std::sync::{Arc, Weak};

use bytemuck::Pod;

use crate::backend::BufferId;
use crate::deferred::DeferredResource;
use crate::device::GpuDevice;
use crate::error::GraphicsError;

/// What the buffer binds as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
    Staging,
}

/// Update policy, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Single allocation, written exactly once.
    Immutable,
    /// Single allocation; every write stops the device first.
    Static,
    /// One allocation per in-flight slot; stale slots refresh lazily from a
    /// retained CPU copy.
    Dynamic,
    /// One allocation per in-flight slot; writes touch the current slot
    /// only, other slots keep whatever they held.
    Immediate,
}

struct Allocation {
    id: BufferId,
    outdated: bool,
}

pub struct Buffer {
    device: Weak<GpuDevice>,
    name: String,
    usage: BufferUsage,
    policy: BufferPolicy,
    stride: u64,
    element_count: u64,
    allocations: Vec<Allocation>,
    retained: Option<Vec<u8>>,
    written: bool,
}

impl Buffer {
    /// Allocate a buffer of `element_count` elements of `stride` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `stride` or `element_count` is zero.
    pub fn new(
        device: &Arc<GpuDevice>,
        name: impl Into<String>,
        usage: BufferUsage,
        policy: BufferPolicy,
        stride: u64,
        element_count: u64,
    ) -> Result<Self, GraphicsError> {
        assert!(stride > 0, "buffer stride cannot be zero");
        assert!(element_count > 0, "buffer element count cannot be zero");

        let name = name.into();
        let allocation_count = match policy {
            BufferPolicy::Immutable | BufferPolicy::Static => 1,
            BufferPolicy::Dynamic | BufferPolicy::Immediate => device.image_count(),
        };
        let size = stride * element_count;
        let mut allocations = Vec::with_capacity(allocation_count);
        for index in 0..allocation_count {
            let id = device
                .backend()
                .create_buffer(size, usage, &format!("{name}[{index}]"))?;
            allocations.push(Allocation {
                id,
                outdated: false,
            });
        }
        log::trace!(
            "Buffer: created '{name}' ({policy:?}, {allocation_count} x {size} bytes)"
        );

        Ok(Self {
            device: Arc::downgrade(device),
            name,
            usage,
            policy,
            stride,
            element_count,
            allocations,
            retained: None,
            written: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.stride * self.element_count
    }

    fn device(&self) -> Arc<GpuDevice> {
        match self.device.upgrade() {
            Some(device) => device,
            None => panic!("buffer '{}' outlived its device", self.name),
        }
    }

    /// Write raw bytes at a byte offset.
    ///
    /// A write ending past the current size grows the buffer first, except
    /// for `Immutable` buffers.
    ///
    /// # Panics
    ///
    /// Panics on policy violations: a second write to an `Immutable`
    /// buffer, a write that would grow an `Immutable` buffer, or a nonzero
    /// offset on a `Dynamic` buffer.
    pub fn set_data(&mut self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        if data.is_empty() {
            return Ok(());
        }
        let device = self.device();
        let end = offset + data.len() as u64;

        match self.policy {
            BufferPolicy::Immutable => {
                assert!(
                    !self.written,
                    "immutable buffer '{}' written twice",
                    self.name
                );
                assert!(
                    end <= self.size_bytes(),
                    "write past the end of immutable buffer '{}'",
                    self.name
                );
                device.backend().write_buffer(self.allocations[0].id, offset, data);
            }
            BufferPolicy::Static => {
                if end > self.size_bytes() {
                    self.grow(&device, end.div_ceil(self.stride))?;
                }
                // In-place update of an allocation the GPU may be reading.
                device.wait_idle();
                device.backend().write_buffer(self.allocations[0].id, offset, data);
            }
            BufferPolicy::Dynamic => {
                assert_eq!(
                    offset, 0,
                    "dynamic buffer '{}' only accepts whole writes",
                    self.name
                );
                if end > self.size_bytes() {
                    self.grow(&device, end.div_ceil(self.stride))?;
                }
                let slot = device.current_image();
                device.backend().write_buffer(self.allocations[slot].id, 0, data);
                for (index, allocation) in self.allocations.iter_mut().enumerate() {
                    allocation.outdated = index != slot;
                }
                if self.allocations.len() > 1 {
                    // Stale slots refresh with the full contents. A short
                    // write is completed from the slot it just landed in, so
                    // slot tails cannot diverge.
                    let full = if data.len() as u64 == self.size_bytes() {
                        data.to_vec()
                    } else {
                        device.backend().read_buffer(
                            self.allocations[slot].id,
                            0,
                            self.size_bytes(),
                        )
                    };
                    self.retained = Some(full);
                }
            }
            BufferPolicy::Immediate => {
                if end > self.size_bytes() {
                    self.grow(&device, end.div_ceil(self.stride))?;
                }
                let slot = device.current_image();
                device.backend().write_buffer(self.allocations[slot].id, offset, data);
            }
        }
        self.written = true;
        Ok(())
    }

    /// Write a typed slice at an element offset.
    pub fn set_typed<T: Pod>(
        &mut self,
        element_offset: u64,
        data: &[T],
    ) -> Result<(), GraphicsError> {
        debug_assert_eq!(std::mem::size_of::<T>() as u64, self.stride);
        self.set_data(element_offset * self.stride, bytemuck::cast_slice(data))
    }

    /// The allocation to bind for the current frame.
    ///
    /// For `Dynamic` buffers this is also the refresh point: a stale
    /// current slot is rewritten from the retained copy before its handle
    /// is returned, and the copy is released once no slot is stale.
    pub fn raw_current(&mut self) -> BufferId {
        let device = self.device();
        match self.policy {
            BufferPolicy::Immutable | BufferPolicy::Static => self.allocations[0].id,
            BufferPolicy::Immediate => self.allocations[device.current_image()].id,
            BufferPolicy::Dynamic => {
                let slot = device.current_image();
                if self.allocations[slot].outdated {
                    if let Some(bytes) = &self.retained {
                        device.backend().write_buffer(self.allocations[slot].id, 0, bytes);
                    }
                    self.allocations[slot].outdated = false;
                }
                if self.allocations.iter().all(|a| !a.outdated) {
                    self.retained = None;
                }
                self.allocations[slot].id
            }
        }
    }

    pub(crate) fn raw_slot(&self, slot: usize) -> BufferId {
        self.allocations[slot].id
    }

    /// Resize to `new_element_count` elements. A no-op when the count is
    /// unchanged; growth preserves the bytes already written.
    ///
    /// # Panics
    ///
    /// Panics on policy violations: shrinking, or resizing an `Immutable`
    /// buffer.
    pub fn resize(&mut self, new_element_count: u64) -> Result<(), GraphicsError> {
        if new_element_count == self.element_count {
            return Ok(());
        }
        assert!(
            self.policy != BufferPolicy::Immutable,
            "immutable buffer '{}' cannot be resized",
            self.name
        );
        assert!(
            new_element_count > self.element_count,
            "buffer '{}' cannot shrink below its live contents",
            self.name
        );
        let device = self.device();
        self.grow(&device, new_element_count)
    }

    fn grow(&mut self, device: &Arc<GpuDevice>, new_element_count: u64) -> Result<(), GraphicsError> {
        debug_assert!(new_element_count > self.element_count);
        let old_size = self.size_bytes();
        let new_size = self.stride * new_element_count;
        log::trace!(
            "Buffer: growing '{}' from {old_size} to {new_size} bytes",
            self.name
        );

        match self.policy {
            BufferPolicy::Immutable => unreachable!("immutable buffers never grow"),
            BufferPolicy::Static => {
                device.wait_idle();
                let bytes = device.backend().read_buffer(self.allocations[0].id, 0, old_size);
                let id = device
                    .backend()
                    .create_buffer(new_size, self.usage, &self.name)?;
                device.backend().write_buffer(id, 0, &bytes);
                let old = std::mem::replace(
                    &mut self.allocations[0],
                    Allocation {
                        id,
                        outdated: false,
                    },
                );
                device.drop_resource(DeferredResource::Buffer(old.id));
            }
            BufferPolicy::Dynamic => {
                let slot = device.current_image();
                let bytes = device
                    .backend()
                    .read_buffer(self.allocations[slot].id, 0, old_size);
                let mut fresh = Vec::with_capacity(self.allocations.len());
                for index in 0..self.allocations.len() {
                    let id = device.backend().create_buffer(
                        new_size,
                        self.usage,
                        &format!("{}[{index}]", self.name),
                    )?;
                    if index == slot {
                        device.backend().write_buffer(id, 0, &bytes);
                    }
                    fresh.push(Allocation {
                        id,
                        outdated: index != slot,
                    });
                }
                for old in std::mem::replace(&mut self.allocations, fresh) {
                    device.drop_resource(DeferredResource::Buffer(old.id));
                }
                if self.allocations.len() > 1 {
                    // Retain at the new size so refreshes cover the whole
                    // allocation.
                    let mut full = bytes;
                    full.resize(new_size as usize, 0);
                    self.retained = Some(full);
                }
            }
            BufferPolicy::Immediate => {
                let mut fresh = Vec::with_capacity(self.allocations.len());
                for (index, old) in self.allocations.iter().enumerate() {
                    let bytes = device.backend().read_buffer(old.id, 0, old_size);
                    let id = device.backend().create_buffer(
                        new_size,
                        self.usage,
                        &format!("{}[{index}]", self.name),
                    )?;
                    device.backend().write_buffer(id, 0, &bytes);
                    fresh.push(Allocation {
                        id,
                        outdated: false,
                    });
                }
                for old in std::mem::replace(&mut self.allocations, fresh) {
                    device.drop_resource(DeferredResource::Buffer(old.id));
                }
            }
        }
        self.element_count = new_element_count;
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Allocations may still be referenced by in-flight frames; hand
        // them to the deferred queue instead of destroying now.
        if let Some(device) = self.device.upgrade() {
            for allocation in &self.allocations {
                device.drop_resource(DeferredResource::Buffer(allocation.id));
            }
        }
    }
}
