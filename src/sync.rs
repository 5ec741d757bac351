//! CPU-GPU synchronization primitives.
//!
//! [`Fence`] is a CPU-waitable completion flag attached to a submission;
//! [`Semaphore`] marks GPU-GPU ordering between passes. Backends signal
//! fences when the associated work completes; the frame driver waits on the
//! fence of a slot before reusing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct FenceState {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

/// A CPU-waitable fence.
///
/// Clones share the same underlying state, so a fence can be handed to a
/// submission and waited on elsewhere.
#[derive(Clone)]
pub struct Fence {
    state: Arc<FenceState>,
}

impl Fence {
    /// Create a new fence in the unsignaled state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(FenceState {
                signaled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal the fence, waking all waiters.
    pub fn signal(&self) {
        let mut signaled = self.state.signaled.lock();
        *signaled = true;
        self.state.condvar.notify_all();
    }

    /// Reset the fence to the unsignaled state.
    pub fn reset(&self) {
        *self.state.signaled.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.signaled.lock()
    }

    /// Block until the fence is signaled.
    pub fn wait(&self) {
        let mut signaled = self.state.signaled.lock();
        while !*signaled {
            self.state.condvar.wait(&mut signaled);
        }
    }

    /// Block until the fence is signaled or the timeout elapses. Returns
    /// `true` if the fence was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.signaled.lock();
        if *signaled {
            return true;
        }
        self.state.condvar.wait_for(&mut signaled, timeout);
        *signaled
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU-GPU ordering marker with a process-unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Semaphore {
    id: u64,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);
