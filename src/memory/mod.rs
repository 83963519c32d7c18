//! Buffer allocation behind the staging core.
//!
//! The core never calls an allocator directly; it goes through the
//! [`MemoryManager`] trait so servers can plug in their own pooling or
//! accounting. [`SystemMemoryManager`] is the built-in implementation and
//! [`PinnedPool`] adds lock-free recycling of pinned staging blocks on top
//! of any manager.

pub mod pool;
pub mod system;

pub use pool::PinnedPool;
pub use system::SystemMemoryManager;

use std::ptr::NonNull;

use crate::error::Result;
use crate::types::{Endpoint, MemoryKind};

/// Allocates and frees raw buffers in a given memory domain.
///
/// Implementations are shared across staging objects and must be
/// thread-safe.
pub trait MemoryManager: Send + Sync {
    /// Allocate `byte_size` bytes in `kind` on device `device_id`
    /// (`device_id` is 0 for host kinds). A zero-size request returns a
    /// valid, freeable pointer.
    fn allocate(&self, kind: MemoryKind, device_id: u32, byte_size: usize) -> Result<NonNull<u8>>;

    /// Release a buffer previously returned by [`MemoryManager::allocate`].
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on this manager with the same
    /// `kind` and `device_id`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, kind: MemoryKind, device_id: u32) -> Result<()>;
}

/// A buffer owned through a [`MemoryManager`], released on drop.
///
/// Staging objects hold these for every pinned block and internally
/// allocated destination buffer, so teardown releases everything exactly
/// once even on error paths. Release failures are logged, not propagated.
pub struct ManagedBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    endpoint: Endpoint,
    manager: &'a dyn MemoryManager,
}

impl<'a> ManagedBuffer<'a> {
    /// Allocate `len` bytes at `endpoint` from `manager`.
    pub fn allocate(
        manager: &'a dyn MemoryManager,
        endpoint: Endpoint,
        len: usize,
    ) -> Result<Self> {
        let ptr = manager.allocate(endpoint.kind, endpoint.device_id, len)?;
        Ok(Self {
            ptr,
            len,
            endpoint,
            manager,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Drop for ManagedBuffer<'_> {
    fn drop(&mut self) {
        if let Err(error) =
            unsafe { self.manager.free(self.ptr, self.endpoint.kind, self.endpoint.device_id) }
        {
            tracing::warn!(
                endpoint = %self.endpoint,
                len = self.len,
                %error,
                "failed to free staging buffer"
            );
        }
    }
}
