//! Built-in memory manager.
//!
//! Host kinds come from the global allocator with cache-line alignment.
//! With the `cuda` feature, pinned memory is page-locked through the driver
//! and device memory is allocated on the named ordinal; without it, pinned
//! degrades to ordinary host memory and device requests are a typed error.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, result, sys};

use crate::error::{Result, StageError};
use crate::memory::MemoryManager;
use crate::types::{Endpoint, MemoryKind};

const HOST_ALIGN: usize = 64;

/// The built-in [`MemoryManager`].
#[derive(Default)]
pub struct SystemMemoryManager {
    // Host frees need the original layout back; the driver-side kinds do not.
    layouts: Mutex<HashMap<usize, Layout>>,
    #[cfg(feature = "cuda")]
    contexts: Mutex<HashMap<u32, Arc<CudaContext>>>,
}

impl SystemMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_allocate(&self, endpoint: Endpoint, byte_size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(byte_size.max(1), HOST_ALIGN)
            .map_err(|e| StageError::allocation(endpoint, byte_size, e))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| StageError::allocation(endpoint, byte_size, "allocator returned null"))?;
        self.layouts
            .lock()
            .map_err(|_| StageError::LockPoisoned("host layouts"))?
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn host_free(&self, ptr: NonNull<u8>) -> Result<()> {
        let layout = self
            .layouts
            .lock()
            .map_err(|_| StageError::LockPoisoned("host layouts"))?
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| {
                StageError::device(format!(
                    "free of untracked host pointer {:#x}",
                    ptr.as_ptr() as usize
                ))
            })?;
        unsafe {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn bind(&self, device_id: u32) -> Result<()> {
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| StageError::LockPoisoned("cuda contexts"))?;
        let ctx = match contexts.get(&device_id) {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = CudaContext::new(device_id as usize).map_err(|e| {
                    StageError::device(format!(
                        "failed to create CUDA context for device {device_id}: {e}"
                    ))
                })?;
                contexts.insert(device_id, ctx.clone());
                ctx
            }
        };
        ctx.bind_to_thread()
            .map_err(|e| StageError::device(format!("CUDA bind_to_thread failed: {e}")))
    }
}

impl MemoryManager for SystemMemoryManager {
    fn allocate(&self, kind: MemoryKind, device_id: u32, byte_size: usize) -> Result<NonNull<u8>> {
        let endpoint = Endpoint { kind, device_id };
        match kind {
            MemoryKind::Host => self.host_allocate(endpoint, byte_size),

            #[cfg(not(feature = "cuda"))]
            MemoryKind::HostPinned => self.host_allocate(endpoint, byte_size),

            #[cfg(feature = "cuda")]
            MemoryKind::HostPinned => {
                self.bind(device_id)?;
                let ptr = unsafe {
                    result::malloc_host(
                        byte_size.max(1),
                        sys::CU_MEMHOSTALLOC_PORTABLE,
                    )
                }
                .map_err(|e| StageError::allocation(endpoint, byte_size, e))?;
                NonNull::new(ptr as *mut u8)
                    .ok_or_else(|| StageError::allocation(endpoint, byte_size, "null pinned block"))
            }

            #[cfg(not(feature = "cuda"))]
            MemoryKind::Device => Err(StageError::UnsupportedEndpoint { endpoint }),

            #[cfg(feature = "cuda")]
            MemoryKind::Device => {
                self.bind(device_id)?;
                let dptr = unsafe { result::malloc_sync(byte_size.max(1)) }
                    .map_err(|e| StageError::allocation(endpoint, byte_size, e))?;
                NonNull::new(dptr as *mut u8)
                    .ok_or_else(|| StageError::allocation(endpoint, byte_size, "null device block"))
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, kind: MemoryKind, _device_id: u32) -> Result<()> {
        match kind {
            MemoryKind::Host => self.host_free(ptr),

            #[cfg(not(feature = "cuda"))]
            MemoryKind::HostPinned => self.host_free(ptr),

            #[cfg(feature = "cuda")]
            MemoryKind::HostPinned => {
                self.bind(_device_id)?;
                unsafe { result::free_host(ptr.as_ptr() as *mut std::ffi::c_void) }
                    .map_err(|e| StageError::device(format!("cuMemFreeHost failed: {e}")))
            }

            #[cfg(not(feature = "cuda"))]
            MemoryKind::Device => Err(StageError::UnsupportedEndpoint {
                endpoint: Endpoint {
                    kind,
                    device_id: _device_id,
                },
            }),

            #[cfg(feature = "cuda")]
            MemoryKind::Device => {
                self.bind(_device_id)?;
                unsafe { result::free_sync(ptr.as_ptr() as sys::CUdeviceptr) }
                    .map_err(|e| StageError::device(format!("cuMemFree failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_allocate_free() {
        let manager = SystemMemoryManager::new();
        let ptr = manager.allocate(MemoryKind::Host, 0, 256).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 256);
            manager.free(ptr, MemoryKind::Host, 0).unwrap();
        }
    }

    #[test]
    fn test_zero_size_allocation() {
        let manager = SystemMemoryManager::new();
        let ptr = manager.allocate(MemoryKind::Host, 0, 0).unwrap();
        unsafe {
            manager.free(ptr, MemoryKind::Host, 0).unwrap();
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_pinned_degrades_to_host() {
        let manager = SystemMemoryManager::new();
        let ptr = manager.allocate(MemoryKind::HostPinned, 0, 64).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 1, 64);
            manager.free(ptr, MemoryKind::HostPinned, 0).unwrap();
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_device_rejected_without_cuda() {
        let manager = SystemMemoryManager::new();
        assert!(matches!(
            manager.allocate(MemoryKind::Device, 0, 64),
            Err(StageError::UnsupportedEndpoint { .. })
        ));
    }

    #[test]
    fn test_untracked_free_is_error() {
        let manager = SystemMemoryManager::new();
        let mut local = 0u8;
        let bogus = NonNull::new(&mut local as *mut u8).unwrap();
        assert!(unsafe { manager.free(bogus, MemoryKind::Host, 0) }.is_err());
    }
}
