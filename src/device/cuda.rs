//! CUDA device engine.
//!
//! Maps the copy primitive onto cudarc 0.19 driver calls. Copies touching
//! device memory go through the async memcpy family on the caller's stream;
//! host↔host copies (pinned included) stay synchronous memcpys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, result, sys};

use crate::device::ops::DeviceOps;
use crate::error::{Result, StageError};
use crate::types::{Endpoint, EventHandle, MemoryKind, StreamHandle};

/// `DeviceOps` over the CUDA driver API.
///
/// Contexts are created lazily per device ordinal and bound to the calling
/// thread around each operation.
pub struct CudaDevice {
    contexts: Mutex<HashMap<u32, Arc<CudaContext>>>,
}

impl CudaDevice {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

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

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOps for CudaDevice {
    unsafe fn copy(
        &self,
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        len: usize,
        src: *const u8,
        dst: *mut u8,
        stream: StreamHandle,
    ) -> Result<bool> {
        let src_on_device = src_endpoint.kind == MemoryKind::Device;
        let dst_on_device = dst_endpoint.kind == MemoryKind::Device;
        let stream = stream as sys::CUstream;

        match (src_on_device, dst_on_device) {
            (false, false) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(src, dst, len);
                }
                Ok(false)
            }
            (false, true) => {
                self.bind(dst_endpoint.device_id)?;
                let host = unsafe { std::slice::from_raw_parts(src, len) };
                unsafe { result::memcpy_htod_async(dst as sys::CUdeviceptr, host, stream) }
                    .map_err(|e| StageError::device(format!("cuMemcpyHtoDAsync failed: {e}")))?;
                Ok(true)
            }
            (true, false) => {
                self.bind(src_endpoint.device_id)?;
                let host = unsafe { std::slice::from_raw_parts_mut(dst, len) };
                unsafe { result::memcpy_dtoh_async(host, src as sys::CUdeviceptr, stream) }
                    .map_err(|e| StageError::device(format!("cuMemcpyDtoHAsync failed: {e}")))?;
                Ok(true)
            }
            (true, true) => {
                self.bind(dst_endpoint.device_id)?;
                unsafe {
                    result::memcpy_dtod_async(
                        dst as sys::CUdeviceptr,
                        src as sys::CUdeviceptr,
                        len,
                        stream,
                    )
                }
                .map_err(|e| StageError::device(format!("cuMemcpyDtoDAsync failed: {e}")))?;
                Ok(true)
            }
        }
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()> {
        unsafe { result::stream::synchronize(stream as sys::CUstream) }
            .map_err(|e| StageError::device(format!("cuStreamSynchronize failed: {e}")))
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        unsafe { result::event::record(event as sys::CUevent, stream as sys::CUstream) }
            .map_err(|e| StageError::device(format!("cuEventRecord failed: {e}")))
    }

    fn event_synchronize(&self, event: EventHandle) -> Result<()> {
        unsafe { result::event::synchronize(event as sys::CUevent) }
            .map_err(|e| StageError::device(format!("cuEventSynchronize failed: {e}")))
    }
}
