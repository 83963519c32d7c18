use crate::device::ops::DeviceOps;
use crate::error::{Result, StageError};
use crate::types::{Endpoint, EventHandle, MemoryKind, StreamHandle};

/// `DeviceOps` for builds without device support.
///
/// Both host domains are plain addressable memory here (without a device
/// runtime there is nothing to pin against), so every copy is a synchronous
/// memcpy. Device endpoints are rejected; stream and event operations are
/// no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceOps for CpuDevice {
    unsafe fn copy(
        &self,
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        len: usize,
        src: *const u8,
        dst: *mut u8,
        _stream: StreamHandle,
    ) -> Result<bool> {
        for endpoint in [src_endpoint, dst_endpoint] {
            if endpoint.kind == MemoryKind::Device {
                return Err(StageError::UnsupportedEndpoint { endpoint });
            }
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src, dst, len);
        }
        Ok(false)
    }

    fn stream_synchronize(&self, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn event_record(&self, _event: EventHandle, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn event_synchronize(&self, _event: EventHandle) -> Result<()> {
        Ok(())
    }
}
