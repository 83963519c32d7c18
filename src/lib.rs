pub mod batch;
pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod memory;
pub mod responder;
pub mod staging;
pub mod types;

pub use batch::{BatchRequest, BatchResponse, MemoryChunk, RequestInput, ResponseSlots, fail_and_take};
pub use collector::InputCollector;
pub use config::StagingOptions;
#[cfg(feature = "cuda")]
pub use device::CudaDevice;
pub use device::{CpuDevice, DeviceOps};
pub use error::{Result, StageError};
pub use memory::{ManagedBuffer, MemoryManager, PinnedPool, SystemMemoryManager};
pub use responder::OutputResponder;
pub use staging::needs_staging;
pub use types::{
    byte_size, DataType, Endpoint, EventHandle, MemoryKind, StreamHandle,
};
