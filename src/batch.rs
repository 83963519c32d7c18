//! Request and response carriers at the batch boundary.
//!
//! The staging core never owns requests or responses; it works against these
//! traits so any server frontend can plug in. Requests expose their input
//! tensors as ordered sequences of typed memory chunks; responses allocate
//! output buffers on demand and are completed exactly once.

use crate::error::{Result, StageError};
use crate::types::{DataType, Endpoint};

/// One typed byte range of an input tensor.
///
/// The pointer is borrowed from the owning request: it must stay valid for
/// `len` bytes at `endpoint` for the duration of the batch invocation.
#[derive(Debug, Clone, Copy)]
pub struct MemoryChunk {
    pub ptr: *const u8,
    pub len: usize,
    pub endpoint: Endpoint,
}

/// A named input tensor of one request.
pub trait RequestInput {
    fn datatype(&self) -> DataType;

    fn shape(&self) -> &[i64];

    fn chunk_count(&self) -> usize;

    /// The `index`-th memory chunk. Chunks concatenate, in index order, to
    /// the tensor's full byte content.
    fn chunk(&self, index: usize) -> MemoryChunk;

    /// Total bytes across all chunks.
    fn byte_size(&self) -> usize {
        (0..self.chunk_count()).map(|i| self.chunk(i).len).sum()
    }
}

/// One request of a batch.
pub trait BatchRequest {
    fn input_count(&self) -> usize;

    fn input_name(&self, index: usize) -> Option<&str>;

    fn input(&self, name: &str) -> Option<&dyn RequestInput>;

    /// Number of outputs this request asked for.
    fn output_count(&self) -> usize;

    fn output_name(&self, index: usize) -> Option<&str>;
}

/// The response being built for one request.
pub trait BatchResponse {
    /// Create the named output tensor on this response and allocate its
    /// buffer.
    ///
    /// `endpoint` carries the caller's preferred placement in and the actual
    /// placement out: the response may override it (for example a client that
    /// can only receive host memory). The returned pointer is owned by the
    /// response and must stay valid for `byte_size` bytes until the response
    /// is sent or dropped.
    fn output_buffer(
        &mut self,
        name: &str,
        datatype: DataType,
        shape: &[i64],
        byte_size: usize,
        endpoint: &mut Endpoint,
    ) -> Result<*mut u8>;

    /// Complete the response. Called exactly once; `error` carries the final
    /// failure when the request could not be served.
    fn send(self: Box<Self>, error: Option<StageError>);
}

/// Positionally aligned response slots for a batch.
///
/// A slot is set to `None` once its response has been failed and completed;
/// all later staging work skips empty slots.
pub type ResponseSlots = Vec<Option<Box<dyn BatchResponse>>>;

/// Fail a response in place: take the slot, send the final error, leave the
/// slot empty. A no-op when the slot has already been taken.
pub fn fail_and_take(slots: &mut ResponseSlots, index: usize, error: StageError) {
    if let Some(slot) = slots.get_mut(index)
        && let Some(response) = slot.take()
    {
        response.send(Some(error));
    }
}
