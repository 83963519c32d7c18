use crate::types::Endpoint;

pub type Result<T> = std::result::Result<T, StageError>;

/// Errors raised while staging batched tensors.
///
/// `Clone` is deliberate: a failed bulk staging copy fans the same error out
/// to every response slot that contributed to the flush.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("input '{name}' not found in request")]
    MissingInput { name: String },

    #[error("destination for '{name}' too small: need {required} bytes, have {capacity}")]
    DestinationTooSmall {
        name: String,
        required: usize,
        capacity: usize,
    },

    #[error("invalid shape {dims:?} for '{name}'")]
    InvalidShape { name: String, dims: Vec<i64> },

    #[error("batch of {request_count} requests does not match {response_count} response slots")]
    BatchMismatch {
        request_count: usize,
        response_count: usize,
    },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("no allowed endpoints given for '{name}'")]
    NoAllowedEndpoints { name: String },

    #[error("allocation of {byte_size} bytes in {endpoint} failed: {reason}")]
    AllocationFailed {
        endpoint: Endpoint,
        byte_size: usize,
        reason: String,
    },

    #[error("copy for '{name}' ({src} -> {dst}) failed: {reason}")]
    CopyFailed {
        name: String,
        src: Endpoint,
        dst: Endpoint,
        reason: String,
    },

    #[error("output buffer for '{name}' could not be created: {reason}")]
    OutputBuffer { name: String, reason: String },

    #[error("endpoint {endpoint} is not usable in a host-only build")]
    UnsupportedEndpoint { endpoint: Endpoint },

    #[error("device error: {0}")]
    Device(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl StageError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an `AllocationFailed` error from a failed underlying allocation.
    pub fn allocation(
        endpoint: Endpoint,
        byte_size: usize,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::AllocationFailed {
            endpoint,
            byte_size,
            reason: source.to_string(),
        }
    }

    /// Create a `CopyFailed` error carrying the tensor name and both endpoints.
    pub fn copy_failed(
        name: impl Into<String>,
        src: Endpoint,
        dst: Endpoint,
        source: impl std::fmt::Display,
    ) -> Self {
        Self::CopyFailed {
            name: name.into(),
            src,
            dst,
            reason: source.to_string(),
        }
    }
}
