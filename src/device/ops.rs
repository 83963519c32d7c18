//! The device copy primitive.
//!
//! Everything the staging core needs from a device runtime is one copy
//! operation plus stream/event synchronization. Stream and event handles
//! travel as raw `u64` so the trait stays independent of any particular
//! runtime's types; host-only engines ignore them.

use crate::error::Result;
use crate::types::{Endpoint, EventHandle, StreamHandle};

/// Copies byte ranges between memory endpoints and resolves the stream they
/// are enqueued on.
///
/// Host↔host copies (including pinned) complete synchronously. Any copy
/// touching device memory is enqueued on `stream`; `copy` reports which case
/// happened so callers can track whether a synchronization point is owed.
pub trait DeviceOps: Send + Sync {
    /// Copy `len` bytes from `src` at `src_endpoint` to `dst` at
    /// `dst_endpoint`. Returns `true` when the copy was enqueued on the
    /// stream rather than completed synchronously.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes at `src_endpoint` and
    /// `dst` valid for writes of `len` bytes at `dst_endpoint`, and both must
    /// remain valid until the copy retires (for an enqueued copy, until the
    /// stream or a covering event has been synchronized). The ranges must not
    /// overlap.
    unsafe fn copy(
        &self,
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        len: usize,
        src: *const u8,
        dst: *mut u8,
        stream: StreamHandle,
    ) -> Result<bool>;

    /// Block until every copy enqueued on `stream` has retired.
    fn stream_synchronize(&self, stream: StreamHandle) -> Result<()>;

    /// Record `event` at the current tail of `stream`.
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;

    /// Block until the work captured by the last record of `event` has
    /// retired.
    fn event_synchronize(&self, event: EventHandle) -> Result<()>;
}
