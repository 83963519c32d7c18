//! Shared pinned-staging policy.
//!
//! Both staging directions use the same machinery: a decision table that says
//! when a transfer should go through an intermediate pinned buffer, a
//! bookkeeping struct for the contiguous run of fragments waiting to share
//! one bulk transfer, and a latch tracking whether the caller must
//! synchronize before observing results.

use crate::device::DeviceOps;
use crate::error::Result;
use crate::types::{EventHandle, MemoryKind, StreamHandle};

/// Whether a transfer from `src` to `dst` should be staged through a pinned
/// host buffer.
///
/// The full decision table over `(src, dst)`:
///
/// | src \ dst  | Host | HostPinned | Device |
/// |------------|------|------------|--------|
/// | Host       | no   | no         | yes    |
/// | HostPinned | no   | no         | no     |
/// | Device     | yes  | no         | no     |
///
/// Pinned memory is already DMA-reachable, so transfers touching it never
/// need another intermediate; device↔device copies stay on the device.
pub const fn needs_staging(src: MemoryKind, dst: MemoryKind) -> bool {
    matches!(
        (src, dst),
        (MemoryKind::Host, MemoryKind::Device) | (MemoryKind::Device, MemoryKind::Host)
    )
}

/// A contiguous span of the logical tensor whose fragments have been grouped
/// to share a single bulk transfer through one pinned buffer.
///
/// Invariant: either the run is empty, or its fragments cover exactly
/// `[start_offset, start_offset + byte_size)` in push order.
#[derive(Debug)]
pub(crate) struct PendingRun<F> {
    byte_size: usize,
    start_offset: usize,
    fragments: Vec<F>,
}

impl<F> Default for PendingRun<F> {
    fn default() -> Self {
        Self {
            byte_size: 0,
            start_offset: 0,
            fragments: Vec::new(),
        }
    }
}

impl<F> PendingRun<F> {
    pub fn is_empty(&self) -> bool {
        self.byte_size == 0
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn end_offset(&self) -> usize {
        self.start_offset + self.byte_size
    }

    /// Whether a fragment at `offset` would extend the run without a gap.
    /// An empty run accepts any offset.
    pub fn is_contiguous_with(&self, offset: usize) -> bool {
        self.is_empty() || offset == self.end_offset()
    }

    /// Append a fragment of `len` bytes at `offset`. The first fragment fixes
    /// the run's start.
    pub fn push(&mut self, offset: usize, len: usize, fragment: F) {
        if self.is_empty() {
            self.start_offset = offset;
        }
        debug_assert_eq!(offset, self.end_offset());
        self.byte_size += len;
        self.fragments.push(fragment);
    }

    pub fn fragments(&self) -> &[F] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<F> {
        self.fragments
    }

    /// Take the run, leaving this one empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Latch over the outstanding-async-copy state of one staging object, plus
/// the stream and optional event used to resolve it.
///
/// The latch only moves one way during processing: once a copy has used the
/// stream, the caller must synchronize before observing results. Only
/// [`SyncGate::synchronize`] clears it.
#[derive(Debug)]
pub(crate) struct SyncGate {
    stream: StreamHandle,
    event: Option<EventHandle>,
    need_sync: bool,
}

impl SyncGate {
    pub fn new(stream: StreamHandle) -> Self {
        Self {
            stream,
            event: None,
            need_sync: false,
        }
    }

    pub fn set_event(&mut self, event: EventHandle) {
        self.event = Some(event);
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn is_latched(&self) -> bool {
        self.need_sync
    }

    pub fn latch(&mut self, used_stream: bool) {
        self.need_sync |= used_stream;
    }

    /// Record the event on the stream when async work is outstanding and an
    /// event is configured.
    pub fn record(&self, device: &dyn DeviceOps) -> Result<()> {
        if self.need_sync
            && let Some(event) = self.event
        {
            device.event_record(event, self.stream)?;
        }
        Ok(())
    }

    /// Wait for outstanding copies, preferring the event when configured,
    /// and clear the latch.
    pub fn synchronize(&mut self, device: &dyn DeviceOps) -> Result<()> {
        match self.event {
            Some(event) => device.event_synchronize(event)?,
            None => device.stream_synchronize(self.stream)?,
        }
        self.need_sync = false;
        Ok(())
    }
}
