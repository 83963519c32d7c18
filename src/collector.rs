//! Gathers the per-request fragments of a named input tensor into one
//! contiguous destination buffer.
//!
//! One collector is scoped to a single batch invocation. Fragments whose
//! endpoint sits on the wrong side of a host/device boundary are grouped
//! into contiguous pending runs and staged through a single pinned block per
//! run, so a batch of many small host buffers costs one bulk transfer
//! instead of one transfer per request. Failures stay per-request: the
//! offending response slot is failed and taken, and the rest of the batch
//! proceeds.

use crate::batch::{BatchRequest, MemoryChunk, RequestInput, ResponseSlots, fail_and_take};
use crate::device::DeviceOps;
use crate::error::{Result, StageError};
use crate::memory::{ManagedBuffer, MemoryManager};
use crate::staging::{PendingRun, SyncGate, needs_staging};
use crate::types::{Endpoint, EventHandle, StreamHandle};

/// A source fragment waiting to share a pinned staging block.
#[derive(Clone, Copy)]
struct PendingInput {
    slot: usize,
    chunk: MemoryChunk,
}

/// A pinned block whose bulk copy into the destination tensor waits for the
/// in-flight fragment copies to retire at the synchronization point.
struct DeferredInput {
    name: String,
    pinned: *mut u8,
    byte_size: usize,
    tensor: *mut u8,
    tensor_offset: usize,
    tensor_endpoint: Endpoint,
    slots: Vec<usize>,
}

/// Assembles batched input tensors from request fragments.
///
/// Not thread-safe: one collector belongs to one backend-instance
/// invocation. All asynchronous copies go to the single stream given at
/// construction, so they retire in program order.
pub struct InputCollector<'a, R> {
    requests: &'a [R],
    responses: &'a mut ResponseSlots,
    memory: &'a dyn MemoryManager,
    device: &'a dyn DeviceOps,
    pinned_enabled: bool,
    gate: SyncGate,
    pending: PendingRun<PendingInput>,
    deferred: Vec<DeferredInput>,
    // Pinned blocks stay alive until drop: the stream may still be reading
    // them after finalize returns true.
    pinned: Vec<ManagedBuffer<'a>>,
    owned: Vec<ManagedBuffer<'a>>,
}

impl<'a, R: BatchRequest> InputCollector<'a, R> {
    /// Build a collector over one batch. `responses` must align positionally
    /// with `requests`.
    pub fn new(
        requests: &'a [R],
        responses: &'a mut ResponseSlots,
        memory: &'a dyn MemoryManager,
        device: &'a dyn DeviceOps,
        pinned_enabled: bool,
        stream: StreamHandle,
    ) -> Result<Self> {
        if requests.is_empty() {
            return Err(StageError::EmptyBatch);
        }
        if responses.len() != requests.len() {
            return Err(StageError::BatchMismatch {
                request_count: requests.len(),
                response_count: responses.len(),
            });
        }
        Ok(Self {
            requests,
            responses,
            memory,
            device,
            pinned_enabled,
            gate: SyncGate::new(stream),
            pending: PendingRun::default(),
            deferred: Vec::new(),
            pinned: Vec::new(),
            owned: Vec::new(),
        })
    }

    /// Use `event` for finalize-time synchronization instead of the stream.
    pub fn with_event(mut self, event: EventHandle) -> Self {
        self.gate.set_event(event);
        self
    }

    /// Gather the named input across all requests into `buffer`, each
    /// request's bytes at the running offset in request order.
    ///
    /// Per-request failures (missing input, copy errors) fail that response
    /// slot and continue; a destination smaller than the gathered bytes is a
    /// top-level error.
    ///
    /// # Safety
    /// `buffer` must be valid for writes of `buffer_len` bytes at `endpoint`,
    /// and every request chunk valid for reads, until [`finalize`] has
    /// returned and any synchronization it reports has completed.
    ///
    /// [`finalize`]: InputCollector::finalize
    pub unsafe fn process_tensor(
        &mut self,
        name: &str,
        buffer: *mut u8,
        buffer_len: usize,
        endpoint: Endpoint,
    ) -> Result<()> {
        let requests = self.requests;
        let mut offset = 0usize;

        for (index, request) in requests.iter().enumerate() {
            let Some(input) = request.input(name) else {
                fail_and_take(
                    self.responses,
                    index,
                    StageError::MissingInput { name: name.into() },
                );
                continue;
            };
            let input_len = input.byte_size();
            if offset + input_len > buffer_len {
                return Err(StageError::DestinationTooSmall {
                    name: name.into(),
                    required: offset + input_len,
                    capacity: buffer_len,
                });
            }
            let used = unsafe { self.stage_input(name, index, input, offset, buffer, endpoint)? };
            self.gate.latch(used);
            offset += input_len;
        }

        let used = unsafe { self.flush_pending(name, buffer, endpoint)? };
        self.gate.latch(used);
        self.gate.record(self.device)?;
        Ok(())
    }

    /// Gather the named input, avoiding the copy when it is already one
    /// contiguous run in one of the `allowed` endpoints.
    ///
    /// With `buffer` given, the gather lands there (its endpoint is
    /// `allowed[0]`). Without it, a contiguous input in an allowed endpoint
    /// is returned zero-copy — that pointer borrows from the request and is
    /// valid for as long as the caller keeps the requests alive. Otherwise a
    /// buffer is allocated from the first allowed endpoint that accepts it
    /// and owned by this collector.
    ///
    /// Returns the gathered buffer, its byte size, and its endpoint.
    ///
    /// # Safety
    /// As for [`process_tensor`](InputCollector::process_tensor); a provided
    /// `buffer` must be valid for writes of its stated length.
    pub unsafe fn process_tensor_flexible(
        &mut self,
        name: &str,
        buffer: Option<(*mut u8, usize)>,
        allowed: &[Endpoint],
    ) -> Result<(*const u8, usize, Endpoint)> {
        if allowed.is_empty() {
            return Err(StageError::NoAllowedEndpoints { name: name.into() });
        }

        let probe = self.probe_contiguous(name)?;
        if buffer.is_none()
            && let Some((ptr, endpoint)) = probe.run
            && allowed.contains(&endpoint)
        {
            return Ok((ptr, probe.total, endpoint));
        }

        let (dst, dst_len, dst_endpoint) = match buffer {
            Some((ptr, len)) => (ptr, len, allowed[0]),
            None => {
                let (ptr, endpoint) = self.allocate_owned(name, probe.total, allowed)?;
                (ptr, probe.total, endpoint)
            }
        };
        unsafe {
            self.process_tensor(name, dst, dst_len, dst_endpoint)?;
        }
        Ok((dst as *const u8, probe.total, dst_endpoint))
    }

    /// Complete all outstanding staged work.
    ///
    /// When deferred pinned blocks exist, waits once on the event (if
    /// configured) or the stream, then issues the deferred bulk copies.
    /// Returns whether the caller must still synchronize before reading the
    /// destination buffers.
    pub fn finalize(&mut self) -> Result<bool> {
        if !self.deferred.is_empty() && self.gate.is_latched() {
            self.gate.synchronize(self.device)?;
        }

        // The fragment copies feeding each deferred block have retired; the
        // bulk pinned->tensor copies can go out now.
        let had_deferred = !self.deferred.is_empty();
        for deferred in std::mem::take(&mut self.deferred) {
            let result = unsafe {
                self.device.copy(
                    Endpoint::host_pinned(),
                    deferred.tensor_endpoint,
                    deferred.byte_size,
                    deferred.pinned,
                    deferred.tensor.add(deferred.tensor_offset),
                    self.gate.stream(),
                )
            };
            match result {
                Ok(used) => self.gate.latch(used),
                Err(error) => {
                    let error = StageError::copy_failed(
                        &deferred.name,
                        Endpoint::host_pinned(),
                        deferred.tensor_endpoint,
                        error,
                    );
                    for slot in deferred.slots {
                        fail_and_take(self.responses, slot, error.clone());
                    }
                }
            }
        }

        if had_deferred {
            self.gate.record(self.device)?;
        }
        Ok(self.gate.is_latched())
    }

    /// Place one request's input, chunk by chunk. Returns whether any copy
    /// used the stream.
    unsafe fn stage_input(
        &mut self,
        name: &str,
        slot: usize,
        input: &dyn RequestInput,
        tensor_offset: usize,
        tensor: *mut u8,
        tensor_endpoint: Endpoint,
    ) -> Result<bool> {
        let mut used_stream = false;
        let mut input_offset = 0usize;

        for chunk_index in 0..input.chunk_count() {
            let chunk = input.chunk(chunk_index);
            let chunk_offset = tensor_offset + input_offset;

            if self.pinned_enabled && needs_staging(chunk.endpoint.kind, tensor_endpoint.kind) {
                if !self.pending.is_contiguous_with(chunk_offset) {
                    used_stream |= unsafe { self.flush_pending(name, tensor, tensor_endpoint)? };
                }
                self.pending
                    .push(chunk_offset, chunk.len, PendingInput { slot, chunk });
            } else {
                // A direct chunk ends any run in progress: nothing after it
                // can extend the run contiguously.
                used_stream |= unsafe { self.flush_pending(name, tensor, tensor_endpoint)? };
                let result = unsafe {
                    self.device.copy(
                        chunk.endpoint,
                        tensor_endpoint,
                        chunk.len,
                        chunk.ptr,
                        tensor.add(chunk_offset),
                        self.gate.stream(),
                    )
                };
                match result {
                    Ok(used) => used_stream |= used,
                    Err(error) => fail_and_take(
                        self.responses,
                        slot,
                        StageError::copy_failed(name, chunk.endpoint, tensor_endpoint, error),
                    ),
                }
            }
            input_offset += chunk.len;
        }

        Ok(used_stream)
    }

    /// Flush the pending pinned run against the destination tensor.
    unsafe fn flush_pending(
        &mut self,
        name: &str,
        tensor: *mut u8,
        tensor_endpoint: Endpoint,
    ) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let run = self.pending.take();
        let mut used_stream = false;

        match ManagedBuffer::allocate(self.memory, Endpoint::host_pinned(), run.byte_size()) {
            Err(error) => {
                // Losing the staging buffer forfeits the optimization, not
                // the requests: copy each fragment straight to the tensor.
                tracing::debug!(
                    tensor = name,
                    byte_size = run.byte_size(),
                    %error,
                    "pinned staging unavailable, copying fragments directly"
                );
                let mut offset = run.start_offset();
                for fragment in run.fragments() {
                    let result = unsafe {
                        self.device.copy(
                            fragment.chunk.endpoint,
                            tensor_endpoint,
                            fragment.chunk.len,
                            fragment.chunk.ptr,
                            tensor.add(offset),
                            self.gate.stream(),
                        )
                    };
                    match result {
                        Ok(used) => used_stream |= used,
                        Err(error) => fail_and_take(
                            self.responses,
                            fragment.slot,
                            StageError::copy_failed(
                                name,
                                fragment.chunk.endpoint,
                                tensor_endpoint,
                                error,
                            ),
                        ),
                    }
                    offset += fragment.chunk.len;
                }
            }
            Ok(pinned) => {
                let pinned_ptr = pinned.as_ptr();
                let mut fragments_used_stream = false;
                let mut offset = 0usize;
                for fragment in run.fragments() {
                    let result = unsafe {
                        self.device.copy(
                            fragment.chunk.endpoint,
                            Endpoint::host_pinned(),
                            fragment.chunk.len,
                            fragment.chunk.ptr,
                            pinned_ptr.add(offset),
                            self.gate.stream(),
                        )
                    };
                    match result {
                        Ok(used) => fragments_used_stream |= used,
                        Err(error) => fail_and_take(
                            self.responses,
                            fragment.slot,
                            StageError::copy_failed(
                                name,
                                fragment.chunk.endpoint,
                                Endpoint::host_pinned(),
                                error,
                            ),
                        ),
                    }
                    offset += fragment.chunk.len;
                }
                used_stream |= fragments_used_stream;

                if !fragments_used_stream {
                    // The pinned block already holds the bytes; one bulk copy
                    // moves the whole run.
                    let result = unsafe {
                        self.device.copy(
                            Endpoint::host_pinned(),
                            tensor_endpoint,
                            run.byte_size(),
                            pinned_ptr,
                            tensor.add(run.start_offset()),
                            self.gate.stream(),
                        )
                    };
                    match result {
                        Ok(used) => used_stream |= used,
                        Err(error) => {
                            let error = StageError::copy_failed(
                                name,
                                Endpoint::host_pinned(),
                                tensor_endpoint,
                                error,
                            );
                            for fragment in run.fragments() {
                                fail_and_take(self.responses, fragment.slot, error.clone());
                            }
                        }
                    }
                } else {
                    // Fragment copies are still in flight; the bulk copy has
                    // to wait for the synchronization point in finalize.
                    self.deferred.push(DeferredInput {
                        name: name.into(),
                        pinned: pinned_ptr,
                        byte_size: run.byte_size(),
                        tensor,
                        tensor_offset: run.start_offset(),
                        tensor_endpoint,
                        slots: run.fragments().iter().map(|f| f.slot).collect(),
                    });
                }
                self.pinned.push(pinned);
            }
        }

        Ok(used_stream)
    }

    /// Whether the whole input is one contiguous run in a single endpoint,
    /// plus its total byte size.
    fn probe_contiguous(&self, name: &str) -> Result<ContiguityProbe> {
        let mut total = 0usize;
        let mut run: Option<(*const u8, Endpoint)> = None;
        let mut next_addr = 0usize;
        let mut contiguous = true;

        for request in self.requests {
            let input = request
                .input(name)
                .ok_or_else(|| StageError::MissingInput { name: name.into() })?;
            for chunk_index in 0..input.chunk_count() {
                let chunk = input.chunk(chunk_index);
                match run {
                    None => run = Some((chunk.ptr, chunk.endpoint)),
                    Some((_, endpoint)) => {
                        if chunk.ptr as usize != next_addr || chunk.endpoint != endpoint {
                            contiguous = false;
                        }
                    }
                }
                next_addr = chunk.ptr as usize + chunk.len;
                total += chunk.len;
            }
        }

        Ok(ContiguityProbe {
            total,
            run: if contiguous { run } else { None },
        })
    }

    /// Allocate a destination from the first endpoint in `allowed` that
    /// accepts the request; the buffer lives as long as this collector.
    fn allocate_owned(
        &mut self,
        name: &str,
        byte_size: usize,
        allowed: &[Endpoint],
    ) -> Result<(*mut u8, Endpoint)> {
        let mut last_error = None;
        for &endpoint in allowed {
            match ManagedBuffer::allocate(self.memory, endpoint, byte_size) {
                Ok(buffer) => {
                    let ptr = buffer.as_ptr();
                    self.owned.push(buffer);
                    return Ok((ptr, endpoint));
                }
                Err(error) => {
                    tracing::debug!(
                        tensor = name,
                        %endpoint,
                        %error,
                        "input buffer allocation fell back to next allowed endpoint"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(StageError::NoAllowedEndpoints { name: name.into() }))
    }
}

struct ContiguityProbe {
    total: usize,
    run: Option<(*const u8, Endpoint)>,
}
