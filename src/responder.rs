//! Scatters a contiguous batched output tensor back into per-response
//! buffers.
//!
//! The mirror of the collector: one source buffer holds the named output for
//! the whole batch, and each response that asked for the output receives its
//! slice in a buffer the response itself allocates (and may place in a
//! different memory domain than requested). Slices bound for the wrong side
//! of a host/device boundary are staged through one pinned block per
//! contiguous run; when the bulk copy into the pinned block is asynchronous,
//! the per-response fan-out waits for the synchronization point in
//! [`OutputResponder::finalize`].

use crate::batch::{BatchRequest, ResponseSlots, fail_and_take};
use crate::device::DeviceOps;
use crate::error::{Result, StageError};
use crate::memory::{ManagedBuffer, MemoryManager};
use crate::staging::{PendingRun, SyncGate, needs_staging};
use crate::types::{DataType, Endpoint, EventHandle, StreamHandle, byte_size};

/// One response's slice of the output tensor.
struct OutputData {
    name: String,
    buffer: *mut u8,
    byte_size: usize,
    endpoint: Endpoint,
}

/// A response buffer waiting to be fed from a pinned staging block.
struct PendingOutput {
    slot: usize,
    output: OutputData,
}

/// A pinned block whose per-response fan-out copies wait for the bulk
/// tensor->pinned copy to retire.
struct DeferredOutputs {
    pinned: *mut u8,
    byte_size: usize,
    fragments: Vec<PendingOutput>,
}

/// Scatters batched output tensors into per-request responses.
///
/// Not thread-safe: one responder belongs to one backend-instance
/// invocation, and all asynchronous copies go to the single stream given at
/// construction.
pub struct OutputResponder<'a, R> {
    requests: &'a [R],
    responses: &'a mut ResponseSlots,
    max_batch_size: usize,
    memory: &'a dyn MemoryManager,
    device: &'a dyn DeviceOps,
    pinned_enabled: bool,
    gate: SyncGate,
    pending: PendingRun<PendingOutput>,
    deferred: Vec<DeferredOutputs>,
    // Pinned blocks stay alive until drop; deferred fan-outs read them after
    // the synchronization point.
    pinned: Vec<ManagedBuffer<'a>>,
}

impl<'a, R: BatchRequest> OutputResponder<'a, R> {
    /// Build a responder over one batch. `max_batch_size` is the model's
    /// limit: when positive, each response's first output dimension comes
    /// from the first dimension of that request's first input.
    pub fn new(
        requests: &'a [R],
        responses: &'a mut ResponseSlots,
        max_batch_size: usize,
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
            max_batch_size,
            memory,
            device,
            pinned_enabled,
            gate: SyncGate::new(stream),
            pending: PendingRun::default(),
            deferred: Vec::new(),
            pinned: Vec::new(),
        })
    }

    /// Use `event` for finalize-time synchronization instead of the stream.
    pub fn with_event(mut self, event: EventHandle) -> Self {
        self.gate.set_event(event);
        self
    }

    /// Scatter the named output tensor: each response that requested
    /// `name` receives its slice of `buffer` in a freshly allocated output
    /// buffer. Slices of requests that did not ask for the output are still
    /// consumed from the source.
    ///
    /// # Safety
    /// `buffer` must be valid for reads of the summed per-response byte
    /// sizes at `endpoint` until [`finalize`] has returned and any
    /// synchronization it reports has completed.
    ///
    /// [`finalize`]: OutputResponder::finalize
    pub unsafe fn process_tensor(
        &mut self,
        name: &str,
        datatype: DataType,
        batchn_shape: &[i64],
        buffer: *const u8,
        endpoint: Endpoint,
    ) -> Result<()> {
        let requests = self.requests;
        if self.max_batch_size > 0 && batchn_shape.is_empty() {
            return Err(StageError::InvalidShape {
                name: name.into(),
                dims: batchn_shape.to_vec(),
            });
        }

        let mut shape = batchn_shape.to_vec();
        let mut tensor_offset = 0usize;

        for (index, request) in requests.iter().enumerate() {
            // A gap between the pending run and this response's slice means
            // the run cannot grow further; flush it and start fresh.
            if !self.pending.is_contiguous_with(tensor_offset) {
                let used = unsafe { self.flush_pending(name, buffer, endpoint)? };
                self.gate.latch(used);
            }

            // The leading dimension belongs to the request, not the batch.
            if self.max_batch_size > 0 {
                shape[0] = Self::request_batch_dim(name, request)?;
            }
            let Some(slice_len) = byte_size(datatype, &shape) else {
                return Err(StageError::InvalidShape {
                    name: name.into(),
                    dims: shape.clone(),
                });
            };

            if self.responses[index].is_some() && Self::wants_output(request, name) {
                let used = unsafe {
                    self.stage_output(
                        name,
                        index,
                        datatype,
                        &shape,
                        slice_len,
                        tensor_offset,
                        buffer,
                        endpoint,
                    )?
                };
                self.gate.latch(used);
            }

            tensor_offset += slice_len;
        }

        let used = unsafe { self.flush_pending(name, buffer, endpoint)? };
        self.gate.latch(used);
        self.gate.record(self.device)?;
        Ok(())
    }

    /// Complete all outstanding staged work.
    ///
    /// When deferred pinned blocks exist, waits once on the event (if
    /// configured) or the stream, then fans each block out into its response
    /// buffers. Those fan-out copies can themselves be asynchronous (a
    /// response living on the device), in which case the latch is re-set and
    /// the event re-recorded. Returns whether the caller must still
    /// synchronize before the response buffers are readable.
    pub fn finalize(&mut self) -> Result<bool> {
        if !self.deferred.is_empty() && self.gate.is_latched() {
            self.gate.synchronize(self.device)?;
        }

        let had_deferred = !self.deferred.is_empty();
        for deferred in std::mem::take(&mut self.deferred) {
            debug_assert_eq!(
                deferred
                    .fragments
                    .iter()
                    .map(|f| f.output.byte_size)
                    .sum::<usize>(),
                deferred.byte_size,
            );
            let mut offset = 0usize;
            for fragment in deferred.fragments {
                // A slot failed since the run was queued no longer owns its
                // buffer; skip it.
                if self.responses[fragment.slot].is_none() {
                    offset += fragment.output.byte_size;
                    continue;
                }
                let result = unsafe {
                    self.device.copy(
                        Endpoint::host_pinned(),
                        fragment.output.endpoint,
                        fragment.output.byte_size,
                        deferred.pinned.add(offset),
                        fragment.output.buffer,
                        self.gate.stream(),
                    )
                };
                match result {
                    Ok(used) => self.gate.latch(used),
                    Err(error) => fail_and_take(
                        self.responses,
                        fragment.slot,
                        StageError::copy_failed(
                            &fragment.output.name,
                            Endpoint::host_pinned(),
                            fragment.output.endpoint,
                            error,
                        ),
                    ),
                }
                offset += fragment.output.byte_size;
            }
        }

        if had_deferred {
            self.gate.record(self.device)?;
        }
        Ok(self.gate.is_latched())
    }

    /// Allocate one response's output buffer and route its slice either into
    /// the pending pinned run or through a direct copy. Returns whether any
    /// copy used the stream.
    #[allow(clippy::too_many_arguments)]
    unsafe fn stage_output(
        &mut self,
        name: &str,
        slot: usize,
        datatype: DataType,
        shape: &[i64],
        slice_len: usize,
        tensor_offset: usize,
        tensor: *const u8,
        tensor_endpoint: Endpoint,
    ) -> Result<bool> {
        let Some(response) = self.responses[slot].as_mut() else {
            return Ok(false);
        };

        // The response may override the placement; what matters from here on
        // is where the buffer actually ended up.
        let mut actual = tensor_endpoint;
        let buffer = match response.output_buffer(name, datatype, shape, slice_len, &mut actual) {
            Ok(ptr) => ptr,
            Err(error) => {
                fail_and_take(
                    self.responses,
                    slot,
                    StageError::OutputBuffer {
                        name: name.into(),
                        reason: error.to_string(),
                    },
                );
                return Ok(false);
            }
        };

        if self.pinned_enabled && needs_staging(tensor_endpoint.kind, actual.kind) {
            self.pending.push(
                tensor_offset,
                slice_len,
                PendingOutput {
                    slot,
                    output: OutputData {
                        name: name.into(),
                        buffer,
                        byte_size: slice_len,
                        endpoint: actual,
                    },
                },
            );
            Ok(false)
        } else {
            let result = unsafe {
                self.device.copy(
                    tensor_endpoint,
                    actual,
                    slice_len,
                    tensor.add(tensor_offset),
                    buffer,
                    self.gate.stream(),
                )
            };
            match result {
                Ok(used) => Ok(used),
                Err(error) => {
                    fail_and_take(
                        self.responses,
                        slot,
                        StageError::copy_failed(name, tensor_endpoint, actual, error),
                    );
                    Ok(false)
                }
            }
        }
    }

    /// Flush the pending pinned run fed from the source tensor.
    unsafe fn flush_pending(
        &mut self,
        name: &str,
        tensor: *const u8,
        tensor_endpoint: Endpoint,
    ) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let run = self.pending.take();
        let mut used_stream = false;

        match ManagedBuffer::allocate(self.memory, Endpoint::host_pinned(), run.byte_size()) {
            Err(error) => {
                // No staging buffer: copy each slice straight from the tensor
                // into its response buffer.
                tracing::debug!(
                    tensor = name,
                    byte_size = run.byte_size(),
                    %error,
                    "pinned staging unavailable, copying output slices directly"
                );
                let mut offset = run.start_offset();
                for fragment in run.into_fragments() {
                    if self.responses[fragment.slot].is_none() {
                        offset += fragment.output.byte_size;
                        continue;
                    }
                    let result = unsafe {
                        self.device.copy(
                            tensor_endpoint,
                            fragment.output.endpoint,
                            fragment.output.byte_size,
                            tensor.add(offset),
                            fragment.output.buffer,
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
                                tensor_endpoint,
                                fragment.output.endpoint,
                                error,
                            ),
                        ),
                    }
                    offset += fragment.output.byte_size;
                }
            }
            Ok(pinned) => {
                let pinned_ptr = pinned.as_ptr();
                let result = unsafe {
                    self.device.copy(
                        tensor_endpoint,
                        Endpoint::host_pinned(),
                        run.byte_size(),
                        tensor.add(run.start_offset()),
                        pinned_ptr,
                        self.gate.stream(),
                    )
                };
                match result {
                    Err(error) => {
                        // The whole run fed from this block fails together.
                        let error = StageError::copy_failed(
                            name,
                            tensor_endpoint,
                            Endpoint::host_pinned(),
                            error,
                        );
                        for fragment in run.fragments() {
                            fail_and_take(self.responses, fragment.slot, error.clone());
                        }
                    }
                    Ok(true) => {
                        // The bulk copy is in flight; hold the fan-out back
                        // until finalize has synchronized.
                        used_stream = true;
                        self.deferred.push(DeferredOutputs {
                            pinned: pinned_ptr,
                            byte_size: run.byte_size(),
                            fragments: run.into_fragments(),
                        });
                    }
                    Ok(false) => {
                        // Synchronous bulk copy: the pinned block holds the
                        // bytes already, fan out now.
                        let mut offset = 0usize;
                        for fragment in run.into_fragments() {
                            if self.responses[fragment.slot].is_none() {
                                offset += fragment.output.byte_size;
                                continue;
                            }
                            let result = unsafe {
                                self.device.copy(
                                    Endpoint::host_pinned(),
                                    fragment.output.endpoint,
                                    fragment.output.byte_size,
                                    pinned_ptr.add(offset),
                                    fragment.output.buffer,
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
                                        Endpoint::host_pinned(),
                                        fragment.output.endpoint,
                                        error,
                                    ),
                                ),
                            }
                            offset += fragment.output.byte_size;
                        }
                    }
                }
                self.pinned.push(pinned);
            }
        }

        Ok(used_stream)
    }

    /// The batch dimension of one request, read from its first input.
    fn request_batch_dim(name: &str, request: &R) -> Result<i64> {
        let input = request
            .input_name(0)
            .and_then(|first| request.input(first))
            .ok_or_else(|| StageError::MissingInput {
                name: name.into(),
            })?;
        input
            .shape()
            .first()
            .copied()
            .ok_or_else(|| StageError::InvalidShape {
                name: name.into(),
                dims: input.shape().to_vec(),
            })
    }

    fn wants_output(request: &R, name: &str) -> bool {
        (0..request.output_count()).any(|i| request.output_name(i) == Some(name))
    }
}
