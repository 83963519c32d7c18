//! Test doubles for the staging suite: carrier implementations whose
//! delivered buffers outlive the response objects, a memory manager with
//! full accounting and failure injection, and a device engine that simulates
//! the asynchronous stream with a program-order copy queue.
#![allow(dead_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use batchstage::{
    BatchRequest, BatchResponse, DataType, DeviceOps, Endpoint, EventHandle, MemoryChunk,
    MemoryKind, MemoryManager, RequestInput, ResponseSlots, Result, StageError, StreamHandle,
};

pub fn boxed(len: usize) -> Box<[u8]> {
    vec![0u8; len].into_boxed_slice()
}

// ── Memory manager double ────────────────────────────────────────────

/// Backs every memory kind with host allocations (tests treat device memory
/// as host addresses reached only through `FakeDevice`), counts allocations
/// and frees, and can fail upcoming pinned allocations on demand.
#[derive(Default)]
pub struct TestMemoryManager {
    live: Mutex<HashMap<usize, Layout>>,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    pinned_allocs: AtomicUsize,
    pinned_sizes: Mutex<Vec<usize>>,
    pinned_failures: AtomicUsize,
}

impl TestMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next pinned allocation fail (stacks if called repeatedly).
    pub fn fail_next_pinned(&self) {
        self.pinned_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Buffers allocated and not yet freed.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn alloc_count(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn free_count(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    /// Successful pinned allocations.
    pub fn pinned_alloc_count(&self) -> usize {
        self.pinned_allocs.load(Ordering::SeqCst)
    }

    /// Sizes of successful pinned allocations, in order.
    pub fn pinned_sizes(&self) -> Vec<usize> {
        self.pinned_sizes.lock().unwrap().clone()
    }
}

impl MemoryManager for TestMemoryManager {
    fn allocate(&self, kind: MemoryKind, device_id: u32, byte_size: usize) -> Result<NonNull<u8>> {
        if kind == MemoryKind::HostPinned {
            let outstanding = self.pinned_failures.load(Ordering::SeqCst);
            if outstanding > 0
                && self
                    .pinned_failures
                    .compare_exchange(
                        outstanding,
                        outstanding - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                return Err(StageError::allocation(
                    Endpoint { kind, device_id },
                    byte_size,
                    "injected pinned allocation failure",
                ));
            }
        }

        let layout = Layout::from_size_align(byte_size.max(1), 64).unwrap();
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
        self.live.lock().unwrap().insert(ptr.as_ptr() as usize, layout);
        self.allocs.fetch_add(1, Ordering::SeqCst);
        if kind == MemoryKind::HostPinned {
            self.pinned_allocs.fetch_add(1, Ordering::SeqCst);
            self.pinned_sizes.lock().unwrap().push(byte_size);
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _kind: MemoryKind, _device_id: u32) -> Result<()> {
        let layout = self
            .live
            .lock()
            .unwrap()
            .remove(&(ptr.as_ptr() as usize))
            .expect("freeing a pointer this manager never allocated (or a double free)");
        unsafe {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Device engine double ─────────────────────────────────────────────

#[derive(Clone, Copy)]
struct QueuedCopy {
    src: usize,
    dst: usize,
    len: usize,
}

/// Simulates the asynchronous device stream. Copies touching a `Device`
/// endpoint are queued and reported as stream copies; host↔host copies run
/// immediately. Synchronizing (stream or event) executes the queue in
/// program order. A copy whose source matches the injected failure pointer
/// fails instead.
#[derive(Default)]
pub struct FakeDevice {
    queue: Mutex<Vec<QueuedCopy>>,
    async_copies: AtomicUsize,
    fail_src: Mutex<Option<usize>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any copy reading from exactly `ptr`.
    pub fn fail_copies_from(&self, ptr: *const u8) {
        *self.fail_src.lock().unwrap() = Some(ptr as usize);
    }

    /// Copies queued on the stream and not yet retired.
    pub fn pending_copies(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Total copies that went through the stream.
    pub fn async_copy_count(&self) -> usize {
        self.async_copies.load(Ordering::SeqCst)
    }

    fn drain(&self) {
        let queued = std::mem::take(&mut *self.queue.lock().unwrap());
        for copy in queued {
            unsafe {
                std::ptr::copy_nonoverlapping(copy.src as *const u8, copy.dst as *mut u8, copy.len);
            }
        }
    }
}

impl DeviceOps for FakeDevice {
    unsafe fn copy(
        &self,
        src_endpoint: Endpoint,
        dst_endpoint: Endpoint,
        len: usize,
        src: *const u8,
        dst: *mut u8,
        _stream: StreamHandle,
    ) -> Result<bool> {
        if *self.fail_src.lock().unwrap() == Some(src as usize) {
            return Err(StageError::device("injected copy failure"));
        }

        let on_stream = src_endpoint.kind == MemoryKind::Device
            || dst_endpoint.kind == MemoryKind::Device;
        if on_stream {
            self.queue.lock().unwrap().push(QueuedCopy {
                src: src as usize,
                dst: dst as usize,
                len,
            });
            self.async_copies.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        } else {
            unsafe {
                std::ptr::copy_nonoverlapping(src, dst, len);
            }
            Ok(false)
        }
    }

    fn stream_synchronize(&self, _stream: StreamHandle) -> Result<()> {
        self.drain();
        Ok(())
    }

    fn event_record(&self, _event: EventHandle, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn event_synchronize(&self, _event: EventHandle) -> Result<()> {
        // One stream: the event covers everything recorded before it.
        self.drain();
        Ok(())
    }
}

// ── Request carrier double ───────────────────────────────────────────

pub struct MockInput {
    name: String,
    datatype: DataType,
    shape: Vec<i64>,
    storage: Vec<Box<[u8]>>,
    views: Vec<(usize, usize, usize, Endpoint)>,
}

impl MockInput {
    pub fn new(name: &str, datatype: DataType, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            datatype,
            shape: shape.to_vec(),
            storage: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Append one chunk backed by its own storage block.
    pub fn chunk(mut self, bytes: &[u8], endpoint: Endpoint) -> Self {
        let index = self.storage.len();
        self.storage.push(bytes.to_vec().into_boxed_slice());
        self.views.push((index, 0, bytes.len(), endpoint));
        self
    }

    /// Append two chunks slicing one storage block at `split`, so they are
    /// contiguous in memory.
    pub fn contiguous_chunks(mut self, bytes: &[u8], split: usize, endpoint: Endpoint) -> Self {
        assert!(split <= bytes.len());
        let index = self.storage.len();
        self.storage.push(bytes.to_vec().into_boxed_slice());
        self.views.push((index, 0, split, endpoint));
        self.views.push((index, split, bytes.len() - split, endpoint));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw pointer of the `index`-th chunk (for zero-copy assertions and
    /// failure injection).
    pub fn chunk_ptr(&self, index: usize) -> *const u8 {
        let (storage, offset, _, _) = self.views[index];
        unsafe { self.storage[storage].as_ptr().add(offset) }
    }
}

impl RequestInput for MockInput {
    fn datatype(&self) -> DataType {
        self.datatype
    }

    fn shape(&self) -> &[i64] {
        &self.shape
    }

    fn chunk_count(&self) -> usize {
        self.views.len()
    }

    fn chunk(&self, index: usize) -> MemoryChunk {
        let (storage, offset, len, endpoint) = self.views[index];
        MemoryChunk {
            ptr: unsafe { self.storage[storage].as_ptr().add(offset) },
            len,
            endpoint,
        }
    }
}

#[derive(Default)]
pub struct MockRequest {
    inputs: Vec<MockInput>,
    outputs: Vec<String>,
}

impl MockRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: MockInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, name: &str) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn input_ref(&self, name: &str) -> &MockInput {
        self.inputs.iter().find(|i| i.name == name).unwrap()
    }
}

impl BatchRequest for MockRequest {
    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn input_name(&self, index: usize) -> Option<&str> {
        self.inputs.get(index).map(|i| i.name.as_str())
    }

    fn input(&self, name: &str) -> Option<&dyn RequestInput> {
        self.inputs
            .iter()
            .find(|i| i.name == name)
            .map(|i| i as &dyn RequestInput)
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn output_name(&self, index: usize) -> Option<&str> {
        self.outputs.get(index).map(String::as_str)
    }
}

// ── Response carrier double ──────────────────────────────────────────

pub struct DeliveredBuffer {
    pub slot: usize,
    pub name: String,
    pub endpoint: Endpoint,
    data: Box<[u8]>,
}

/// Shared sink for everything the responses produce. Buffers land here at
/// allocation time so their bytes stay readable after a response is sent or
/// dropped.
#[derive(Default)]
pub struct DeliveryLog {
    buffers: Mutex<Vec<DeliveredBuffer>>,
    sent: Mutex<Vec<(usize, Option<String>)>>,
}

impl DeliveryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bytes of the buffer allocated by `slot` for output `name`.
    pub fn bytes(&self, slot: usize, name: &str) -> Option<Vec<u8>> {
        self.buffers
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.slot == slot && b.name == name)
            .map(|b| b.data.to_vec())
    }

    pub fn buffer_endpoint(&self, slot: usize, name: &str) -> Option<Endpoint> {
        self.buffers
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.slot == slot && b.name == name)
            .map(|b| b.endpoint)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// `(slot, error message)` of every completed response, in send order.
    pub fn sent(&self) -> Vec<(usize, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }

    /// The error message `slot` was failed with, if it was completed.
    pub fn sent_error(&self, slot: usize) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| *s == slot)
            .and_then(|(_, e)| e.clone())
    }
}

pub struct MockResponse {
    slot: usize,
    log: Arc<DeliveryLog>,
    endpoint: Endpoint,
    refuse_allocation_at: Option<usize>,
    allocation_calls: usize,
}

impl MockResponse {
    /// A response whose buffers live on the host (the common frontend case),
    /// whatever placement the caller prefers.
    pub fn new(slot: usize, log: Arc<DeliveryLog>) -> Self {
        Self {
            slot,
            log,
            endpoint: Endpoint::host(),
            refuse_allocation_at: None,
            allocation_calls: 0,
        }
    }

    /// Report every allocated buffer as living at `endpoint` instead.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Refuse the `index`-th (0-based) `output_buffer` call.
    pub fn refuse_allocation_at(mut self, index: usize) -> Self {
        self.refuse_allocation_at = Some(index);
        self
    }
}

impl BatchResponse for MockResponse {
    fn output_buffer(
        &mut self,
        name: &str,
        _datatype: DataType,
        _shape: &[i64],
        byte_size: usize,
        endpoint: &mut Endpoint,
    ) -> Result<*mut u8> {
        let call = self.allocation_calls;
        self.allocation_calls += 1;
        if self.refuse_allocation_at == Some(call) {
            return Err(StageError::device("allocation refused"));
        }
        *endpoint = self.endpoint;

        let mut data = boxed(byte_size);
        let ptr = data.as_mut_ptr();
        self.log.buffers.lock().unwrap().push(DeliveredBuffer {
            slot: self.slot,
            name: name.into(),
            endpoint: *endpoint,
            data,
        });
        Ok(ptr)
    }

    fn send(self: Box<Self>, error: Option<StageError>) {
        self.log
            .sent
            .lock()
            .unwrap()
            .push((self.slot, error.map(|e| e.to_string())));
    }
}

/// Response slots for `count` requests, all logging into `log`.
pub fn make_responses(log: &Arc<DeliveryLog>, count: usize) -> ResponseSlots {
    (0..count)
        .map(|slot| {
            Some(Box::new(MockResponse::new(slot, log.clone())) as Box<dyn BatchResponse>)
        })
        .collect()
}

/// Response slots with a per-slot endpoint override.
pub fn make_responses_at(log: &Arc<DeliveryLog>, endpoints: &[Endpoint]) -> ResponseSlots {
    endpoints
        .iter()
        .enumerate()
        .map(|(slot, &endpoint)| {
            Some(Box::new(MockResponse::new(slot, log.clone()).with_endpoint(endpoint))
                as Box<dyn BatchResponse>)
        })
        .collect()
}
