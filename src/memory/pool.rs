//! Recycling pool for pinned staging blocks.
//!
//! Page-locking host memory is expensive, and the staging core allocates a
//! pinned block per flush. This pool sits in front of any [`MemoryManager`]
//! and recycles pinned blocks through two lock-free tiers sized for typical
//! staging runs. Blocks are allocated lazily at tier capacity on first use,
//! returned to their tier's queue on free, and dropped back to the inner
//! manager when a queue is full. Requests beyond the large tier bypass the
//! pool entirely. Non-pinned kinds delegate straight to the inner manager.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use crossbeam_queue::ArrayQueue;

use crate::error::{Result, StageError};
use crate::memory::MemoryManager;
use crate::types::MemoryKind;

/// Small tier block capacity: 64 KiB (covers most per-batch staging runs).
const SMALL_BLOCK_BYTES: usize = 64 * 1024;

/// Large tier block capacity: 8 MiB.
const LARGE_BLOCK_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum Tier {
    Small,
    Large,
}

impl Tier {
    fn for_size(len: usize) -> Option<Tier> {
        if len <= SMALL_BLOCK_BYTES {
            Some(Tier::Small)
        } else if len <= LARGE_BLOCK_BYTES {
            Some(Tier::Large)
        } else {
            None
        }
    }

    fn capacity(self) -> usize {
        match self {
            Tier::Small => SMALL_BLOCK_BYTES,
            Tier::Large => LARGE_BLOCK_BYTES,
        }
    }
}

/// A [`MemoryManager`] wrapper that recycles pinned blocks.
pub struct PinnedPool<M: MemoryManager> {
    inner: M,
    small: ArrayQueue<usize>,
    large: ArrayQueue<usize>,
    // Block address -> tier, for every pooled block still alive.
    tiers: Mutex<HashMap<usize, Tier>>,
}

impl<M: MemoryManager> PinnedPool<M> {
    /// Pool with default queue depths (32 small, 4 large blocks).
    pub fn new(inner: M) -> Self {
        Self::with_depths(inner, 32, 4)
    }

    /// Pool holding at most `small_blocks` 64 KiB and `large_blocks` 8 MiB
    /// recycled blocks.
    pub fn with_depths(inner: M, small_blocks: usize, large_blocks: usize) -> Self {
        Self {
            inner,
            small: ArrayQueue::new(small_blocks.max(1)),
            large: ArrayQueue::new(large_blocks.max(1)),
            tiers: Mutex::new(HashMap::new()),
        }
    }

    fn queue(&self, tier: Tier) -> &ArrayQueue<usize> {
        match tier {
            Tier::Small => &self.small,
            Tier::Large => &self.large,
        }
    }
}

impl<M: MemoryManager> MemoryManager for PinnedPool<M> {
    fn allocate(&self, kind: MemoryKind, device_id: u32, byte_size: usize) -> Result<NonNull<u8>> {
        if kind != MemoryKind::HostPinned {
            return self.inner.allocate(kind, device_id, byte_size);
        }
        let Some(tier) = Tier::for_size(byte_size) else {
            // Beyond the large tier the block is not worth keeping around.
            return self.inner.allocate(kind, device_id, byte_size);
        };

        if let Some(addr) = self.queue(tier).pop() {
            // Recycled blocks are tier-sized, so any request that maps to the
            // tier fits.
            return NonNull::new(addr as *mut u8)
                .ok_or_else(|| StageError::device("pooled pinned block had null address"));
        }

        let ptr = self.inner.allocate(kind, device_id, tier.capacity())?;
        self.tiers
            .lock()
            .map_err(|_| StageError::LockPoisoned("pinned pool tiers"))?
            .insert(ptr.as_ptr() as usize, tier);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, kind: MemoryKind, device_id: u32) -> Result<()> {
        if kind != MemoryKind::HostPinned {
            return unsafe { self.inner.free(ptr, kind, device_id) };
        }

        let addr = ptr.as_ptr() as usize;
        let tier = self
            .tiers
            .lock()
            .map_err(|_| StageError::LockPoisoned("pinned pool tiers"))?
            .get(&addr)
            .copied();
        match tier {
            None => unsafe { self.inner.free(ptr, kind, device_id) },
            Some(tier) => {
                if self.queue(tier).push(addr).is_err() {
                    // Queue full: release the block for real.
                    self.tiers
                        .lock()
                        .map_err(|_| StageError::LockPoisoned("pinned pool tiers"))?
                        .remove(&addr);
                    unsafe { self.inner.free(ptr, kind, device_id) }
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl<M: MemoryManager> Drop for PinnedPool<M> {
    fn drop(&mut self) {
        let Ok(mut tiers) = self.tiers.lock() else {
            return;
        };
        for queue in [&self.small, &self.large] {
            while let Some(addr) = queue.pop() {
                tiers.remove(&addr);
                // The pool only queues pinned blocks it allocated itself.
                let Some(ptr) = NonNull::new(addr as *mut u8) else {
                    continue;
                };
                if let Err(error) = unsafe { self.inner.free(ptr, MemoryKind::HostPinned, 0) } {
                    tracing::warn!(%error, "failed to release pooled pinned block");
                }
            }
        }
    }
}
