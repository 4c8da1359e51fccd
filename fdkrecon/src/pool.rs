//! Pooled block allocation
//!
//! A [BlockPool] hands out fixed-size blocks from a [BlockAllocator] backend and
//! recycles them instead of freeing. The pool grows lazily up to its limit; once
//! every block is outstanding, [BlockPool::acquire] blocks until one is returned.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::device::{Device, DeviceBuffer};
use crate::error::AllocationError;

/// Backend that creates the blocks a pool recycles.
pub trait BlockAllocator: Send + Sync + 'static {
    /// Block type, addressable as a slice of `f32`.
    type Block: Deref<Target = [f32]> + DerefMut + Send + 'static;

    /// Allocates one block of `len` elements.
    fn allocate_block(&self, len: usize) -> Result<Self::Block, AllocationError>;

    /// Human readable location of the memory, used in logs.
    fn location(&self) -> String;
}

impl BlockAllocator for Device {
    type Block = DeviceBuffer;

    fn allocate_block(&self, len: usize) -> Result<DeviceBuffer, AllocationError> {
        self.allocate(len)
    }

    fn location(&self) -> String {
        format!("device {}", self.ordinal())
    }
}

/// Page-locked host memory used to stage projections before upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinnedHostAllocator;

impl BlockAllocator for PinnedHostAllocator {
    type Block = Vec<f32>;

    fn allocate_block(&self, len: usize) -> Result<Vec<f32>, AllocationError> {
        if len == 0 {
            return Err(AllocationError::ZeroSized);
        }
        Ok(vec![0.0; len])
    }

    fn location(&self) -> String {
        "pinned host memory".to_string()
    }
}

/// Counters of a pool, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks allocated from the backend so far.
    pub allocated: usize,
    /// Blocks currently handed out.
    pub outstanding: usize,
    /// Maximum number of blocks.
    pub limit: usize,
}

struct PoolState<B> {
    free: Vec<B>,
    allocated: usize,
    outstanding: usize,
}

struct PoolInner<A: BlockAllocator> {
    allocator: A,
    block_len: usize,
    limit: usize,
    state: Mutex<PoolState<A::Block>>,
    returned: Condvar,
}

/// A bounded pool of equally sized blocks bound to one allocator.
///
/// Cloning yields another handle to the same pool.
pub struct BlockPool<A: BlockAllocator> {
    inner: Arc<PoolInner<A>>,
}

impl<A: BlockAllocator> Clone for BlockPool<A> {
    fn clone(&self) -> Self {
        BlockPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: BlockAllocator> BlockPool<A> {
    /// Creates an empty pool. No memory is allocated until the first acquire.
    ///
    /// # Parameters
    /// - `allocator`: The backend the blocks come from.
    /// - `block_len`: Number of `f32` elements per block.
    /// - `limit`: Maximum number of blocks, at least 1.
    pub fn new(allocator: A, block_len: usize, limit: usize) -> Self {
        BlockPool {
            inner: Arc::new(PoolInner {
                allocator,
                block_len,
                limit: limit.max(1),
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    allocated: 0,
                    outstanding: 0,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    /// Takes one block out of the pool.
    ///
    /// Reuses a returned block when one is available, otherwise allocates a new one
    /// while the pool is below its limit. At the limit the call blocks until another
    /// holder releases a block.
    ///
    /// # Returns
    /// The block, or the backend's [AllocationError] when lazy growth fails.
    pub fn acquire(&self) -> Result<PooledBlock<A>, AllocationError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(block) = state.free.pop() {
                state.outstanding += 1;
                return Ok(self.wrap(block));
            }
            if state.allocated < self.inner.limit {
                state.allocated += 1;
                state.outstanding += 1;
                drop(state);
                return match self.inner.allocator.allocate_block(self.inner.block_len) {
                    Ok(block) => {
                        debug!(
                            location = %self.inner.allocator.location(),
                            elements = self.inner.block_len,
                            "pool grew by one block"
                        );
                        Ok(self.wrap(block))
                    }
                    Err(err) => {
                        let mut state = self.inner.state.lock();
                        state.allocated -= 1;
                        state.outstanding -= 1;
                        self.inner.returned.notify_one();
                        Err(err)
                    }
                };
            }
            self.inner.returned.wait(&mut state);
        }
    }

    /// Returns a block to the pool. Equivalent to dropping it.
    pub fn release(&self, block: PooledBlock<A>) {
        drop(block);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            allocated: state.allocated,
            outstanding: state.outstanding,
            limit: self.inner.limit,
        }
    }

    /// Number of elements per block.
    pub fn block_len(&self) -> usize {
        self.inner.block_len
    }

    fn wrap(&self, block: A::Block) -> PooledBlock<A> {
        PooledBlock {
            block: Some(block),
            pool: Arc::clone(&self.inner),
        }
    }
}

impl<A: BlockAllocator> PoolInner<A> {
    fn put_back(&self, block: A::Block) {
        let mut state = self.state.lock();
        state.free.push(block);
        state.outstanding -= 1;
        self.returned.notify_one();
    }
}

/// A block on loan from a [BlockPool]; goes back to the pool when dropped.
pub struct PooledBlock<A: BlockAllocator> {
    block: Option<A::Block>,
    pool: Arc<PoolInner<A>>,
}

impl<A: BlockAllocator> PooledBlock<A> {
    /// The backend block, e.g. to issue copies on it.
    pub fn get(&self) -> &A::Block {
        // only `Drop` takes the block out
        self.block.as_ref().unwrap_or_else(|| unreachable!("block taken before drop"))
    }

    pub fn get_mut(&mut self) -> &mut A::Block {
        self.block.as_mut().unwrap_or_else(|| unreachable!("block taken before drop"))
    }
}

impl<A: BlockAllocator> Deref for PooledBlock<A> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.get()
    }
}

impl<A: BlockAllocator> DerefMut for PooledBlock<A> {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.get_mut()
    }
}

impl<A: BlockAllocator> Drop for PooledBlock<A> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.put_back(block);
        }
    }
}

impl<A: BlockAllocator> std::fmt::Debug for PooledBlock<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBlock")
            .field("location", &self.pool.allocator.location())
            .field("len", &self.pool.block_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn grows_lazily_and_reuses_blocks() {
        let pool = BlockPool::new(PinnedHostAllocator, 16, 4);
        assert_eq!(pool.stats().allocated, 0);

        let a = pool.acquire().unwrap();
        assert_eq!(a.len(), 16);
        pool.release(a);
        let _b = pool.acquire().unwrap();

        assert_eq!(pool.stats(), PoolStats { allocated: 1, outstanding: 1, limit: 4 });
    }

    #[test]
    fn never_exceeds_limit_and_blocks_until_release() {
        let device = Device::new(0, 1 << 20);
        let pool = BlockPool::new(device.clone(), 64, 2);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();
        assert_eq!(pool.stats().outstanding, 2);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let block = pool.acquire().unwrap();
                tx.send(()).unwrap();
                drop(block);
            })
        };

        // the third acquire must still be waiting
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.stats().allocated, 2);

        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(device.live_allocations(), 2);
    }

    #[test]
    fn blocks_are_freed_with_the_pool() {
        let device = Device::new(0, 1 << 20);
        {
            let pool = BlockPool::new(device.clone(), 64, 3);
            let a = pool.acquire().unwrap();
            let b = pool.acquire().unwrap();
            drop(a);
            drop(b);
            assert_eq!(device.memory_used(), 2 * 64 * 4);
        }
        assert_eq!(device.memory_used(), 0);
    }

    #[test]
    fn failed_growth_reports_resource_exhaustion() {
        let device = Device::new(1, 64 * 4);
        let pool = BlockPool::new(device, 64, 4);
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, AllocationError::OutOfMemory { device: 1, .. }));
        // the failed attempt does not count as an outstanding block
        assert_eq!(pool.stats(), PoolStats { allocated: 1, outstanding: 1, limit: 4 });
    }
}
