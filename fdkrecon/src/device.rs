//! Emulated accelerator devices
//!
//! Each [Device] has an ordinal and a fixed memory budget. Allocations are accounted
//! byte by byte, so running out of device memory behaves like it would on real
//! hardware. Buffers and streams release their resources when dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{AllocationError, TransferError};

/// Handle to one accelerator. Cloning the handle does not create a new device.
#[derive(Clone, Debug)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

#[derive(Debug)]
struct DeviceInner {
    ordinal: usize,
    capacity: usize,
    used: AtomicUsize,
    live_allocations: AtomicUsize,
    live_streams: AtomicUsize,
    next_stream: AtomicU64,
}

impl Device {
    /// Creates a device with `capacity` bytes of memory.
    pub fn new(ordinal: usize, capacity: usize) -> Self {
        Device {
            inner: Arc::new(DeviceInner {
                ordinal,
                capacity,
                used: AtomicUsize::new(0),
                live_allocations: AtomicUsize::new(0),
                live_streams: AtomicUsize::new(0),
                next_stream: AtomicU64::new(0),
            }),
        }
    }

    /// Creates `count` devices with identical memory budgets.
    pub fn enumerate(count: usize, capacity: usize) -> Vec<Device> {
        (0..count).map(|ordinal| Device::new(ordinal, capacity)).collect()
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    /// Memory budget in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently allocated.
    pub fn memory_used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.live_allocations.load(Ordering::Acquire)
    }

    pub fn live_streams(&self) -> usize {
        self.inner.live_streams.load(Ordering::Acquire)
    }

    /// Allocates a zero-initialised buffer of `len` floats.
    ///
    /// # Returns
    /// The buffer, or [AllocationError::OutOfMemory] when the request exceeds the
    /// free memory of this device.
    pub fn allocate(&self, len: usize) -> Result<DeviceBuffer, AllocationError> {
        let bytes = len * std::mem::size_of::<f32>();
        if bytes == 0 {
            return Err(AllocationError::ZeroSized);
        }
        let reserved = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.inner.capacity)
            });
        if let Err(used) = reserved {
            return Err(AllocationError::OutOfMemory {
                device: self.inner.ordinal,
                requested: bytes,
                available: self.inner.capacity.saturating_sub(used),
            });
        }
        self.inner.live_allocations.fetch_add(1, Ordering::AcqRel);
        debug!(device = self.inner.ordinal, bytes, "device allocation");
        Ok(DeviceBuffer {
            data: vec![0.0; len],
            device: self.clone(),
        })
    }

    /// Creates a new execution stream on this device.
    pub fn create_stream(&self) -> Stream {
        self.inner.live_streams.fetch_add(1, Ordering::AcqRel);
        Stream {
            device: self.clone(),
            id: self.inner.next_stream.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn free(&self, bytes: usize) {
        let released = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(bytes));
        if released.is_err() {
            // can't propagate from Drop; the run keeps going with skewed accounting
            error!(
                device = self.inner.ordinal,
                bytes, "failed to release device memory: accounting underflow"
            );
            return;
        }
        self.inner.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Execution stream of a device. Destroyed exactly once when dropped.
#[derive(Debug)]
pub struct Stream {
    device: Device,
    id: u64,
}

impl Stream {
    pub fn device(&self) -> usize {
        self.device.ordinal()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for all work issued on the stream.
    ///
    /// Copies on emulated devices complete when issued, so there is never anything
    /// left to wait for.
    pub fn synchronize(&self) -> Result<(), TransferError> {
        Ok(())
    }

    fn check(&self, buffer_device: usize) -> Result<(), TransferError> {
        if self.device() != buffer_device {
            return Err(TransferError::WrongDevice {
                stream_device: self.device(),
                buffer_device,
            });
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let released = self
            .device
            .inner
            .live_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            error!(device = self.device(), stream = self.id, "failed to destroy stream");
        }
    }
}

/// A buffer of `f32` in device memory.
#[derive(Debug)]
pub struct DeviceBuffer {
    data: Vec<f32>,
    device: Device,
}

impl DeviceBuffer {
    pub fn device(&self) -> usize {
        self.device.ordinal()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies host data into the buffer on `stream`.
    ///
    /// # Parameters
    /// - `src`: Host data, must have exactly the length of the buffer.
    /// - `stream`: A stream of the device owning this buffer.
    pub fn copy_from_host(&mut self, src: &[f32], stream: &Stream) -> Result<(), TransferError> {
        stream.check(self.device())?;
        if src.len() != self.data.len() {
            return Err(TransferError::SizeMismatch {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Copies a region of another device's memory into the start of this buffer.
    ///
    /// `src` may be shorter than the buffer; the remainder keeps its old content.
    pub fn copy_from_peer(&mut self, src: &[f32], stream: &Stream) -> Result<(), TransferError> {
        stream.check(self.device())?;
        if src.len() > self.data.len() {
            return Err(TransferError::SizeMismatch {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies the whole buffer to host memory on `stream`.
    pub fn copy_to_host(&self, dst: &mut [f32], stream: &Stream) -> Result<(), TransferError> {
        stream.check(self.device())?;
        if dst.len() != self.data.len() {
            return Err(TransferError::SizeMismatch {
                expected: self.data.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(&self.data);
        Ok(())
    }
}

impl std::ops::Deref for DeviceBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl std::ops::DerefMut for DeviceBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.free(self.data.len() * std::mem::size_of::<f32>());
    }
}
