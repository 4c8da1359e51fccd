use std::ops::{Deref, DerefMut};

use crate::device::{Device, Stream};
use crate::pool::{PinnedHostAllocator, PooledBlock};
use crate::stage::StreamItem;

/// One detector image travelling through the pipeline.
///
/// A projection without a buffer is the end-of-stream sentinel. Projections are
/// move-only; dropping one returns its buffer to the pool it came from and destroys
/// its stream.
#[derive(Debug)]
pub struct Projection<B> {
    buf: Option<B>,
    /// Pixels per row.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
    /// Sequence index after quality decimation.
    pub idx: usize,
    /// Projection angle in radians.
    pub phi: f32,
    device: usize,
    stream: Option<Stream>,
}

/// Projection staged in pinned host memory.
pub type HostProjection = Projection<PooledBlock<PinnedHostAllocator>>;

/// Projection resident on a device.
pub type DeviceProjection = Projection<PooledBlock<Device>>;

impl<B> Projection<B> {
    /// Wraps a host-resident buffer.
    pub fn new(buf: B, width: u32, height: u32, idx: usize, phi: f32) -> Self {
        Projection {
            buf: Some(buf),
            width,
            height,
            idx,
            phi,
            device: 0,
            stream: None,
        }
    }

    /// Wraps a device-resident buffer together with the stream its upload was issued on.
    pub fn on_device(buf: B, width: u32, height: u32, idx: usize, phi: f32, stream: Stream) -> Self {
        Projection {
            buf: Some(buf),
            width,
            height,
            idx,
            phi,
            device: stream.device(),
            stream: Some(stream),
        }
    }

    /// `false` for the end-of-stream sentinel.
    pub fn is_valid(&self) -> bool {
        self.buf.is_some()
    }

    /// Ordinal of the device holding the buffer.
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

}

impl<B: Deref<Target = [f32]>> Projection<B> {
    /// Pixel data in row-major order; `None` for the sentinel.
    pub fn data(&self) -> Option<&[f32]> {
        self.buf.as_deref()
    }
}

impl<B: DerefMut<Target = [f32]>> Projection<B> {
    pub fn data_mut(&mut self) -> Option<&mut [f32]> {
        self.buf.as_deref_mut()
    }
}

impl<B: Send + 'static> StreamItem for Projection<B> {
    fn sentinel() -> Self {
        Projection {
            buf: None,
            width: 0,
            height: 0,
            idx: 0,
            phi: 0.0,
            device: 0,
            stream: None,
        }
    }

    fn is_sentinel(&self) -> bool {
        !self.is_valid()
    }
}

/// A decoded detector frame as delivered by a [ProjectionLoader](crate::source::ProjectionLoader).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Pixel values in row-major order.
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BlockPool;

    #[test]
    fn sentinel_has_no_buffer() {
        let sentinel = HostProjection::sentinel();
        assert!(sentinel.is_sentinel());
        assert!(sentinel.data().is_none());
    }

    #[test]
    fn dropping_a_projection_releases_buffer_and_stream() {
        let device = Device::new(0, 1 << 16);
        let pool = BlockPool::new(device.clone(), 8, 2);
        let block = pool.acquire().unwrap();
        let projection = DeviceProjection::on_device(block, 4, 2, 0, 0.0, device.create_stream());
        assert_eq!(projection.device(), 0);
        assert_eq!(projection.stream().map(Stream::device), Some(0));
        assert_eq!(device.live_streams(), 1);
        assert_eq!(pool.stats().outstanding, 1);

        drop(projection);
        assert_eq!(device.live_streams(), 0);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
