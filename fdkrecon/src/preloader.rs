use tracing::debug;

use crate::device::Device;
use crate::error::{ReconstructionError, Result};
use crate::pool::BlockPool;
use crate::projection::{DeviceProjection, HostProjection};
use crate::stage::{Consumer, InputFunction, Inlet, OutputFunction, Outlet, Producer, Stage, StreamItem};

/// Uploads host projections into pooled device memory.
///
/// Devices are served round-robin, each from its own pool. The pool limit bounds
/// how many projections can be in flight per device; once it is reached the stage
/// blocks until a downstream stage drops a projection.
pub struct PreloaderStage {
    devices: Vec<Device>,
    pools: Vec<BlockPool<Device>>,
    width: u32,
    height: u32,
    next: usize,
    inlet: Inlet<HostProjection>,
    outlet: Outlet<DeviceProjection>,
}

impl PreloaderStage {
    /// Creates one empty pool per device.
    ///
    /// # Parameters
    /// - `devices`: The devices to distribute projections over, at least one.
    /// - `width`, `height`: Detector size in pixels.
    /// - `limit`: Maximum number of projections per device pool.
    pub fn new(devices: Vec<Device>, width: u32, height: u32, limit: usize) -> Result<Self> {
        if devices.is_empty() {
            return Err(ReconstructionError::Configuration(
                "preloader needs at least one device".to_string(),
            ));
        }
        let block_len = width as usize * height as usize;
        let pools = devices
            .iter()
            .map(|device| BlockPool::new(device.clone(), block_len, limit))
            .collect();
        Ok(PreloaderStage {
            devices,
            pools,
            width,
            height,
            next: 0,
            inlet: Inlet::new("preloader"),
            outlet: Outlet::new("preloader"),
        })
    }

    /// Handles to the per-device pools.
    pub fn pools(&self) -> &[BlockPool<Device>] {
        &self.pools
    }

    fn upload(&mut self, host: &HostProjection) -> Result<DeviceProjection> {
        let data = host.data().ok_or_else(|| {
            ReconstructionError::stage("preloader", "sentinel reached the upload path")
        })?;
        if host.width != self.width || host.height != self.height {
            return Err(ReconstructionError::MalformedInput(format!(
                "projection {} is {}x{}, expected {}x{}",
                host.idx, host.width, host.height, self.width, self.height
            )));
        }

        let device = self.next;
        self.next = (self.next + 1) % self.devices.len();

        let mut block = self.pools[device].acquire()?;
        let stream = self.devices[device].create_stream();
        block.get_mut().copy_from_host(data, &stream)?;
        debug!(projection = host.idx, device, "projection uploaded");

        Ok(DeviceProjection::on_device(
            block,
            host.width,
            host.height,
            host.idx,
            host.phi,
            stream,
        ))
    }
}

impl Stage for PreloaderStage {
    fn name(&self) -> &'static str {
        "preloader"
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let host = self.inlet.pull()?;
            if host.is_sentinel() {
                break;
            }
            let projection = self.upload(&host)?;
            drop(host);
            self.outlet.push(projection)?;
        }
        self.outlet.push(DeviceProjection::sentinel())
    }
}

impl Consumer for PreloaderStage {
    type Input = HostProjection;

    fn set_input_function(&mut self, input: InputFunction<HostProjection>) {
        self.inlet.connect(input);
    }
}

impl Producer for PreloaderStage {
    type Output = DeviceProjection;

    fn set_output_function(&mut self, output: OutputFunction<DeviceProjection>) {
        self.outlet.connect(output);
    }
}
