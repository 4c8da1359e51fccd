//! Multi-device Feldkamp backprojection
//!
//! The volume is split into chunks, and every chunk into one axial slab per device
//! (see [crate::scheduler]). A stage reconstructs one chunk: every incoming
//! projection is cut down to the detector rows each slab can see, copied to that
//! slab's device and backprojected there by a dedicated worker thread.
//! [FeldkampStage::wait] collects the slabs and stitches them in ascending offset
//! order.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use nalgebra::{Rotation2, Vector2};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::ReconstructionConfig;
use crate::device::{Device, DeviceBuffer, Stream};
use crate::error::{ReconstructionError, Result};
use crate::geometry::{proj_real_coordinate, vol_centered_coordinate, DetectorGeometry, VolumeGeometry};
use crate::pool::{BlockPool, PooledBlock};
use crate::projection::DeviceProjection;
use crate::scheduler::{merge_partial_volumes, ChunkPlan, FeldkampScheduler, SlabPlan};
use crate::stage::{Consumer, InputFunction, Inlet, OutputFunction, Outlet, Producer, Stage, StreamItem};
use crate::volume::Volume;

/// Lifecycle of the backprojector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeldkampState {
    /// Constructed, no worker started yet.
    Idle,
    /// Workers are backprojecting.
    Running,
    /// Workers finished, slabs are being stitched.
    Merging,
    /// The volume has been produced.
    Done,
}

/// Everything the backprojection kernel needs besides the projection.
#[derive(Debug, Clone)]
struct KernelParams {
    detector: DetectorGeometry,
    full: VolumeGeometry,
    origin: (u32, u32, u32),
}

/// The detector rows of one projection that one slab needs, on the slab's device.
struct SubProjection {
    block: PooledBlock<Device>,
    idx: usize,
    _stream: Stream,
}

type PartialVolume = (u32, Vec<f32>);

struct DeviceSlot {
    plan: SlabPlan,
    device: Device,
    pool: BlockPool<Device>,
    volume: Option<DeviceBuffer>,
    queue: Option<Sender<SubProjection>>,
    worker: Option<JoinHandle<Result<PartialVolume>>>,
}

/// Bilinear interpolation in a window of detector rows.
///
/// `y` is a row coordinate of the full detector; the window holds rows
/// `first_row..first_row + rows`. Samples whose four neighbours are not all inside
/// the window are 0.
fn interpolate(window: &[f32], x: f32, y: f32, width: u32, first_row: u32, rows: u32) -> f32 {
    let x1 = x.floor();
    let x2 = x1 + 1.0;
    let y1 = y.floor();
    let y2 = y1 + 1.0;

    let inside = x1 >= 0.0
        && x2 < width as f32
        && y1 >= first_row as f32
        && y2 < (first_row + rows) as f32;
    if !inside {
        return 0.0;
    }

    let width = width as usize;
    let x1u = x1 as usize;
    let r1 = (y1 as u32 - first_row) as usize;
    let r2 = r1 + 1;
    let q11 = window[x1u + r1 * width];
    let q21 = window[x1u + 1 + r1 * width];
    let q12 = window[x1u + r2 * width];
    let q22 = window[x1u + 1 + r2 * width];

    let interp_y1 = (x2 - x) * q11 + (x - x1) * q21;
    let interp_y2 = (x2 - x) * q12 + (x - x1) * q22;
    (y2 - y) * interp_y1 + (y - y1) * interp_y2
}

/// Adds one filtered projection to a slab.
fn backproject(volume: &mut [f32], plan: &SlabPlan, window: &[f32], rotation: &Rotation2<f32>, params: &KernelParams) {
    let det = &params.detector;
    let full = &params.full;
    let slab = &plan.geometry;
    let (x0, y0, z0) = params.origin;

    let d_so = det.d_so;
    let d_sd = det.d_sd();
    let delta_s = det.delta_s_mm();
    let delta_t = det.delta_t_mm();
    let rows = plan.rows();

    volume
        .par_chunks_mut(slab.plane_size())
        .enumerate()
        .for_each(|(m, slice)| {
            let z = vol_centered_coordinate(z0 + slab.offset + m as u32, full.dim_z, full.l_vx_z);
            for (l, line) in slice.chunks_exact_mut(slab.dim_x as usize).enumerate() {
                let y = vol_centered_coordinate(y0 + l as u32, full.dim_y, full.l_vx_y);
                for (k, voxel) in line.iter_mut().enumerate() {
                    let x = vol_centered_coordinate(x0 + k as u32, full.dim_x, full.l_vx_x);

                    // (s, t): position in the rotated frame of the source
                    let st = rotation * Vector2::new(x, y);
                    let factor = d_sd / (st.x + d_so);
                    let h = proj_real_coordinate(st.y * factor, det.n_row, det.l_px_row, delta_s);
                    let v = proj_real_coordinate(z * factor, det.n_col, det.l_px_col, delta_t);

                    let value = interpolate(window, h, v, det.n_row, plan.first_row, rows);
                    let u = -(d_so / (st.x + d_so));
                    *voxel += 0.5 * value * u * u;
                }
            }
        });
}

fn run_worker(
    plan: SlabPlan,
    device: Device,
    mut volume: DeviceBuffer,
    queue: Receiver<SubProjection>,
    tables: Arc<OnceLock<Vec<Rotation2<f32>>>>,
    params: Arc<KernelParams>,
) -> Result<PartialVolume> {
    let expected = tables.get().map_or(0, Vec::len);
    let mut done = 0usize;
    for sub in queue.iter() {
        let rotation = tables
            .get()
            .and_then(|table| table.get(sub.idx))
            .ok_or_else(|| ReconstructionError::MalformedInput(format!("no angle for projection {}", sub.idx)))?;
        backproject(&mut volume, &plan, &sub.block, rotation, &params);
        drop(sub);

        done += 1;
        if done % 10 == 0 {
            info!(device = plan.device, done, expected, "backprojection progress");
        }
    }

    let stream = device.create_stream();
    let mut host = vec![0.0; volume.len()];
    volume.copy_to_host(&mut host, &stream)?;
    stream.synchronize()?;
    debug!(device = plan.device, projections = done, "slab copied to host");
    Ok((plan.geometry.offset, host))
}

/// Backprojects filtered projections into one chunk of the volume, distributed over
/// all devices.
pub struct FeldkampStage {
    config: Arc<ReconstructionConfig>,
    chunk: VolumeGeometry,
    params: Arc<KernelParams>,
    slots: Vec<DeviceSlot>,
    tables: Arc<OnceLock<Vec<Rotation2<f32>>>>,
    input_num: Option<usize>,
    received: usize,
    state: FeldkampState,
    inlet: Inlet<DeviceProjection>,
    outlet: Outlet<Volume>,
}

impl FeldkampStage {
    /// Splits the configured volume into chunks that fit `devices`.
    ///
    /// # Returns
    /// The chunks in ascending offset order, or
    /// [ReconstructionError::InsufficientDeviceMemory] when the volume cannot be
    /// split finely enough. Nothing is allocated.
    pub fn schedule(devices: &[Device], config: &ReconstructionConfig) -> Result<Vec<ChunkPlan>> {
        let full = config.full_volume_geometry()?;
        let volume = config.volume_geometry()?;
        let memory: Vec<usize> = devices.iter().map(Device::capacity).collect();
        FeldkampScheduler::new(config.detector(), full, volume, config.roi().copied())
            .schedule(&memory, config.pool_limit())
    }

    /// Allocates one partial volume per device for `chunk`.
    ///
    /// # Parameters
    /// - `devices`: The devices to use, in the order of `chunk.slabs`.
    /// - `config`: The run configuration.
    /// - `chunk`: The part of the volume to reconstruct, from [FeldkampStage::schedule].
    ///
    /// # Returns
    /// The idle stage, or a configuration error when the chunk was planned for a
    /// different number of devices.
    pub fn new(devices: Vec<Device>, config: Arc<ReconstructionConfig>, chunk: ChunkPlan) -> Result<Self> {
        if chunk.slabs.len() != devices.len() {
            return Err(ReconstructionError::Configuration(format!(
                "chunk planned for {} devices, {} given",
                chunk.slabs.len(),
                devices.len()
            )));
        }
        let detector = config.detector().clone();
        let full = config.full_volume_geometry()?;
        let roi = config.roi().copied();

        let mut slots = Vec::with_capacity(chunk.slabs.len());
        for (plan, device) in chunk.slabs.into_iter().zip(devices) {
            let partial = if plan.is_empty() {
                None
            } else {
                Some(device.allocate(plan.geometry.voxel_count())?)
            };
            let block_len = detector.n_row as usize * plan.rows() as usize;
            slots.push(DeviceSlot {
                pool: BlockPool::new(device.clone(), block_len, config.pool_limit()),
                plan,
                device,
                volume: partial,
                queue: None,
                worker: None,
            });
        }

        let origin = roi.map_or((0, 0, 0), |r| (r.x1, r.y1, r.z1));
        Ok(FeldkampStage {
            params: Arc::new(KernelParams { detector, full, origin }),
            config,
            chunk: chunk.geometry,
            slots,
            tables: Arc::new(OnceLock::new()),
            input_num: None,
            received: 0,
            state: FeldkampState::Idle,
            inlet: Inlet::new("feldkamp"),
            outlet: Outlet::new("feldkamp"),
        })
    }

    pub fn state(&self) -> FeldkampState {
        self.state
    }

    /// The slab assigned to every device in this chunk.
    pub fn plans(&self) -> Vec<&SlabPlan> {
        self.slots.iter().map(|slot| &slot.plan).collect()
    }

    /// Announces the number of projections and builds the rotation of every angle.
    ///
    /// Must be called once, before the first [FeldkampStage::wait].
    pub fn set_input_num(&mut self, num: usize) -> Result<()> {
        let table = (0..num)
            .map(|i| Rotation2::new(-self.config.projection_angle(i)))
            .collect();
        self.tables.set(table).map_err(|_| {
            ReconstructionError::Configuration("number of projections was already set".to_string())
        })?;
        self.input_num = Some(num);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let capacity = self.config.channel_capacity();
        for slot in &mut self.slots {
            let Some(volume) = slot.volume.take() else { continue };
            let (tx, rx) = bounded(capacity);
            let plan = slot.plan.clone();
            let device = slot.device.clone();
            let tables = Arc::clone(&self.tables);
            let params = Arc::clone(&self.params);
            let name = format!("feldkamp-{}", plan.device);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(plan, device, volume, rx, tables, params))
                .map_err(|e| ReconstructionError::stage("feldkamp", format!("cannot spawn worker: {e}")))?;
            slot.queue = Some(tx);
            slot.worker = Some(handle);
        }
        self.state = FeldkampState::Running;
        info!(devices = self.slots.len(), "backprojection workers started");
        Ok(())
    }

    /// Hands one filtered projection to every device whose slab it reaches.
    pub fn process(&mut self, projection: DeviceProjection) -> Result<()> {
        let Some(data) = projection.data() else {
            return Ok(());
        };
        match self.state {
            FeldkampState::Idle => self.start()?,
            FeldkampState::Running => {}
            state => {
                return Err(ReconstructionError::stage(
                    "feldkamp",
                    format!("projection {} arrived in state {state:?}", projection.idx),
                ))
            }
        }
        let Some(table) = self.tables.get() else {
            return Err(ReconstructionError::Configuration(
                "set_input_num must be called before projections arrive".to_string(),
            ));
        };
        if projection.idx >= table.len() {
            return Err(ReconstructionError::MalformedInput(format!(
                "projection index {} exceeds the announced {} projections",
                projection.idx,
                table.len()
            )));
        }

        let width = self.params.detector.n_row as usize;
        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            let Some(queue) = slot.queue.as_ref() else { continue };
            let first = slot.plan.first_row as usize * width;
            let last = (slot.plan.last_row as usize + 1) * width;
            let rows = data.get(first..last).ok_or_else(|| {
                ReconstructionError::MalformedInput(format!(
                    "projection {} has {} pixels, slab needs up to {last}",
                    projection.idx,
                    data.len()
                ))
            })?;

            let mut block = slot.pool.acquire()?;
            let stream = slot.device.create_stream();
            block.get_mut().copy_from_peer(rows, &stream)?;
            let sub = SubProjection {
                block,
                idx: projection.idx,
                _stream: stream,
            };
            if queue.send(sub).is_err() {
                return Err(self.worker_failure(i));
            }
        }
        self.received += 1;
        debug!(projection = projection.idx, "projection dispatched");
        Ok(())
    }

    /// The error of a worker that stopped early.
    fn worker_failure(&mut self, index: usize) -> ReconstructionError {
        let slot = &mut self.slots[index];
        slot.queue = None;
        let device = slot.plan.device;
        match slot.worker.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => ReconstructionError::stage("feldkamp", format!("worker of device {device} panicked")),
            _ => ReconstructionError::stage("feldkamp", format!("worker of device {device} stopped")),
        }
    }

    /// Waits for every worker and stitches the slabs into one volume.
    pub fn wait(&mut self) -> Result<Volume> {
        let Some(input_num) = self.input_num else {
            return Err(ReconstructionError::Configuration(
                "set_input_num must be called before wait".to_string(),
            ));
        };
        match self.state {
            FeldkampState::Idle => self.start()?,
            FeldkampState::Running => {}
            state => {
                return Err(ReconstructionError::stage(
                    "feldkamp",
                    format!("wait called in state {state:?}"),
                ))
            }
        }
        self.state = FeldkampState::Merging;
        if self.received != input_num {
            warn!(received = self.received, expected = input_num, "not every announced projection arrived");
        }

        for slot in &mut self.slots {
            slot.queue = None;
        }
        let mut parts = Vec::with_capacity(self.slots.len());
        let mut first_error = None;
        for slot in &mut self.slots {
            let Some(worker) = slot.worker.take() else { continue };
            match worker.join() {
                Ok(Ok((offset, voxels))) => parts.push((offset - self.chunk.offset, voxels)),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(ReconstructionError::stage(
                        "feldkamp",
                        format!("worker of device {} panicked", slot.plan.device),
                    ));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let voxels = merge_partial_volumes(&self.chunk, parts)?;
        self.state = FeldkampState::Done;
        info!(
            offset = self.chunk.offset,
            dim_x = self.chunk.dim_x,
            dim_y = self.chunk.dim_y,
            dim_z = self.chunk.dim_z,
            "chunk merged"
        );
        Ok(Volume::new(voxels, self.chunk))
    }
}

impl Drop for FeldkampStage {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            slot.queue = None;
        }
        for slot in &mut self.slots {
            let Some(worker) = slot.worker.take() else { continue };
            // only reached on failed runs; the run reports its own error
            match worker.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(device = slot.plan.device, error = %e, "backprojection worker failed"),
                Err(_) => error!(device = slot.plan.device, "backprojection worker panicked"),
            }
        }
    }
}

impl Stage for FeldkampStage {
    fn name(&self) -> &'static str {
        "feldkamp"
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let projection = self.inlet.pull()?;
            if projection.is_sentinel() {
                break;
            }
            self.process(projection)?;
        }
        let volume = self.wait()?;
        self.outlet.push(volume)?;
        self.outlet.push(Volume::sentinel())
    }
}

impl Consumer for FeldkampStage {
    type Input = DeviceProjection;

    fn set_input_function(&mut self, input: InputFunction<DeviceProjection>) {
        self.inlet.connect(input);
    }
}

impl Producer for FeldkampStage {
    type Output = Volume;

    fn set_output_function(&mut self, output: OutputFunction<Volume>) {
        self.outlet.connect(output);
    }
}
