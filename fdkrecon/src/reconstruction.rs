use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::ReconstructionConfig;
use crate::device::Device;
use crate::error::{ReconstructionError, Result};
use crate::feldkamp::FeldkampStage;
use crate::filtering::FilterStage;
use crate::pipeline::Pipeline;
use crate::preloader::PreloaderStage;
use crate::scheduler::{merge_partial_volumes, ChunkPlan};
use crate::source::{ProjectionLoader, SourceStage};
use crate::volume::{SinkStage, Volume, VolumeSink};
use crate::weighting::WeightingStage;

/// Drives a complete reconstruction on a set of devices.
///
/// The stages are wired as
/// `source -> preloader -> weighting -> filtering -> feldkamp -> sink`,
/// each on its own thread, once per volume chunk.
pub struct Reconstruction {
    config: Arc<ReconstructionConfig>,
    devices: Vec<Device>,
}

impl Reconstruction {
    /// Creates the devices described by `config`.
    pub fn new(config: ReconstructionConfig) -> Self {
        let devices = Device::enumerate(config.device_count(), config.device_memory());
        Reconstruction {
            config: Arc::new(config),
            devices,
        }
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Reconstructs the volume from the projection files `paths`.
    ///
    /// Scheduling and configuration checks happen before any stage starts. A
    /// volume too large for the devices is reconstructed in chunks, streaming all
    /// projections once per chunk. The run fails as a whole if any stage fails; no
    /// partial volume is returned.
    ///
    /// # Parameters
    /// - `loader`: Decodes the projection files.
    /// - `paths`: Projection files in acquisition order.
    ///
    /// # Returns
    /// The reconstructed volume.
    pub fn run<L: ProjectionLoader + Sync>(&self, loader: L, paths: Vec<PathBuf>) -> Result<Volume> {
        let geometry = self.config.volume_geometry()?;
        let chunks = FeldkampStage::schedule(&self.devices, &self.config)?;
        let loader = Arc::new(loader);

        let count = chunks.len();
        let mut parts = Vec::with_capacity(count);
        for (index, chunk) in chunks.into_iter().enumerate() {
            if count > 1 {
                info!(chunk = index + 1, chunks = count, offset = chunk.geometry.offset, "reconstructing chunk");
            }
            let volume = self.run_chunk(Arc::clone(&loader), paths.clone(), chunk)?;
            parts.push((volume.geometry().offset, volume.into_data()));
        }

        let voxels = merge_partial_volumes(&geometry, parts)?;
        Ok(Volume::new(voxels, geometry))
    }

    /// Runs the stage chain once, reconstructing `chunk`.
    fn run_chunk<L: ProjectionLoader + Sync>(
        &self,
        loader: Arc<L>,
        paths: Vec<PathBuf>,
        chunk: ChunkPlan,
    ) -> Result<Volume> {
        let config = &self.config;
        let detector = config.detector();

        let mut source = SourceStage::new(loader, paths, Arc::clone(config))?;
        let mut feldkamp = FeldkampStage::new(self.devices.clone(), Arc::clone(config), chunk)?;
        feldkamp.set_input_num(source.num())?;

        let mut preloader = PreloaderStage::new(
            self.devices.clone(),
            detector.n_row,
            detector.n_col,
            config.pool_limit(),
        )?;
        let mut weighting = WeightingStage::new(
            Arc::new(detector.clone()),
            self.devices.len(),
            config.channel_capacity(),
        );
        let mut filtering = FilterStage::new(detector.n_row, detector.n_col, detector.l_px_row)?;
        let (mut sink, volumes) = SinkStage::new();

        info!(
            projections = source.num(),
            devices = self.devices.len(),
            "starting reconstruction"
        );

        let mut pipeline = Pipeline::new(config.channel_capacity());
        pipeline.connect(&mut source, &mut preloader);
        pipeline.connect(&mut preloader, &mut weighting);
        pipeline.connect(&mut weighting, &mut filtering);
        pipeline.connect(&mut filtering, &mut feldkamp);
        pipeline.connect(&mut feldkamp, &mut sink);

        pipeline.run(source)?;
        pipeline.run(preloader)?;
        pipeline.run(weighting)?;
        pipeline.run(filtering)?;
        pipeline.run(feldkamp)?;
        pipeline.run(sink)?;
        pipeline.wait()?;

        volumes
            .take()
            .into_iter()
            .next()
            .ok_or_else(|| ReconstructionError::stage("sink", "pipeline finished without a volume"))
    }

    /// Reconstructs the volume and hands it to `sink`.
    pub fn run_into<L: ProjectionLoader + Sync, S: VolumeSink>(
        &self,
        loader: L,
        paths: Vec<PathBuf>,
        sink: &mut S,
    ) -> Result<()> {
        let volume = self.run(loader, paths)?;
        sink.write(&volume)
    }
}
