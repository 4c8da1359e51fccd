use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::geometry::VolumeGeometry;
use crate::stage::{Consumer, InputFunction, Inlet, Stage, StreamItem};

/// A reconstructed volume in host memory.
///
/// Voxels are stored slice by slice, `x` running fastest. A volume without voxels
/// is the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Option<Vec<f32>>,
    geometry: VolumeGeometry,
}

impl Volume {
    /// Wraps merged voxels. `data` must hold `geometry.voxel_count()` values.
    pub fn new(data: Vec<f32>, geometry: VolumeGeometry) -> Self {
        debug_assert_eq!(data.len(), geometry.voxel_count());
        Volume {
            data: Some(data),
            geometry,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.is_some()
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// All voxels; empty for the sentinel.
    pub fn data(&self) -> &[f32] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Takes the voxels out of the volume; empty for the sentinel.
    pub fn into_data(self) -> Vec<f32> {
        self.data.unwrap_or_default()
    }

    /// The voxels of axial slice `z`, or `None` if `z` is out of range.
    pub fn slice(&self, z: u32) -> Option<&[f32]> {
        if z >= self.geometry.dim_z {
            return None;
        }
        let plane = self.geometry.plane_size();
        let start = z as usize * plane;
        self.data().get(start..start + plane)
    }

    /// Value of voxel `(x, y, z)`.
    pub fn get(&self, x: u32, y: u32, z: u32) -> Option<f32> {
        if x >= self.geometry.dim_x || y >= self.geometry.dim_y {
            return None;
        }
        self.slice(z)
            .map(|slice| slice[(y * self.geometry.dim_x + x) as usize])
    }
}

impl StreamItem for Volume {
    fn sentinel() -> Self {
        Volume {
            data: None,
            geometry: VolumeGeometry {
                dim_x: 0,
                dim_y: 0,
                dim_z: 0,
                l_vx_x: 0.0,
                l_vx_y: 0.0,
                l_vx_z: 0.0,
                offset: 0,
            },
        }
    }

    fn is_sentinel(&self) -> bool {
        !self.is_valid()
    }
}

/// Receives finished volumes, e.g. to store them on disk.
pub trait VolumeSink {
    fn write(&mut self, volume: &Volume) -> Result<()>;
}

/// Volumes collected by a [SinkStage], handed out once the pipeline has finished.
#[derive(Clone, Default)]
pub struct CollectedVolumes {
    volumes: Arc<Mutex<Vec<Volume>>>,
}

impl CollectedVolumes {
    /// Removes and returns every collected volume.
    pub fn take(&self) -> Vec<Volume> {
        std::mem::take(&mut *self.volumes.lock())
    }
}

/// Last stage of the pipeline.
///
/// Keeps every valid volume until the run is known to have succeeded, so a failed
/// run never reaches a [VolumeSink].
pub struct SinkStage {
    collected: CollectedVolumes,
    inlet: Inlet<Volume>,
}

impl SinkStage {
    pub fn new() -> (Self, CollectedVolumes) {
        let collected = CollectedVolumes::default();
        let stage = SinkStage {
            collected: collected.clone(),
            inlet: Inlet::new("sink"),
        };
        (stage, collected)
    }
}

impl Stage for SinkStage {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let volume = self.inlet.pull()?;
            if volume.is_sentinel() {
                return Ok(());
            }
            let g = volume.geometry();
            info!(dim_x = g.dim_x, dim_y = g.dim_y, dim_z = g.dim_z, "volume received");
            self.collected.volumes.lock().push(volume);
        }
    }
}

impl Consumer for SinkStage {
    type Input = Volume;

    fn set_input_function(&mut self, input: InputFunction<Volume>) {
        self.inlet.connect(input);
    }
}
