use std::path::Path;

use tracing::info;

use crate::error::{ReconstructionError, Result};
use crate::geometry::{apply_roi, make_volume_geometry, DetectorGeometry, RegionOfInterest, VolumeGeometry};

/// Default number of blocks each per-device pool may hold.
pub const DEFAULT_POOL_LIMIT: usize = 8;

/// Default capacity of the channels between stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Default memory budget of an emulated device (1 GiB).
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

/// Immutable configuration of a reconstruction run.
///
/// Built with [ReconstructionConfig::new] and the `with_*` methods; every setter
/// validates its argument so that configuration errors surface before any device
/// resource is committed.
#[derive(Debug, Clone)]
pub struct ReconstructionConfig {
    detector: DetectorGeometry,
    roi: Option<RegionOfInterest>,
    angles: Option<Vec<f32>>,
    quality: usize,
    device_count: usize,
    device_memory: usize,
    pool_limit: usize,
    channel_capacity: usize,
}

impl ReconstructionConfig {
    /// Creates a configuration for one device with default limits.
    pub fn new(detector: DetectorGeometry) -> Result<Self> {
        detector.validate()?;
        Ok(ReconstructionConfig {
            detector,
            roi: None,
            angles: None,
            quality: 1,
            device_count: 1,
            device_memory: DEFAULT_DEVICE_MEMORY,
            pool_limit: DEFAULT_POOL_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    /// Sets the number of devices the work is distributed over.
    pub fn with_devices(mut self, count: usize, memory_per_device: usize) -> Result<Self> {
        if count == 0 {
            return Err(ReconstructionError::Configuration(
                "at least one device is required".to_string(),
            ));
        }
        if memory_per_device == 0 {
            return Err(ReconstructionError::Configuration(
                "device memory budget must not be zero".to_string(),
            ));
        }
        self.device_count = count;
        self.device_memory = memory_per_device;
        Ok(self)
    }

    /// Sets the maximum number of blocks a pool may hand out at once.
    pub fn with_pool_limit(mut self, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(ReconstructionError::Configuration(
                "pool limit must be at least 1".to_string(),
            ));
        }
        self.pool_limit = limit;
        Ok(self)
    }

    /// Sets the capacity of the bounded channels between stages.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ReconstructionError::Configuration(
                "channel capacity must be at least 1".to_string(),
            ));
        }
        self.channel_capacity = capacity;
        Ok(self)
    }

    /// Keeps only every `quality`-th projection.
    pub fn with_quality(mut self, quality: usize) -> Result<Self> {
        if quality == 0 {
            return Err(ReconstructionError::Configuration(
                "quality must be at least 1".to_string(),
            ));
        }
        self.quality = quality;
        Ok(self)
    }

    /// Uses explicit projection angles (degrees) instead of `index * delta_phi`.
    pub fn with_angles(mut self, angles: Vec<f32>) -> Result<Self> {
        if angles.is_empty() {
            return Err(ReconstructionError::Configuration(
                "angle list is empty".to_string(),
            ));
        }
        if let Some(bad) = angles.iter().find(|a| !a.is_finite()) {
            return Err(ReconstructionError::Configuration(format!(
                "angle list contains a non-finite value {bad}"
            )));
        }
        self.angles = Some(angles);
        Ok(self)
    }

    /// Restricts the reconstruction to a region of the full volume.
    pub fn with_roi(mut self, roi: RegionOfInterest) -> Result<Self> {
        let full = make_volume_geometry(&self.detector)?;
        roi.validate(&full)?;
        self.roi = Some(roi);
        Ok(self)
    }

    pub fn detector(&self) -> &DetectorGeometry {
        &self.detector
    }

    pub fn roi(&self) -> Option<&RegionOfInterest> {
        self.roi.as_ref()
    }

    pub fn quality(&self) -> usize {
        self.quality
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn device_memory(&self) -> usize {
        self.device_memory
    }

    pub fn pool_limit(&self) -> usize {
        self.pool_limit
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Number of explicit angles, if an angle list was given.
    pub fn angle_count(&self) -> Option<usize> {
        self.angles.as_ref().map(Vec::len)
    }

    /// Geometry of the volume actually reconstructed (full volume or ROI).
    pub fn volume_geometry(&self) -> Result<VolumeGeometry> {
        let full = make_volume_geometry(&self.detector)?;
        match &self.roi {
            Some(roi) => apply_roi(&full, roi),
            None => Ok(full),
        }
    }

    /// Geometry of the full volume, used to centre voxel coordinates.
    pub fn full_volume_geometry(&self) -> Result<VolumeGeometry> {
        make_volume_geometry(&self.detector)
    }

    /// Angle in radians of the `index`-th emitted projection.
    ///
    /// `index` counts projections after quality decimation, so it maps to the raw
    /// projection `index * quality`.
    pub fn projection_angle(&self, index: usize) -> f32 {
        let raw = index * self.quality;
        let degrees = match &self.angles {
            Some(angles) => angles.get(raw).copied().unwrap_or(raw as f32 * self.detector.delta_phi),
            None => raw as f32 * self.detector.delta_phi,
        };
        degrees.to_radians()
    }

    /// Checks that an angle list covers `raw_count` projections.
    pub fn check_angle_coverage(&self, raw_count: usize) -> Result<()> {
        match self.angle_count() {
            Some(count) if count < raw_count => Err(ReconstructionError::Configuration(format!(
                "angle file lists {count} angles but {raw_count} projections were found"
            ))),
            _ => Ok(()),
        }
    }
}

/// Parses an angle file: whitespace separated angles in degrees.
///
/// A comma is accepted as decimal separator, so `12,5` reads as `12.5`.
///
/// # Returns
/// The angles in file order, or a configuration error naming the first token
/// that is not a number.
pub fn parse_angles(content: &str) -> Result<Vec<f32>> {
    content
        .split_whitespace()
        .map(|token| {
            token.replace(',', ".").parse::<f32>().map_err(|_| {
                ReconstructionError::Configuration(format!("invalid angle '{token}' in angle file"))
            })
        })
        .collect()
}

/// Reads and parses an angle file.
pub fn read_angle_file(path: &Path) -> Result<Vec<f32>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ReconstructionError::Configuration(format!("cannot read angle file {}: {e}", path.display()))
    })?;
    let angles = parse_angles(&content)?;
    info!(count = angles.len(), path = %path.display(), "read angle file");
    Ok(angles)
}
