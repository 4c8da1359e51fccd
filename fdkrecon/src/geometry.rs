use serde::Deserialize;
use tracing::info;

use crate::error::{ReconstructionError, Result};

/// Scanner and detector configuration of one run.
///
/// Lengths are in millimetres, offsets in pixels and the angular step in degrees.
/// The value is immutable once the run has started and shared read-only by every stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorGeometry {
    /// Number of pixels per detector row (horizontal).
    pub n_row: u32,
    /// Number of detector rows (vertical).
    pub n_col: u32,
    /// Horizontal pixel pitch.
    pub l_px_row: f32,
    /// Vertical pixel pitch.
    pub l_px_col: f32,
    /// Horizontal detector offset in pixels.
    #[serde(default)]
    pub delta_s: f32,
    /// Vertical detector offset in pixels.
    #[serde(default)]
    pub delta_t: f32,
    /// Distance source to object (centre of rotation).
    pub d_so: f32,
    /// Distance object to detector.
    pub d_od: f32,
    /// Angular step between two projections.
    #[serde(default)]
    pub delta_phi: f32,
}

impl DetectorGeometry {
    /// Parses a geometry file made of `key = value` lines.
    ///
    /// # Parameters
    /// - `content`: The file content.
    ///
    /// # Returns
    /// The validated geometry, or a configuration error when a key is missing or a value
    /// is out of range.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let geometry: DetectorGeometry = toml::from_str(content)?;
        geometry.validate()?;
        Ok(geometry)
    }

    /// Reads and parses a geometry file from disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ReconstructionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks that every parameter describes a physically meaningful scanner.
    pub fn validate(&self) -> Result<()> {
        if self.n_row == 0 || self.n_col == 0 {
            return Err(ReconstructionError::Configuration(format!(
                "detector must have at least one pixel, got {}x{}",
                self.n_row, self.n_col
            )));
        }
        let lengths = [
            ("l_px_row", self.l_px_row),
            ("l_px_col", self.l_px_col),
        ];
        for (name, value) in lengths {
            if !(value.is_finite() && value > 0.0) {
                return Err(ReconstructionError::Configuration(format!(
                    "{name} must be a positive length, got {value}"
                )));
            }
        }
        if !self.d_so.is_finite() || self.d_so == 0.0 {
            return Err(ReconstructionError::Configuration(format!(
                "d_so must be non-zero, got {}",
                self.d_so
            )));
        }
        let finite = [
            ("d_od", self.d_od),
            ("delta_s", self.delta_s),
            ("delta_t", self.delta_t),
            ("delta_phi", self.delta_phi),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(ReconstructionError::Configuration(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Distance source to detector.
    pub fn d_sd(&self) -> f32 {
        self.d_so.abs() + self.d_od.abs()
    }

    /// Horizontal detector offset in millimetres.
    pub fn delta_s_mm(&self) -> f32 {
        self.delta_s * self.l_px_row
    }

    /// Vertical detector offset in millimetres.
    pub fn delta_t_mm(&self) -> f32 {
        self.delta_t * self.l_px_col
    }

    /// Number of pixels in one projection.
    pub fn pixel_count(&self) -> usize {
        self.n_row as usize * self.n_col as usize
    }
}

/// Voxel box of the full volume that should be reconstructed instead of the whole volume.
///
/// Coordinates are half-open: `x1..x2`, `y1..y2`, `z1..z2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub x1: u32,
    pub x2: u32,
    pub y1: u32,
    pub y2: u32,
    pub z1: u32,
    pub z2: u32,
}

impl RegionOfInterest {
    /// Checks the box against the full volume dimensions.
    pub fn validate(&self, full: &VolumeGeometry) -> Result<()> {
        let axes = [
            ("x", self.x1, self.x2, full.dim_x),
            ("y", self.y1, self.y2, full.dim_y),
            ("z", self.z1, self.z2, full.dim_z),
        ];
        for (axis, lo, hi, dim) in axes {
            if lo >= hi {
                return Err(ReconstructionError::Configuration(format!(
                    "region of interest: {axis}1 ({lo}) must be smaller than {axis}2 ({hi})"
                )));
            }
            if hi > dim {
                return Err(ReconstructionError::Configuration(format!(
                    "region of interest: {axis}2 ({hi}) exceeds the volume extent {dim}"
                )));
            }
        }
        Ok(())
    }
}

/// Dimensions and voxel spacing of a volume or of one device slab.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub l_vx_x: f32,
    pub l_vx_y: f32,
    pub l_vx_z: f32,
    /// Axial offset of the slab inside the reconstructed volume.
    pub offset: u32,
}

impl VolumeGeometry {
    /// Number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.dim_x as usize * self.dim_y as usize * self.dim_z as usize
    }

    /// Number of voxels in one axial plane.
    pub fn plane_size(&self) -> usize {
        self.dim_x as usize * self.dim_y as usize
    }

    /// Size of the volume in bytes when stored as `f32`.
    pub fn byte_size(&self) -> usize {
        self.voxel_count() * std::mem::size_of::<f32>()
    }
}

/// Derives the full volume that the cone of the given detector can see.
///
/// The lateral field of view is the circle touched by the outermost rays; the voxel
/// size is chosen so that the volume has as many voxels across as the detector has
/// pixels per row. The axial extent is the detector height scaled back to the centre
/// of rotation.
///
/// # Parameters
/// - `detector`: The scanner configuration.
///
/// # Returns
/// A [VolumeGeometry] with offset 0, or a configuration error when the geometry
/// yields an empty volume.
pub fn make_volume_geometry(detector: &DetectorGeometry) -> Result<VolumeGeometry> {
    let n_row = detector.n_row as f32;
    let n_col = detector.n_col as f32;
    let l_px_row = detector.l_px_row;
    let l_px_col = detector.l_px_col;

    let delta_s = detector.delta_s_mm().abs();
    let delta_t = detector.delta_t_mm().abs();

    let d_so = detector.d_so.abs();
    let d_sd = detector.d_sd();

    let half_width = n_row * l_px_row / 2.0 + delta_s;
    let alpha = (half_width / d_sd).atan();
    let r = d_so * alpha.sin();

    let l_vx = r / (half_width / l_px_row);
    let dim_xy = (2.0 * r / l_vx) as u32;
    let dim_z = ((n_col * l_px_col / 2.0 + delta_t) * (d_so / d_sd) * (2.0 / l_vx)) as u32;

    if dim_xy == 0 || dim_z == 0 || !l_vx.is_finite() {
        return Err(ReconstructionError::Configuration(format!(
            "detector geometry yields an empty volume ({dim_xy}x{dim_xy}x{dim_z})"
        )));
    }

    let geometry = VolumeGeometry {
        dim_x: dim_xy,
        dim_y: dim_xy,
        dim_z,
        l_vx_x: l_vx,
        l_vx_y: l_vx,
        l_vx_z: l_vx,
        offset: 0,
    };
    info!(
        dim_x = geometry.dim_x,
        dim_y = geometry.dim_y,
        dim_z = geometry.dim_z,
        voxel_size = l_vx,
        "derived volume geometry"
    );
    Ok(geometry)
}

/// Shrinks the full volume to a region of interest.
///
/// # Returns
/// The geometry of the region, or a configuration error when the region does not fit.
pub fn apply_roi(full: &VolumeGeometry, roi: &RegionOfInterest) -> Result<VolumeGeometry> {
    roi.validate(full)?;
    let geometry = VolumeGeometry {
        dim_x: roi.x2 - roi.x1,
        dim_y: roi.y2 - roi.y1,
        dim_z: roi.z2 - roi.z1,
        ..*full
    };
    info!(
        dim_x = geometry.dim_x,
        dim_y = geometry.dim_y,
        dim_z = geometry.dim_z,
        "applied region of interest"
    );
    Ok(geometry)
}

/// Position of a voxel centre relative to the volume centre.
pub(crate) fn vol_centered_coordinate(coord: u32, dim: u32, size: f32) -> f32 {
    let size2 = size / 2.0;
    -(dim as f32 * size2) + size2 + coord as f32 * size
}

/// Maps a detector-plane position in millimetres to a fractional pixel coordinate.
pub(crate) fn proj_real_coordinate(coord: f32, dim: u32, size: f32, offset: f32) -> f32 {
    let size2 = size / 2.0;
    let min = -(dim as f32 * size2) - offset;
    (coord - min) / size - 0.5
}
