use tracing::info;

use crate::error::{ReconstructionError, Result};
use crate::geometry::{proj_real_coordinate, vol_centered_coordinate, DetectorGeometry, RegionOfInterest, VolumeGeometry};

/// Work assignment of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct SlabPlan {
    /// Ordinal of the device.
    pub device: usize,
    /// Slab dimensions; `offset` is the first slice in the reconstructed volume.
    pub geometry: VolumeGeometry,
    /// First detector row the slab can see.
    pub first_row: u32,
    /// Last detector row the slab can see, inclusive.
    pub last_row: u32,
}

impl SlabPlan {
    /// Number of detector rows the device needs per projection.
    pub fn rows(&self) -> u32 {
        self.last_row - self.first_row + 1
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.dim_z == 0
    }
}

/// Splits `extent` slices into `devices` contiguous slabs.
///
/// Every slab gets `extent / devices` slices, the last one also gets the remainder.
///
/// # Returns
/// `(offset, extent)` per device in ascending offset order.
pub fn partition(extent: u32, devices: usize) -> Vec<(u32, u32)> {
    let devices = devices.max(1) as u32;
    let share = extent / devices;
    (0..devices)
        .map(|d| {
            let offset = d * share;
            let len = if d + 1 == devices { extent - offset } else { share };
            (offset, len)
        })
        .collect()
}

/// One pass of the pipeline over all projections.
///
/// A chunk is a contiguous run of slices, split into one slab per device. Volumes
/// that do not fit the devices in a single pass are reconstructed chunk by chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    /// Chunk dimensions; `offset` is the first slice in the reconstructed volume.
    pub geometry: VolumeGeometry,
    /// One slab per device, in device order. Slab offsets count from the start of
    /// the reconstructed volume.
    pub slabs: Vec<SlabPlan>,
}

/// Assigns every device a slab of the volume and the detector rows it needs.
pub struct FeldkampScheduler<'a> {
    detector: &'a DetectorGeometry,
    full: VolumeGeometry,
    volume: VolumeGeometry,
    roi: Option<RegionOfInterest>,
}

impl<'a> FeldkampScheduler<'a> {
    /// # Parameters
    /// - `detector`: The scanner configuration.
    /// - `full`: Geometry of the full volume, used to centre coordinates.
    /// - `volume`: Geometry of the reconstructed volume (full volume or ROI).
    /// - `roi`: The region of interest, if any.
    pub fn new(
        detector: &'a DetectorGeometry,
        full: VolumeGeometry,
        volume: VolumeGeometry,
        roi: Option<RegionOfInterest>,
    ) -> Self {
        FeldkampScheduler { detector, full, volume, roi }
    }

    /// Bytes a device needs besides its slab: the preloader pool and the pool of
    /// sub-projections.
    pub fn working_memory(&self, pool_limit: usize, rows: u32) -> usize {
        let row_bytes = self.detector.n_row as usize * std::mem::size_of::<f32>();
        pool_limit * row_bytes * (self.detector.n_col as usize + rows as usize)
    }

    /// Splits the volume into chunks whose slabs fit every device.
    ///
    /// The number of chunks doubles until each slab plus its working buffers fits
    /// the budget of its device, or until a chunk is a single slice.
    ///
    /// # Parameters
    /// - `memory`: Memory budget of every device, in device order.
    /// - `pool_limit`: Pool size of the stages that keep projections on a device.
    ///
    /// # Returns
    /// The chunks in ascending offset order, or
    /// [ReconstructionError::InsufficientDeviceMemory] when even single-slice slabs
    /// do not fit.
    pub fn schedule(&self, memory: &[usize], pool_limit: usize) -> Result<Vec<ChunkPlan>> {
        if memory.is_empty() {
            return Err(ReconstructionError::Configuration(
                "no device to schedule on".to_string(),
            ));
        }
        let mut count = 1;
        let chunks = loop {
            match self.split(count, memory, pool_limit) {
                Ok(chunks) => break chunks,
                Err(e @ ReconstructionError::InsufficientDeviceMemory { .. }) if count >= self.volume.dim_z => {
                    return Err(e)
                }
                Err(ReconstructionError::InsufficientDeviceMemory { .. }) => {
                    count = (count * 2).min(self.volume.dim_z);
                }
                Err(e) => return Err(e),
            }
        };

        if chunks.len() > 1 {
            info!(chunks = chunks.len(), "volume does not fit the devices at once, splitting");
        }
        for chunk in &chunks {
            for plan in &chunk.slabs {
                info!(
                    device = plan.device,
                    offset = plan.geometry.offset,
                    slices = plan.geometry.dim_z,
                    first_row = plan.first_row,
                    last_row = plan.last_row,
                    "device slab"
                );
            }
        }
        Ok(chunks)
    }

    /// Plans `count` chunks, failing on the first slab that does not fit.
    fn split(&self, count: u32, memory: &[usize], pool_limit: usize) -> Result<Vec<ChunkPlan>> {
        let mut chunks = Vec::with_capacity(count as usize);
        for (chunk_offset, chunk_extent) in partition(self.volume.dim_z, count as usize) {
            if chunk_extent == 0 && count > 1 {
                continue;
            }
            let mut slabs = Vec::with_capacity(memory.len());
            for (device, ((offset, extent), &available)) in
                partition(chunk_extent, memory.len()).into_iter().zip(memory).enumerate()
            {
                let offset = chunk_offset + offset;
                let geometry = VolumeGeometry {
                    dim_z: extent,
                    offset,
                    ..self.volume
                };
                let (first_row, last_row) = self.rows_for(offset, extent);
                let plan = SlabPlan { device, geometry, first_row, last_row };

                if !plan.is_empty() {
                    let required = geometry.byte_size() + self.working_memory(pool_limit, plan.rows());
                    if required > available {
                        return Err(ReconstructionError::InsufficientDeviceMemory {
                            device,
                            required,
                            available,
                        });
                    }
                }
                slabs.push(plan);
            }
            let geometry = VolumeGeometry {
                dim_z: chunk_extent,
                offset: chunk_offset,
                ..self.volume
            };
            chunks.push(ChunkPlan { geometry, slabs });
        }
        Ok(chunks)
    }

    /// Detector rows hit by rays through slices `offset..offset + extent`.
    ///
    /// The slab edges are projected with the smallest and largest magnification any
    /// voxel of the volume can have, then widened by the interpolation footprint.
    fn rows_for(&self, offset: u32, extent: u32) -> (u32, u32) {
        let last = self.detector.n_col - 1;
        if extent == 0 {
            return (0, last);
        }

        let d_so = self.detector.d_so;
        let d_sd = self.detector.d_sd();
        let half_x = self.full.dim_x as f32 * self.full.l_vx_x / 2.0;
        let half_y = self.full.dim_y as f32 * self.full.l_vx_y / 2.0;
        let reach = half_x.hypot(half_y);
        if d_so <= reach {
            // the source sits inside the volume's bounding circle
            return (0, last);
        }

        let z1 = self.roi.map_or(0, |roi| roi.z1);
        let z_lo = vol_centered_coordinate(z1 + offset, self.full.dim_z, self.full.l_vx_z);
        let z_hi = vol_centered_coordinate(z1 + offset + extent - 1, self.full.dim_z, self.full.l_vx_z);
        let magnifications = [d_sd / (d_so + reach), d_sd / (d_so - reach)];

        let mut v_min = f32::INFINITY;
        let mut v_max = f32::NEG_INFINITY;
        for z in [z_lo, z_hi] {
            for m in magnifications {
                let v = proj_real_coordinate(
                    z * m,
                    self.detector.n_col,
                    self.detector.l_px_col,
                    self.detector.delta_t_mm(),
                );
                v_min = v_min.min(v);
                v_max = v_max.max(v);
            }
        }

        // bilinear interpolation reads floor(v) and floor(v) + 1, plus one row of slack
        let first = (v_min.floor() - 1.0).max(0.0);
        let last_needed = v_max.floor() + 2.0;
        if first > last as f32 {
            return (last, last);
        }
        if last_needed < 0.0 {
            return (0, 0);
        }
        (first as u32, (last_needed as u32).min(last))
    }
}

/// Stitches per-device slabs into one volume.
///
/// # Parameters
/// - `volume`: Geometry of the complete volume.
/// - `parts`: `(offset, voxels)` per slab, in any order.
///
/// # Returns
/// The voxels of the complete volume, or a stage error if the slabs leave gaps,
/// overlap, or do not fill the volume.
pub fn merge_partial_volumes(volume: &VolumeGeometry, mut parts: Vec<(u32, Vec<f32>)>) -> Result<Vec<f32>> {
    parts.sort_by_key(|(offset, _)| *offset);
    let plane = volume.plane_size();
    let mut merged = Vec::with_capacity(volume.voxel_count());
    for (offset, voxels) in parts {
        let expected_offset = merged.len() / plane.max(1);
        if offset as usize != expected_offset || voxels.len() % plane.max(1) != 0 {
            return Err(ReconstructionError::stage(
                "feldkamp",
                format!("slab at offset {offset} does not continue the volume at slice {expected_offset}"),
            ));
        }
        merged.extend_from_slice(&voxels);
    }
    if merged.len() != volume.voxel_count() {
        return Err(ReconstructionError::stage(
            "feldkamp",
            format!("merged {} voxels, volume has {}", merged.len(), volume.voxel_count()),
        ));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::make_volume_geometry;

    fn detector() -> DetectorGeometry {
        DetectorGeometry {
            n_row: 64,
            n_col: 64,
            l_px_row: 1.0,
            l_px_col: 1.0,
            delta_s: 0.0,
            delta_t: 0.0,
            d_so: 500.0,
            d_od: 250.0,
            delta_phi: 1.0,
        }
    }

    #[test]
    fn two_devices_split_evenly() {
        assert_eq!(partition(100, 2), vec![(0, 50), (50, 50)]);
    }

    #[test]
    fn remainder_goes_to_the_last_device() {
        assert_eq!(partition(10, 3), vec![(0, 3), (3, 3), (6, 4)]);
        assert_eq!(partition(1, 2), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn partition_is_complete_and_contiguous() {
        for extent in 0..200 {
            for devices in 1..9 {
                let slabs = partition(extent, devices);
                assert_eq!(slabs.len(), devices);
                assert_eq!(slabs.iter().map(|s| s.1).sum::<u32>(), extent);
                let mut next = 0;
                for (offset, len) in slabs {
                    if len > 0 {
                        assert_eq!(offset, next);
                        next += len;
                    }
                }
            }
        }
    }

    #[test]
    fn slabs_see_overlapping_row_ranges() {
        let det = detector();
        let full = make_volume_geometry(&det).unwrap();
        let scheduler = FeldkampScheduler::new(&det, full, full, None);
        let chunks = scheduler.schedule(&[1 << 30, 1 << 30], 2).unwrap();
        assert_eq!(chunks.len(), 1);
        let plans = &chunks[0].slabs;
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].geometry.offset, 0);
        assert_eq!(plans[1].geometry.offset, plans[0].geometry.dim_z);
        assert_eq!(plans[0].geometry.dim_z + plans[1].geometry.dim_z, full.dim_z);

        // lower slab starts at the bottom, upper slab ends at the top
        assert_eq!(plans[0].first_row, 0);
        assert_eq!(plans[1].last_row, det.n_col - 1);
        assert!(plans[0].last_row < det.n_col - 1);
        assert!(plans[1].first_row > 0);
        // the cone widens away from the centre, so both halves overlap in the middle
        assert!(plans[1].first_row <= plans[0].last_row);
    }

    #[test]
    fn slab_that_does_not_fit_is_rejected() {
        let det = detector();
        let full = make_volume_geometry(&det).unwrap();
        let scheduler = FeldkampScheduler::new(&det, full, full, None);
        let err = scheduler.schedule(&[1 << 30, 1024], 2).unwrap_err();
        assert!(matches!(
            err,
            ReconstructionError::InsufficientDeviceMemory { device: 1, .. }
        ));
    }

    #[test]
    fn hundred_slices_on_two_devices() {
        let det = detector();
        let full = make_volume_geometry(&det).unwrap();
        let volume = VolumeGeometry { dim_z: 100, ..full };
        let scheduler = FeldkampScheduler::new(&det, full, volume, None);
        let chunks = scheduler.schedule(&[1 << 30, 1 << 30], 2).unwrap();
        assert_eq!(chunks.len(), 1);
        let slabs: Vec<_> = chunks[0]
            .slabs
            .iter()
            .map(|p| (p.device, p.geometry.offset, p.geometry.dim_z))
            .collect();
        assert_eq!(slabs, vec![(0, 0, 50), (1, 50, 50)]);
    }

    #[test]
    fn volume_larger_than_the_device_is_split_into_chunks() {
        let det = detector();
        let full = make_volume_geometry(&det).unwrap();
        let scheduler = FeldkampScheduler::new(&det, full, full, None);
        let plane_bytes = full.plane_size() * std::mem::size_of::<f32>();
        let budget = full.byte_size() / 2 + plane_bytes + scheduler.working_memory(2, det.n_col);
        assert!(full.byte_size() + scheduler.working_memory(2, 1) > budget);

        let chunks = scheduler.schedule(&[budget], 2).unwrap();
        assert_eq!(chunks.len(), 2);
        let mut next = 0;
        for chunk in &chunks {
            assert_eq!(chunk.geometry.offset, next);
            assert_eq!(chunk.slabs.len(), 1);
            let slab = &chunk.slabs[0];
            assert_eq!((slab.geometry.offset, slab.geometry.dim_z), (next, chunk.geometry.dim_z));
            assert!(slab.geometry.byte_size() + scheduler.working_memory(2, slab.rows()) <= budget);
            next += chunk.geometry.dim_z;
        }
        assert_eq!(next, full.dim_z);
        // each chunk only needs the rows its slices project to
        assert!(chunks[0].slabs[0].last_row < det.n_col - 1);
        assert!(chunks[1].slabs[0].first_row > 0);
    }

    #[test]
    fn chunks_split_again_over_several_devices() {
        let det = detector();
        let full = make_volume_geometry(&det).unwrap();
        let scheduler = FeldkampScheduler::new(&det, full, full, None);
        let budget = full.byte_size() / 4 + scheduler.working_memory(2, det.n_col);
        let chunks = scheduler.schedule(&[budget, budget], 2).unwrap();
        assert!(chunks.len() >= 2);
        let mut next = 0;
        for chunk in &chunks {
            assert_eq!(chunk.slabs.len(), 2);
            for slab in chunk.slabs.iter().filter(|s| !s.is_empty()) {
                assert_eq!(slab.geometry.offset, next);
                next += slab.geometry.dim_z;
            }
        }
        assert_eq!(next, full.dim_z);
    }

    #[test]
    fn merging_two_slabs_of_ones() {
        let volume = VolumeGeometry {
            dim_x: 1,
            dim_y: 1,
            dim_z: 100,
            l_vx_x: 1.0,
            l_vx_y: 1.0,
            l_vx_z: 1.0,
            offset: 0,
        };
        let slabs = partition(100, 2);
        assert_eq!(slabs, vec![(0, 50), (50, 50)]);
        let parts = slabs
            .iter()
            .rev()
            .map(|&(offset, len)| (offset, vec![1.0; len as usize]))
            .collect();
        let merged = merge_partial_volumes(&volume, parts).unwrap();
        assert_eq!(merged, vec![1.0; 100]);
    }

    #[test]
    fn merging_with_a_gap_fails() {
        let volume = VolumeGeometry {
            dim_x: 2,
            dim_y: 1,
            dim_z: 4,
            l_vx_x: 1.0,
            l_vx_y: 1.0,
            l_vx_z: 1.0,
            offset: 0,
        };
        let parts = vec![(0, vec![0.0; 2]), (2, vec![0.0; 4])];
        assert!(merge_partial_volumes(&volume, parts).is_err());
    }
}
