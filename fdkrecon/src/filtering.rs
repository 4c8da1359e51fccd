use std::f32::consts::PI;

use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;
use tracing::{debug, info};

use crate::error::{ReconstructionError, Result};
use crate::fft::{bins, make_forward_plan, make_inverse_plan, ForwardPlan, InversePlan};
use crate::projection::DeviceProjection;
use crate::stage::{Consumer, InputFunction, Inlet, OutputFunction, Outlet, Producer, Stage, StreamItem};

/// Padded transform length for rows of `n_row` pixels: twice the next power of two.
pub fn filter_size(n_row: u32) -> usize {
    2 * (n_row.max(1) as usize).next_power_of_two()
}

/// Frequency response of the ramp (Ram-Lak) filter.
///
/// The filter is sampled in the spatial domain on `size` taps with spacing `tau`
/// and transformed, which avoids the DC error of a sampled `|f|`.
///
/// # Parameters
/// - `size`: Transform length, even.
/// - `tau`: Detector pixel pitch along a row.
///
/// # Returns
/// `size / 2 + 1` real weights, one per frequency bin.
pub fn make_filter(size: usize, tau: f32) -> Vec<f32> {
    let half = size as i64 / 2;
    let first = -(half - 1);
    let mut taps: Vec<Complex32> = (first..=half)
        .map(|j| {
            let value = if j == 0 {
                1.0 / (8.0 * tau * tau)
            } else if j % 2 == 0 {
                0.0
            } else {
                let j = j as f32;
                -1.0 / (2.0 * j * j * PI * PI * tau * tau)
            };
            Complex32::new(value, 0.0)
        })
        .collect();

    FftPlanner::new().plan_fft_forward(size).process(&mut taps);
    taps[..bins(size)].iter().map(|c| tau * c.norm()).collect()
}

/// Applies the ramp filter to every row of a weighted projection.
///
/// Rows are zero-padded to [filter_size], transformed as one batch, scaled by the
/// filter response and transformed back. Plans and scratch buffers are allocated
/// once when the stage is created.
pub struct FilterStage {
    n_row: usize,
    n_col: usize,
    size: usize,
    filter: Vec<f32>,
    forward: ForwardPlan,
    inverse: InversePlan,
    padded: Vec<f32>,
    spectrum: Vec<Complex32>,
    inlet: Inlet<DeviceProjection>,
    outlet: Outlet<DeviceProjection>,
}

impl FilterStage {
    /// Builds the filter and the transform plans for an `n_row` x `n_col` detector.
    pub fn new(n_row: u32, n_col: u32, l_px_row: f32) -> Result<Self> {
        let size = filter_size(n_row);
        let filter = make_filter(size, l_px_row);
        Self::with_filter(n_row, n_col, filter)
    }

    /// Builds the stage around an explicit frequency response of `filter_size(n_row) / 2 + 1` bins.
    pub fn with_filter(n_row: u32, n_col: u32, filter: Vec<f32>) -> Result<Self> {
        let size = filter_size(n_row);
        if filter.len() != bins(size) {
            return Err(ReconstructionError::Configuration(format!(
                "filter has {} bins, transform of length {size} needs {}",
                filter.len(),
                bins(size)
            )));
        }
        let (n_row, n_col) = (n_row as usize, n_col as usize);
        let forward = make_forward_plan(size, n_col, size, bins(size))?;
        let inverse = make_inverse_plan(size, n_col, bins(size), size)?;
        info!(size, rows = n_col, "filter plans created");
        Ok(FilterStage {
            n_row,
            n_col,
            size,
            filter,
            forward,
            inverse,
            padded: vec![0.0; size * n_col],
            spectrum: vec![Complex32::default(); bins(size) * n_col],
            inlet: Inlet::new("filtering"),
            outlet: Outlet::new("filtering"),
        })
    }

    /// Filters one row-major image in place.
    pub fn filter(&mut self, data: &mut [f32]) -> Result<()> {
        if data.len() != self.n_row * self.n_col {
            return Err(ReconstructionError::MalformedInput(format!(
                "filter expects {} pixels, got {}",
                self.n_row * self.n_col,
                data.len()
            )));
        }

        self.padded.fill(0.0);
        for (dst, src) in self.padded.chunks_exact_mut(self.size).zip(data.chunks_exact(self.n_row)) {
            dst[..self.n_row].copy_from_slice(src);
        }

        self.forward.execute(&self.padded, &mut self.spectrum)?;
        for row in self.spectrum.chunks_exact_mut(self.filter.len()) {
            for (c, &k) in row.iter_mut().zip(&self.filter) {
                *c *= k;
            }
        }
        self.inverse.execute(&mut self.spectrum, &mut self.padded)?;

        let norm = 1.0 / self.size as f32;
        for (dst, src) in data.chunks_exact_mut(self.n_row).zip(self.padded.chunks_exact(self.size)) {
            for (d, &s) in dst.iter_mut().zip(&src[..self.n_row]) {
                *d = s * norm;
            }
        }
        Ok(())
    }
}

impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        "filtering"
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let mut projection = self.inlet.pull()?;
            if projection.is_sentinel() {
                break;
            }
            let idx = projection.idx;
            if let Some(data) = projection.data_mut() {
                self.filter(data)?;
            }
            debug!(projection = idx, "projection filtered");
            self.outlet.push(projection)?;
        }
        self.outlet.push(DeviceProjection::sentinel())
    }
}

impl Consumer for FilterStage {
    type Input = DeviceProjection;

    fn set_input_function(&mut self, input: InputFunction<DeviceProjection>) {
        self.inlet.connect(input);
    }
}

impl Producer for FilterStage {
    type Output = DeviceProjection;

    fn set_output_function(&mut self, output: OutputFunction<DeviceProjection>) {
        self.outlet.connect(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Mutex};

    #[test]
    fn filter_size_is_twice_next_power_of_two() {
        assert_eq!(filter_size(100), 256);
        assert_eq!(filter_size(128), 256);
        assert_eq!(filter_size(1), 2);
    }

    #[test]
    fn ramp_suppresses_dc_and_grows_with_frequency() {
        let size = 64;
        let k = make_filter(size, 1.0);
        assert_eq!(k.len(), 33);
        assert!(k[0] < 0.05 * k[size / 2]);
        assert!(k[4] < k[8] && k[8] < k[16]);
    }

    #[test]
    fn identity_filter_reproduces_projection() {
        let (n_row, n_col) = (20u32, 6u32);
        let size = filter_size(n_row);
        let mut stage = FilterStage::with_filter(n_row, n_col, vec![1.0; bins(size)]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let original: Vec<f32> = (0..n_row * n_col).map(|_| rng.gen_range(0.0..10.0)).collect();
        let mut data = original.clone();
        stage.filter(&mut data).unwrap();
        for (a, b) in original.iter().zip(&data) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn ramp_filter_removes_constant_rows() {
        let mut stage = FilterStage::new(32, 2, 1.0).unwrap();
        let mut data = vec![5.0; 64];
        stage.filter(&mut data).unwrap();
        // a constant row loses most of its energy; only edge effects remain
        let centre = data[16].abs();
        assert!(centre < 0.5, "centre value {centre}");
    }

    #[test]
    fn sentinel_alone_is_forwarded() {
        let mut stage = FilterStage::new(8, 4, 1.0).unwrap();
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        stage.set_input_function(Box::new(DeviceProjection::sentinel));
        stage.set_output_function(Box::new(move |p: DeviceProjection| {
            sink.lock().unwrap().push(p.is_sentinel());
            true
        }));
        stage.run().unwrap();
        assert_eq!(*out.lock().unwrap(), vec![true]);
    }
}
