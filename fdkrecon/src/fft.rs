//! Batched real-to-complex and complex-to-real transforms
//!
//! Plans are built once and reused for every projection. A plan covers `batch`
//! rows of length `n`; rows start `input_distance` (resp. `output_distance`)
//! elements apart, so rows of a padded buffer can be transformed in place.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::{ReconstructionError, Result};

/// Number of complex bins of a real transform of length `n`.
pub fn bins(n: usize) -> usize {
    n / 2 + 1
}

/// Layout shared by forward and inverse plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLayout {
    /// Transform length.
    pub n: usize,
    /// Number of rows per execution.
    pub batch: usize,
    /// Elements between the starts of two input rows.
    pub input_distance: usize,
    /// Elements between the starts of two output rows.
    pub output_distance: usize,
}

impl PlanLayout {
    fn check(&self, input_row: usize, output_row: usize) -> Result<()> {
        if self.n == 0 || self.batch == 0 {
            return Err(ReconstructionError::Configuration(format!(
                "transform plan needs a non-zero length and batch, got n={} batch={}",
                self.n, self.batch
            )));
        }
        if self.input_distance < input_row || self.output_distance < output_row {
            return Err(ReconstructionError::Configuration(format!(
                "transform row distances {}/{} are shorter than the rows {}/{}",
                self.input_distance, self.output_distance, input_row, output_row
            )));
        }
        Ok(())
    }

    fn check_buffers(&self, input_len: usize, output_len: usize) -> Result<()> {
        let needed_in = self.input_distance * self.batch;
        let needed_out = self.output_distance * self.batch;
        if input_len < needed_in || output_len < needed_out {
            return Err(ReconstructionError::stage(
                "filtering",
                format!(
                    "transform buffers hold {input_len}/{output_len} elements, plan needs {needed_in}/{needed_out}"
                ),
            ));
        }
        Ok(())
    }
}

/// Batched real-to-complex transform.
pub struct ForwardPlan {
    layout: PlanLayout,
    fft: Arc<dyn Fft<f32>>,
}

/// Batched complex-to-real transform (unnormalized).
pub struct InversePlan {
    layout: PlanLayout,
    fft: Arc<dyn Fft<f32>>,
}

/// Builds a forward plan; input rows hold `n` reals, output rows `n/2 + 1` bins.
pub fn make_forward_plan(n: usize, batch: usize, input_distance: usize, output_distance: usize) -> Result<ForwardPlan> {
    let layout = PlanLayout { n, batch, input_distance, output_distance };
    layout.check(n, bins(n))?;
    let fft = FftPlanner::new().plan_fft_forward(n);
    Ok(ForwardPlan { layout, fft })
}

/// Builds an inverse plan; input rows hold `n/2 + 1` bins, output rows `n` reals.
pub fn make_inverse_plan(n: usize, batch: usize, input_distance: usize, output_distance: usize) -> Result<InversePlan> {
    let layout = PlanLayout { n, batch, input_distance, output_distance };
    layout.check(bins(n), n)?;
    let fft = FftPlanner::new().plan_fft_inverse(n);
    Ok(InversePlan { layout, fft })
}

impl ForwardPlan {
    pub fn layout(&self) -> PlanLayout {
        self.layout
    }

    /// Transforms every row of `input` into `output`. `input` is left untouched.
    pub fn execute(&self, input: &[f32], output: &mut [Complex32]) -> Result<()> {
        let PlanLayout { n, batch, input_distance, output_distance } = self.layout;
        self.layout.check_buffers(input.len(), output.len())?;
        let half = bins(n);

        input
            .par_chunks(input_distance)
            .zip(output.par_chunks_mut(output_distance))
            .take(batch)
            .for_each_init(
                || vec![Complex32::default(); n],
                |row, (src, dst)| {
                    for (c, &x) in row.iter_mut().zip(&src[..n]) {
                        *c = Complex32::new(x, 0.0);
                    }
                    self.fft.process(row);
                    dst[..half].copy_from_slice(&row[..half]);
                },
            );
        Ok(())
    }
}

impl InversePlan {
    pub fn layout(&self) -> PlanLayout {
        self.layout
    }

    /// Transforms every row of `input` into `output`.
    ///
    /// Takes `input` mutably so callers can reuse it as scratch. The result is not
    /// scaled, so a forward/inverse pair multiplies by `n`.
    pub fn execute(&self, input: &mut [Complex32], output: &mut [f32]) -> Result<()> {
        let PlanLayout { n, batch, input_distance, output_distance } = self.layout;
        self.layout.check_buffers(input.len(), output.len())?;
        let half = bins(n);

        input
            .par_chunks_mut(input_distance)
            .zip(output.par_chunks_mut(output_distance))
            .take(batch)
            .for_each_init(
                || vec![Complex32::default(); n],
                |row, (src, dst)| {
                    // rebuild the full Hermitian spectrum from the stored half
                    row[..half].copy_from_slice(&src[..half]);
                    for k in half..n {
                        row[k] = src[n - k].conj();
                    }
                    self.fft.process(row);
                    for (x, c) in dst[..n].iter_mut().zip(row.iter()) {
                        *x = c.re;
                    }
                },
            );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn forward_then_inverse_reproduces_rows() {
        let (n, batch, distance) = (32, 3, 40);
        let mut rng = StdRng::seed_from_u64(7);
        let mut input = vec![0.0f32; distance * batch];
        for row in input.chunks_mut(distance) {
            for x in &mut row[..n] {
                *x = rng.gen_range(-1.0..1.0);
            }
        }
        let original = input.clone();

        let forward = make_forward_plan(n, batch, distance, bins(n)).unwrap();
        assert_eq!(
            forward.layout(),
            PlanLayout { n, batch, input_distance: distance, output_distance: bins(n) }
        );
        let inverse = make_inverse_plan(n, batch, bins(n), distance).unwrap();
        assert_eq!(inverse.layout().output_distance, distance);
        let mut spectrum = vec![Complex32::default(); bins(n) * batch];
        forward.execute(&input, &mut spectrum).unwrap();
        assert_eq!(input, original, "forward transform must preserve its input");

        let mut restored = vec![0.0f32; distance * batch];
        inverse.execute(&mut spectrum, &mut restored).unwrap();
        for (row_in, row_out) in original.chunks(distance).zip(restored.chunks(distance)) {
            for (a, b) in row_in[..n].iter().zip(&row_out[..n]) {
                assert!((a - b / n as f32).abs() < 1e-5, "{a} vs {}", b / n as f32);
            }
        }
    }

    #[test]
    fn constant_row_has_only_dc() {
        let forward = make_forward_plan(8, 1, 8, 5).unwrap();
        let mut spectrum = vec![Complex32::default(); 5];
        forward.execute(&[1.0; 8], &mut spectrum).unwrap();
        assert!((spectrum[0].re - 8.0).abs() < 1e-6);
        assert!(spectrum[1..].iter().all(|c| c.norm() < 1e-6));
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        assert!(make_forward_plan(0, 1, 1, 1).is_err());
        assert!(make_forward_plan(16, 1, 8, 9).is_err());
        assert!(make_inverse_plan(16, 1, 4, 16).is_err());
        let plan = make_forward_plan(8, 2, 8, 5).unwrap();
        let mut out = vec![Complex32::default(); 5];
        assert!(plan.execute(&[0.0; 16], &mut out).is_err());
    }
}
