use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ReconstructionError, Result};
use crate::geometry::DetectorGeometry;
use crate::projection::DeviceProjection;
use crate::stage::{Consumer, InputFunction, Inlet, OutputFunction, Outlet, Producer, Stage, StreamItem};

/// Cone-beam weight of detector pixel `(s, t)`.
///
/// `s` counts pixels along a row, `t` counts rows. `h_min` and `v_min` are the
/// detector edges in millimetres, `d_sd` the source to detector distance.
pub fn weight(s: u32, t: u32, h_min: f32, v_min: f32, d_sd: f32, l_px_row: f32, l_px_col: f32) -> f32 {
    let h_s = l_px_row / 2.0 + s as f32 * l_px_row + h_min;
    let v_t = l_px_col / 2.0 + t as f32 * l_px_col + v_min;
    d_sd / (d_sd * d_sd + h_s * h_s + v_t * v_t).sqrt()
}

/// Multiplies every pixel of a row-major image by its cone-beam weight.
pub fn apply_weights(data: &mut [f32], width: u32, height: u32, detector: &DetectorGeometry) {
    let h_min = detector.delta_s * detector.l_px_row - width as f32 * detector.l_px_row / 2.0;
    let v_min = detector.delta_t * detector.l_px_col - height as f32 * detector.l_px_col / 2.0;
    let d_sd = detector.d_sd();

    for (t, row) in data.chunks_exact_mut(width as usize).enumerate() {
        for (s, value) in row.iter_mut().enumerate() {
            *value *= weight(
                s as u32,
                t as u32,
                h_min,
                v_min,
                d_sd,
                detector.l_px_row,
                detector.l_px_col,
            );
        }
    }
}

/// Applies the cone-beam weighting on every device in parallel.
///
/// Incoming projections are routed to the queue of the device they live on and
/// processed by one worker per device. The sentinel is forwarded after every queue
/// has drained.
pub struct WeightingStage {
    detector: Arc<DetectorGeometry>,
    device_count: usize,
    queue_capacity: usize,
    inlet: Mutex<Inlet<DeviceProjection>>,
    outlet: Mutex<Outlet<DeviceProjection>>,
}

impl WeightingStage {
    pub fn new(detector: Arc<DetectorGeometry>, device_count: usize, queue_capacity: usize) -> Self {
        WeightingStage {
            detector,
            device_count: device_count.max(1),
            queue_capacity: queue_capacity.max(1),
            inlet: Mutex::new(Inlet::new("weighting")),
            outlet: Mutex::new(Outlet::new("weighting")),
        }
    }

    /// Takes one projection from the queue of `device_index`, weights it and pushes
    /// it downstream.
    ///
    /// # Returns
    /// `Ok(false)` once the queue is closed and empty.
    pub fn process(&self, device_index: usize, queue: &Receiver<DeviceProjection>) -> Result<bool> {
        let Ok(mut projection) = queue.recv() else {
            return Ok(false);
        };
        if projection.device() != device_index {
            return Err(ReconstructionError::stage(
                "weighting",
                format!(
                    "projection {} of device {} queued for device {device_index}",
                    projection.idx,
                    projection.device()
                ),
            ));
        }
        let (width, height, idx) = (projection.width, projection.height, projection.idx);
        if let Some(data) = projection.data_mut() {
            apply_weights(data, width, height, &self.detector);
        }
        debug!(projection = idx, device = device_index, "projection weighted");
        self.outlet.lock().push(projection)?;
        Ok(true)
    }
}

impl Stage for WeightingStage {
    fn name(&self) -> &'static str {
        "weighting"
    }

    fn run(&mut self) -> Result<()> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..self.device_count).map(|_| bounded(self.queue_capacity)).unzip();
        let this = &*self;

        let result = thread::scope(|scope| {
            let workers: Vec<_> = receivers
                .into_iter()
                .enumerate()
                .map(|(device, queue)| {
                    scope.spawn(move || -> Result<()> {
                        while this.process(device, &queue)? {}
                        Ok(())
                    })
                })
                .collect();

            let dispatched = (|| -> Result<()> {
                let mut inlet = this.inlet.lock();
                loop {
                    let projection = inlet.pull()?;
                    if projection.is_sentinel() {
                        return Ok(());
                    }
                    let device = projection.device();
                    let queue = senders.get(device).ok_or_else(|| {
                        ReconstructionError::stage("weighting", format!("no queue for device {device}"))
                    })?;
                    queue.send(projection).map_err(|_| {
                        ReconstructionError::stage("weighting", format!("worker of device {device} stopped"))
                    })?;
                }
            })();
            drop(senders);

            let mut result = Ok(());
            for worker in workers {
                let outcome = worker
                    .join()
                    .unwrap_or_else(|_| Err(ReconstructionError::stage("weighting", "worker panicked")));
                if let Err(e) = outcome {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            // a worker failure explains a failed dispatch, so report it first
            result.and(dispatched)
        });

        result?;
        self.outlet.lock().push(DeviceProjection::sentinel())
    }
}

impl Consumer for WeightingStage {
    type Input = DeviceProjection;

    fn set_input_function(&mut self, input: InputFunction<DeviceProjection>) {
        self.inlet.get_mut().connect(input);
    }
}

impl Producer for WeightingStage {
    type Output = DeviceProjection;

    fn set_output_function(&mut self, output: OutputFunction<DeviceProjection>) {
        self.outlet.lock().connect(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::pool::BlockPool;
    use std::sync::Mutex as StdMutex;

    fn detector(n_row: u32, n_col: u32) -> DetectorGeometry {
        DetectorGeometry {
            n_row,
            n_col,
            l_px_row: 0.2,
            l_px_col: 0.2,
            delta_s: 0.0,
            delta_t: 0.0,
            d_so: 100.0,
            d_od: 50.0,
            delta_phi: 1.0,
        }
    }

    #[test]
    fn weight_is_one_on_the_central_ray() {
        // odd detector: the centre of pixel (2, 2) lies on the central ray
        let g = detector(5, 5);
        let h_min = -2.5 * g.l_px_row;
        let v_min = -2.5 * g.l_px_col;
        let w = weight(2, 2, h_min, v_min, g.d_sd(), g.l_px_row, g.l_px_col);
        assert!((w - 1.0).abs() < 1e-6);
        assert!(weight(0, 0, h_min, v_min, g.d_sd(), g.l_px_row, g.l_px_col) < w);
    }

    #[test]
    fn weighting_is_deterministic() {
        let g = detector(16, 8);
        let input: Vec<f32> = (0..128).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut a = input.clone();
        let mut b = input;
        apply_weights(&mut a, 16, 8, &g);
        apply_weights(&mut b, 16, 8, &g);
        assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn weights_are_symmetric_around_the_centre() {
        let g = detector(8, 4);
        let mut data = vec![1.0; 32];
        apply_weights(&mut data, 8, 4, &g);
        for t in 0..4 {
            for s in 0..4 {
                let left = data[t * 8 + s];
                let right = data[t * 8 + 7 - s];
                assert!((left - right).abs() < 1e-6);
            }
        }
    }

    fn run_stage(devices: &[Device], count: usize) -> Vec<DeviceProjection> {
        let pools: Vec<_> = devices.iter().map(|d| BlockPool::new(d.clone(), 32, count.max(1))).collect();
        let mut input: Vec<DeviceProjection> = (0..count)
            .map(|i| {
                let device = &devices[i % devices.len()];
                let mut block = pools[device.ordinal()].acquire().unwrap();
                block.fill(1.0);
                DeviceProjection::on_device(block, 8, 4, i, 0.0, device.create_stream())
            })
            .collect();
        input.push(DeviceProjection::sentinel());
        input.reverse();

        let out = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let mut stage = WeightingStage::new(Arc::new(detector(8, 4)), devices.len(), 2);
        stage.set_input_function(Box::new(move || input.pop().unwrap_or_else(DeviceProjection::sentinel)));
        stage.set_output_function(Box::new(move |p: DeviceProjection| {
            sink.lock().unwrap().push(p);
            true
        }));
        stage.run().unwrap();
        let mut out = out.lock().unwrap();
        std::mem::take(&mut *out)
    }

    #[test]
    fn sentinel_comes_last_after_all_devices_drained() {
        let devices = Device::enumerate(3, 1 << 16);
        let out = run_stage(&devices, 12);
        assert_eq!(out.len(), 13);
        assert!(out[12].is_sentinel());
        let mut indices: Vec<_> = out[..12].iter().map(|p| p.idx).collect();
        indices.sort();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());

        let mut expected = vec![1.0; 32];
        apply_weights(&mut expected, 8, 4, &detector(8, 4));
        assert!(out[..12].iter().all(|p| p.data().unwrap() == expected.as_slice()));
    }

    #[test]
    fn per_device_order_is_preserved() {
        let devices = Device::enumerate(2, 1 << 16);
        let out = run_stage(&devices, 10);
        for device in 0..2 {
            let order: Vec<_> = out.iter().filter(|p| p.is_valid() && p.device() == device).map(|p| p.idx).collect();
            let mut sorted = order.clone();
            sorted.sort();
            assert_eq!(order, sorted);
        }
    }

    #[test]
    fn sentinel_alone_does_no_work() {
        let devices = Device::enumerate(2, 1 << 16);
        let out = run_stage(&devices, 0);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_sentinel());
    }
}
