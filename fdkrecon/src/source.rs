use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ReconstructionConfig;
use crate::error::{ReconstructionError, Result};
use crate::pool::{BlockPool, PinnedHostAllocator};
use crate::projection::{Frame, HostProjection};
use crate::stage::{OutputFunction, Outlet, Producer, Stage, StreamItem};

/// Decodes detector files into frames.
///
/// Implementations must not hand out partially decoded frames: a file either yields
/// complete frames or an error.
pub trait ProjectionLoader: Send + 'static {
    /// Decodes all frames stored in `path`.
    fn load(&self, path: &Path) -> Result<Vec<Frame>>;

    /// Number of frames stored in `path`, without decoding pixel data.
    fn frame_count(&self, _path: &Path) -> Result<usize> {
        Ok(1)
    }
}

impl<L: ProjectionLoader + Sync> ProjectionLoader for Arc<L> {
    fn load(&self, path: &Path) -> Result<Vec<Frame>> {
        (**self).load(path)
    }

    fn frame_count(&self, path: &Path) -> Result<usize> {
        (**self).frame_count(path)
    }
}

/// Lists the regular files of `directory`, sorted by path.
pub fn list_projection_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let io_error = |source| ReconstructionError::Io {
        path: directory.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(directory).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// First stage of the pipeline: loads projections from disk.
///
/// Frames are numbered in file order; with `quality > 1` only every `quality`-th
/// frame is kept. Files the loader rejects are skipped with a warning.
pub struct SourceStage<L: ProjectionLoader> {
    loader: L,
    paths: Vec<PathBuf>,
    config: Arc<ReconstructionConfig>,
    pool: BlockPool<PinnedHostAllocator>,
    raw_count: usize,
    outlet: Outlet<HostProjection>,
}

impl<L: ProjectionLoader> SourceStage<L> {
    /// Creates the stage and counts the frames it will read.
    ///
    /// # Returns
    /// The stage, or a configuration error when an angle list does not cover every
    /// frame.
    pub fn new(loader: L, paths: Vec<PathBuf>, config: Arc<ReconstructionConfig>) -> Result<Self> {
        let mut raw_count = 0;
        for path in &paths {
            raw_count += loader.frame_count(path)?;
        }
        config.check_angle_coverage(raw_count)?;

        let pool = BlockPool::new(
            PinnedHostAllocator,
            config.detector().pixel_count(),
            config.pool_limit(),
        );
        info!(files = paths.len(), frames = raw_count, "found projections");
        Ok(SourceStage {
            loader,
            paths,
            config,
            pool,
            raw_count,
            outlet: Outlet::new("source"),
        })
    }

    /// Number of projections the stage will emit.
    pub fn num(&self) -> usize {
        self.raw_count.div_ceil(self.config.quality())
    }

    fn stage_frame(&self, frame: Frame, idx: usize) -> Result<HostProjection> {
        let detector = self.config.detector();
        if frame.width != detector.n_row || frame.height != detector.n_col {
            return Err(ReconstructionError::MalformedInput(format!(
                "projection {idx} is {}x{}, detector is {}x{}",
                frame.width, frame.height, detector.n_row, detector.n_col
            )));
        }
        if frame.data.len() != detector.pixel_count() {
            return Err(ReconstructionError::MalformedInput(format!(
                "projection {idx} carries {} values for {} pixels",
                frame.data.len(),
                detector.pixel_count()
            )));
        }
        let mut block = self.pool.acquire()?;
        block.copy_from_slice(&frame.data);
        Ok(HostProjection::new(
            block,
            frame.width,
            frame.height,
            idx,
            self.config.projection_angle(idx),
        ))
    }
}

impl<L: ProjectionLoader> Stage for SourceStage<L> {
    fn name(&self) -> &'static str {
        "source"
    }

    fn run(&mut self) -> Result<()> {
        let quality = self.config.quality();
        let mut raw = 0usize;
        let mut emitted = 0usize;
        for path in &self.paths {
            let expected = self.loader.frame_count(path)?;
            let frames = match self.loader.load(path) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable projection file");
                    raw += expected;
                    continue;
                }
            };
            for frame in frames {
                if raw % quality == 0 {
                    let projection = self.stage_frame(frame, raw / quality)?;
                    self.outlet.push(projection)?;
                    emitted += 1;
                }
                raw += 1;
            }
        }
        info!(emitted, "all projections loaded");
        self.outlet.push(HostProjection::sentinel())
    }
}

impl<L: ProjectionLoader> Producer for SourceStage<L> {
    type Output = HostProjection;

    fn set_output_function(&mut self, output: OutputFunction<HostProjection>) {
        self.outlet.connect(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DetectorGeometry;
    use std::sync::Mutex;

    struct Numbered;

    impl ProjectionLoader for Numbered {
        fn load(&self, path: &Path) -> Result<Vec<Frame>> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.starts_with("broken") {
                return Err(ReconstructionError::MalformedInput(name.to_string()));
            }
            let value: f32 = name.trim_start_matches('p').parse().unwrap();
            Ok(vec![Frame { data: vec![value; 4], width: 2, height: 2 }])
        }
    }

    fn config(quality: usize) -> Arc<ReconstructionConfig> {
        let detector = DetectorGeometry {
            n_row: 2,
            n_col: 2,
            l_px_row: 1.0,
            l_px_col: 1.0,
            delta_s: 0.0,
            delta_t: 0.0,
            d_so: 10.0,
            d_od: 10.0,
            delta_phi: 90.0,
        };
        Arc::new(ReconstructionConfig::new(detector).unwrap().with_quality(quality).unwrap())
    }

    fn collect(stage: &mut SourceStage<Numbered>) -> Vec<(usize, f32, f32)> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        stage.set_output_function(Box::new(move |p: HostProjection| {
            let entry = p.data().map(|d| (p.idx, p.phi, d[0]));
            sink.lock().unwrap().push(entry);
            true
        }));
        stage.run().unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.last().unwrap().is_none(), "stream must end with the sentinel");
        seen.iter().flatten().copied().collect()
    }

    #[test]
    fn quality_keeps_every_nth_projection() {
        let paths = (0..5).map(|i| PathBuf::from(format!("p{i}"))).collect();
        let mut stage = SourceStage::new(Numbered, paths, config(2)).unwrap();
        assert_eq!(stage.num(), 3);
        let seen = collect(&mut stage);
        let values: Vec<_> = seen.iter().map(|s| s.2).collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0]);
        let indices: Vec<_> = seen.iter().map(|s| s.0).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!((seen[1].1 - std::f32::consts::PI).abs() < 1e-6);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let paths = ["p0", "broken", "p2"].iter().map(PathBuf::from).collect();
        let mut stage = SourceStage::new(Numbered, paths, config(1)).unwrap();
        let values: Vec<_> = collect(&mut stage).iter().map(|s| s.2).collect();
        assert_eq!(values, vec![0.0, 2.0]);
    }

    #[test]
    fn lists_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tif", "a.tif", "c.tif"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        let names: Vec<_> = list_projection_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.tif", "b.tif", "c.tif"]);
    }
}
