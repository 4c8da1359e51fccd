use clap::{Parser, ValueEnum};
use fdkrecon::config::{read_angle_file, DEFAULT_CHANNEL_CAPACITY, DEFAULT_POOL_LIMIT};
use fdkrecon::source::list_projection_files;
use fdkrecon::{
    DetectorGeometry, Frame, ProjectionLoader, Reconstruction, ReconstructionConfig, ReconstructionError,
    RegionOfInterest, Volume, VolumeSink,
};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command line arguments structure.
#[derive(Parser, Debug)]
#[command(author, version, about = "CLI for multi-device FDK cone-beam reconstruction.")]
struct Args {
    /// Geometry file with `key = value` lines (n_row, n_col, l_px_row, l_px_col,
    /// delta_s, delta_t, d_so, d_od, delta_phi)
    #[arg(long)]
    geometry: PathBuf,

    /// Directory holding the projection images, read in file name order
    #[arg(long)]
    input: PathBuf,

    /// Output directory
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Base name of the output files (e.g. "vol" -> "vol.raw", or "vol_0000.png", ...)
    #[arg(long, default_value = "volume")]
    name: String,

    /// Optional file with one angle in degrees per projection
    #[arg(long)]
    angles: Option<PathBuf>,

    /// Use only every n-th projection
    #[arg(long, default_value_t = 1)]
    quality: usize,

    /// Number of devices to distribute the volume over
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Memory budget per device in MiB
    #[arg(long, default_value_t = 1024)]
    device_memory_mb: usize,

    /// Maximum number of projections held by each per-device pool
    #[arg(long, default_value_t = DEFAULT_POOL_LIMIT)]
    pool_limit: usize,

    /// Capacity of the queues between stages
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Region of interest in voxels: x1 x2 y1 y2 z1 z2
    #[arg(long, num_args = 6, value_names = ["X1", "X2", "Y1", "Y2", "Z1", "Z2"])]
    roi: Option<Vec<u32>>,

    /// Output format of the volume
    #[arg(long, value_enum, default_value_t = OutputFormat::Raw)]
    format: OutputFormat,

    /// Log every projection
    #[arg(long)]
    verbose: bool,
}

/// How the reconstructed volume is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One little-endian f32 file holding the voxel values unchanged
    Raw,
    /// 16-bit PNG slices, rescaled to the volume's value range (for previews)
    Png,
}

/// Reads projection images with the `image` crate.
struct ImageLoader;

impl ProjectionLoader for ImageLoader {
    fn load(&self, path: &Path) -> fdkrecon::Result<Vec<Frame>> {
        let img = image::open(path).map_err(|e| {
            ReconstructionError::MalformedInput(format!("cannot decode {}: {e}", path.display()))
        })?;
        let gray = img.into_luma16();
        let (width, height) = gray.dimensions();
        let data = gray.into_raw().into_iter().map(f32::from).collect();
        Ok(vec![Frame { data, width, height }])
    }
}

/// Stores a volume next to a small text header describing it.
struct VolumeWriter {
    directory: PathBuf,
    name: String,
    format: OutputFormat,
}

impl VolumeWriter {
    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReconstructionError + '_ {
        move |source| ReconstructionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write_header(&self, volume: &Volume) -> fdkrecon::Result<()> {
        let g = volume.geometry();
        let path = self.directory.join(format!("{}.txt", self.name));
        let text = format!(
            "dim_x = {}\ndim_y = {}\ndim_z = {}\nl_vx_x = {}\nl_vx_y = {}\nl_vx_z = {}\n",
            g.dim_x, g.dim_y, g.dim_z, g.l_vx_x, g.l_vx_y, g.l_vx_z
        );
        let text = match self.format {
            OutputFormat::Raw => text + "format = \"f32le\"\n",
            OutputFormat::Png => {
                let (min, max) = value_range(volume.data());
                text + &format!("format = \"png16\"\nmin = {min}\nmax = {max}\n")
            }
        };
        std::fs::write(&path, text).map_err(Self::io_error(&path))
    }

    fn write_raw(&self, volume: &Volume) -> fdkrecon::Result<()> {
        let path = self.directory.join(format!("{}.raw", self.name));
        info!("Writing volume {}", path.display());
        let file = File::create(&path).map_err(Self::io_error(&path))?;
        let mut out = BufWriter::new(file);
        for value in volume.data() {
            out.write_all(&value.to_le_bytes()).map_err(Self::io_error(&path))?;
        }
        out.flush().map_err(Self::io_error(&path))
    }

    fn write_slices(&self, volume: &Volume) -> fdkrecon::Result<()> {
        let g = volume.geometry();
        let (min, max) = value_range(volume.data());
        let range = if max > min { max - min } else { 1.0 };

        for z in 0..g.dim_z {
            let Some(slice) = volume.slice(z) else { break };
            let pixels: Vec<u16> = slice
                .iter()
                .map(|&v| ((v - min) / range * u16::MAX as f32).round() as u16)
                .collect();
            let path = self.directory.join(format!("{}_{:04}.png", self.name, z));
            let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(g.dim_x, g.dim_y, pixels)
                .ok_or_else(|| ReconstructionError::MalformedInput(format!("slice {z} has the wrong size")))?;
            img.save(&path).map_err(|e| {
                ReconstructionError::Io {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e),
                }
            })?;
        }
        info!("Wrote {} slices to {}", g.dim_z, self.directory.display());
        Ok(())
    }
}

impl VolumeSink for VolumeWriter {
    fn write(&mut self, volume: &Volume) -> fdkrecon::Result<()> {
        std::fs::create_dir_all(&self.directory).map_err(Self::io_error(&self.directory))?;
        self.write_header(volume)?;
        match self.format {
            OutputFormat::Raw => self.write_raw(volume),
            OutputFormat::Png => self.write_slices(volume),
        }
    }
}

/// Smallest and largest voxel value.
fn value_range(data: &[f32]) -> (f32, f32) {
    data.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn build_config(args: &Args) -> fdkrecon::Result<ReconstructionConfig> {
    let detector = DetectorGeometry::from_file(&args.geometry)?;
    let mut config = ReconstructionConfig::new(detector)?
        .with_devices(args.devices, args.device_memory_mb << 20)?
        .with_pool_limit(args.pool_limit)?
        .with_channel_capacity(args.channel_capacity)?
        .with_quality(args.quality)?;

    if let Some(path) = &args.angles {
        config = config.with_angles(read_angle_file(path)?)?;
    }
    if let Some(&[x1, x2, y1, y2, z1, z2]) = args.roi.as_deref() {
        config = config.with_roi(RegionOfInterest { x1, x2, y1, y2, z1, z2 })?;
    }
    Ok(config)
}

fn run(args: Args) -> fdkrecon::Result<()> {
    let config = build_config(&args)?;
    let paths = list_projection_files(&args.input)?;
    info!("Reading {} projection files from {}", paths.len(), args.input.display());

    let mut writer = VolumeWriter {
        directory: args.output,
        name: args.name,
        format: args.format,
    };
    Reconstruction::new(config).run_into(ImageLoader, paths, &mut writer)
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args) {
        error!("Reconstruction failed: {e}");
        std::process::exit(1);
    }
    info!("Done.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdkrecon::VolumeGeometry;

    fn volume() -> Volume {
        let geometry = VolumeGeometry {
            dim_x: 2,
            dim_y: 2,
            dim_z: 2,
            l_vx_x: 0.5,
            l_vx_y: 0.5,
            l_vx_z: 0.5,
            offset: 0,
        };
        Volume::new(vec![-3.25, 0.0, 1.0e-6, 7.5, 1234.5, -0.001, 42.0, 0.125], geometry)
    }

    #[test]
    fn raw_output_keeps_voxel_values() {
        let dir = tempfile::tempdir().unwrap();
        let volume = volume();
        let mut writer = VolumeWriter {
            directory: dir.path().to_path_buf(),
            name: "vol".to_string(),
            format: OutputFormat::Raw,
        };
        writer.write(&volume).unwrap();

        let bytes = std::fs::read(dir.path().join("vol.raw")).unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values, volume.data());

        let header = std::fs::read_to_string(dir.path().join("vol.txt")).unwrap();
        assert!(header.contains("dim_z = 2"));
        assert!(header.contains("format = \"f32le\""));
    }

    #[test]
    fn png_output_records_the_value_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = VolumeWriter {
            directory: dir.path().to_path_buf(),
            name: "vol".to_string(),
            format: OutputFormat::Png,
        };
        writer.write(&volume()).unwrap();

        assert!(dir.path().join("vol_0000.png").exists());
        assert!(dir.path().join("vol_0001.png").exists());
        let header = std::fs::read_to_string(dir.path().join("vol.txt")).unwrap();
        assert!(header.contains("min = -3.25"));
        assert!(header.contains("max = 1234.5"));
    }

    #[test]
    fn raw_is_the_default_format() {
        let args = Args::parse_from(["fdkrecon", "--geometry", "g.toml", "--input", "in"]);
        assert_eq!(args.format, OutputFormat::Raw);
        let args = Args::parse_from(["fdkrecon", "--geometry", "g.toml", "--input", "in", "--format", "png"]);
        assert_eq!(args.format, OutputFormat::Png);
    }
}
