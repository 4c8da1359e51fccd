//! # fdkrecon Library
//!
//! The `fdkrecon` library reconstructs 3D volumes from cone-beam CT projections with
//! the Feldkamp-Davis-Kress (FDK) filtered backprojection, spreading the work over
//! several accelerator devices. Projections flow through a chain of stages, each on
//! its own thread, connected by bounded channels:
//!
//! `source -> preloader -> weighting -> filtering -> feldkamp -> sink`
//!
//! ## Overview of Modules
//!
//! - **`reconstruction`**: Builds the stage chain for a configuration and runs it.
//!
//! - **`config`**: The immutable run configuration and the angle file parser.
//!
//! - **`geometry`**: Detector geometry (parsed from `key = value` files), derived
//!   volume geometry and the region of interest.
//!
//! - **`device`**: Emulated accelerators with a fixed memory budget, device buffers
//!   and execution streams.
//!
//! - **`pool`**: Bounded pools of fixed-size blocks on a device or in pinned host
//!   memory. Blocks return to their pool when dropped.
//!
//! - **`projection`**: The move-only projection travelling through the pipeline; a
//!   projection without buffer is the end-of-stream sentinel.
//!
//! - **`stage`** and **`pipeline`**: The producer/consumer stage traits and the
//!   driver that connects and runs stages.
//!
//! - **`source`**, **`preloader`**, **`weighting`**, **`filtering`**, **`feldkamp`**:
//!   The stages of the reconstruction.
//!
//! - **`fft`**: Batched real/complex transform plans used by the filter.
//!
//! - **`scheduler`**: Splits the volume into one axial slab per device and stitches
//!   the slabs back together.
//!
//! - **`volume`**: The reconstructed volume, the sink stage and the [volume::VolumeSink]
//!   trait for storing results.
//!
//! - **`error`**: Error types and the crate's `Result` alias.

pub mod config;
pub mod device;
pub mod error;
pub mod feldkamp;
pub mod fft;
pub mod filtering;
pub mod geometry;
pub mod pipeline;
pub mod pool;
pub mod preloader;
pub mod projection;
pub mod reconstruction;
pub mod scheduler;
pub mod source;
pub mod stage;
pub mod volume;
pub mod weighting;

pub use config::ReconstructionConfig;
pub use error::{ReconstructionError, Result};
pub use geometry::{DetectorGeometry, RegionOfInterest, VolumeGeometry};
pub use projection::Frame;
pub use reconstruction::Reconstruction;
pub use source::ProjectionLoader;
pub use volume::{Volume, VolumeSink};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
