//! Error types shared by every stage of the reconstruction pipeline.
//!
//! Low-level failures of the device layer ([`AllocationError`], [`TransferError`])
//! convert into [`ReconstructionError`] so stages can propagate them with `?`.

use std::path::PathBuf;

/// Failure of the raw allocator below the memory pools.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllocationError {
    /// The device has not enough free memory left for the request.
    #[error("device {device} is out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory {
        /// Ordinal of the device.
        device: usize,
        /// Requested size in bytes.
        requested: usize,
        /// Free bytes at the time of the request.
        available: usize,
    },
    /// A zero-sized block was requested.
    #[error("zero-sized allocation requested")]
    ZeroSized,
}

/// Failure of a host/device or device/device copy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    /// Source and destination sizes differ.
    #[error("transfer size mismatch: destination holds {expected} elements, source has {actual}")]
    SizeMismatch {
        /// Number of elements the destination can hold.
        expected: usize,
        /// Number of elements offered by the source.
        actual: usize,
    },
    /// The stream belongs to a different device than the buffer.
    #[error("stream of device {stream_device} used for a buffer on device {buffer_device}")]
    WrongDevice {
        /// Device that owns the stream.
        stream_device: usize,
        /// Device that owns the buffer.
        buffer_device: usize,
    },
}

/// Top-level error of a reconstruction run.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    /// A pool could not grow because device memory ran out.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(#[from] AllocationError),

    /// A device slab plus its working buffers does not fit the device budget.
    #[error("device {device} needs {required} bytes for its slab but has only {available} bytes")]
    InsufficientDeviceMemory {
        /// Ordinal of the device.
        device: usize,
        /// Bytes needed for the slab and working buffers.
        required: usize,
        /// Memory budget of the device.
        available: usize,
    },

    /// A copy between host and device memory failed.
    #[error("transfer failure: {0}")]
    TransferFailure(#[from] TransferError),

    /// Inconsistent geometry, angle list or region of interest.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The geometry file is not valid TOML or misses a key.
    #[error("malformed geometry file: {0}")]
    GeometryFormat(#[from] toml::de::Error),

    /// A projection does not have the structure the pipeline expects.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Reading a file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The downstream neighbour of a stage stopped before the stream ended.
    #[error("stage '{stage}' has no consumer left")]
    Disconnected {
        /// Name of the stage whose output was refused.
        stage: String,
    },

    /// A stage stopped abnormally (panic, unwired port).
    #[error("stage '{stage}' failed: {reason}")]
    StageFailed {
        /// Name of the stage.
        stage: String,
        /// What went wrong.
        reason: String,
    },
}

impl ReconstructionError {
    /// Shorthand for a [`ReconstructionError::StageFailed`].
    pub fn stage(stage: &str, reason: impl Into<String>) -> Self {
        ReconstructionError::StageFailed {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReconstructionError>;
