//! Error taxonomy for the frame pipeline.
//!
//! Every component reports one of four error families. [`PipelineError`] is
//! the per-frame result the [`Upscaler`](crate::upscaler::Upscaler) hands back
//! to its caller and wraps all of them.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::buffer::SurfaceHandle;
use crate::gpu::{Extent, TextureFormat};
use crate::model::TensorLayout;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Misconfiguration detected at construction or attach time. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid model key: {0}")]
    InvalidModelKey(String),

    #[error("unsupported input channel count {0} (supported: 4, 5, 6, 7)")]
    UnsupportedChannelCount(usize),

    #[error("{what} resolution mismatch: expected {expected}, got {actual}")]
    ResolutionMismatch {
        what: &'static str,
        expected: Extent,
        actual: Extent,
    },

    #[error("{what} texture format {actual} is not accepted (expected {expected})")]
    FormatMismatch {
        what: &'static str,
        expected: String,
        actual: TextureFormat,
    },

    #[error("{what} buffer layout mismatch: expected {expected}, got {actual}")]
    LayoutMismatch {
        what: &'static str,
        expected: TensorLayout,
        actual: TensorLayout,
    },
}

/// Failure to bring an inference handle into the ready state.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model artifact not found: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("model artifact {} failed checksum verification: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("tensor `{name}` shape mismatch: model key declares {expected:?}, network has {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("tensor names mismatch: model key declares {expected:?}, network has {actual:?}")]
    TensorMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("failed to compile model {}: {source}", path.display())]
    Backend {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// Per-call inference failure. The output buffer is undefined afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("inference handle is not loaded; call load() first")]
    NotLoaded,

    #[error("input and output buffers are not attached")]
    NotAttached,

    #[error("tensor `{name}` shape mismatch at run time: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("accelerator fault: {0}")]
    AcceleratorFault(String),

    #[error("accelerator resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("shared buffer {0} is already locked for accelerator access")]
    BufferBusy(SurfaceHandle),

    #[error("accelerator worker is no longer running")]
    WorkerStopped,
}

/// Failure of an enqueued GPU command, surfaced when a submission is waited.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("surface {0} is locked for accelerator access")]
    SurfaceBusy(SurfaceHandle),

    #[error("access of {len} bytes at offset {offset} exceeds surface length {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("texel data length {actual} does not match texture size {expected}")]
    TexelCountMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("command `{label}` failed: {source}")]
    CommandFailed {
        label: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("command queue has shut down")]
    QueueClosed,
}

impl GpuError {
    pub fn command_failed(label: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::CommandFailed {
            label: label.into(),
            source: Arc::from(source.into()),
        }
    }
}

/// Single failure result of one processed frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("frame {frame} was discarded before its command stream was committed")]
    FrameDiscarded { frame: u64 },

    #[error("frame {frame} reached the GPU after frame {newer}; commit frames in recording order")]
    OutOfOrder { frame: u64, newer: u64 },
}

impl PipelineError {
    /// The inference failure behind this error, if that is what it is.
    pub fn as_process(&self) -> Option<&ProcessError> {
        match self {
            Self::Process(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Self::Process(ProcessError::NotLoaded))
    }
}
