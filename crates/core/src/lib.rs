//! Temporal neural super-sampling pipeline.
//!
//! A rendered low-resolution frame (color, depth and optional motion) is
//! packed into a multi-frame tensor history on the GPU, run through a neural
//! network on an accelerator, and decoded back into a full-resolution
//! texture. [`upscaler::Upscaler`] drives the three stages for each frame.

pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod gpu;
pub mod history;
pub mod host;
pub mod logging;
pub mod model;
pub mod ort_backend;
pub mod preprocess;
pub mod reconstructor;
pub mod runtime;
pub mod upscaler;

pub use buffer::{AcceleratorAccess, SharedBuffer, SurfaceHandle};
pub use error::{ConfigurationError, GpuError, LoadError, PipelineError, ProcessError};
pub use model::{EmbeddedModel, ModelDescriptor, TensorLayout};
pub use upscaler::{FrameTicket, Upscaler, UpscalerStage};
