//! Explicit host-engine integration state.
//!
//! A [`HostSession`] is created when the host reports a ready device and
//! lives until shutdown. Between those two events the host binds textures and
//! asks for one super-sampled frame per render tick.
//!
//! The engine owns the tracing subscriber; [`host_log_file`] hands it the
//! `nss-host` rolling file to plug in as a writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{BackendKind, NssConfig, PipelineConfig};
use crate::decoder::AcceleratorOutputDecoder;
use crate::error::PipelineError;
use crate::gpu::{CommandQueue, Device, Texture};
use crate::logging::{self, LogFile, LogMode, LoggingError};
use crate::model::ModelDescriptor;
use crate::ort_backend::{ExecutionProvider, OrtBackend};
use crate::preprocess::{InputFormats, MultiFrameRgbdMotionPreprocessor};
use crate::reconstructor::{InferenceBackend, Reconstructor, ReferenceBackend};
use crate::upscaler::Upscaler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperSamplingOutcome {
    Processed,
    /// A required texture was not bound or the session was shut down.
    Skipped,
}

/// Opens the host-mode log file under `<data_dir>/logs`.
pub fn host_log_file(data_dir: &Path) -> Result<LogFile, LoggingError> {
    logging::open_log_file(data_dir, LogMode::Host)
}

/// Builds the inference backend selected in `config`.
pub fn backend_for(config: &NssConfig, data_dir: &Path) -> Arc<dyn InferenceBackend> {
    let provider = match config.inference.backend {
        BackendKind::Reference => return Arc::new(ReferenceBackend),
        BackendKind::Cuda => ExecutionProvider::Cuda,
        BackendKind::Tensorrt => ExecutionProvider::Tensorrt,
        BackendKind::Cpu => ExecutionProvider::Cpu,
    };
    Arc::new(
        OrtBackend::new(provider)
            .with_trt_cache_dir(config.trt_cache_dir(data_dir))
            .with_device_id(config.inference.device_id),
    )
}

/// Assembles and loads an [`Upscaler`] with the shipped components.
pub fn build_upscaler(
    device: &Device,
    model: ModelDescriptor,
    formats: InputFormats,
    pipeline: &PipelineConfig,
    backend: Arc<dyn InferenceBackend>,
    models_dir: impl Into<PathBuf>,
) -> Result<Upscaler, PipelineError> {
    let preprocessor =
        MultiFrameRgbdMotionPreprocessor::new(device, &model, formats, pipeline.upsample_filter)?;
    let reconstructor = Reconstructor::new(model.clone(), backend, models_dir);
    let decoder = AcceleratorOutputDecoder::new(&model, pipeline.decode_colorspace);

    let mut upscaler = Upscaler::new(
        device,
        model,
        Box::new(preprocessor),
        reconstructor,
        Box::new(decoder),
    )?;
    upscaler.set_sync_mode(pipeline.sync_mode);
    upscaler.load()?;
    Ok(upscaler)
}

pub struct HostSession {
    device: Device,
    queue: CommandQueue,
    upscaler: Option<Upscaler>,
    color: Option<Texture>,
    depth: Option<Texture>,
    motion: Option<Texture>,
    output: Option<Texture>,
    frames: u64,
}

impl HostSession {
    /// Device-ready entry point: installs crash reporting under `data_dir`,
    /// then builds and loads the pipeline from `config`.
    pub fn on_device_ready(
        device: Device,
        model: ModelDescriptor,
        config: &NssConfig,
        data_dir: &Path,
    ) -> Result<Self, PipelineError> {
        match logging::install_panic_hook(data_dir) {
            Ok(crash_dir) => debug!(
                mode = LogMode::Host.name(),
                crash_dir = %crash_dir.display(),
                "Crash reports enabled"
            ),
            Err(error) => warn!(%error, "Crash reports disabled"),
        }
        let backend = backend_for(config, data_dir);
        Self::with_backend(
            device,
            model,
            &config.pipeline,
            backend,
            config.models_dir(data_dir),
        )
    }

    pub fn with_backend(
        device: Device,
        model: ModelDescriptor,
        pipeline: &PipelineConfig,
        backend: Arc<dyn InferenceBackend>,
        models_dir: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        info!(
            device = %device.name(),
            backend = backend.name(),
            output = %model.output_extent(),
            "Host device ready"
        );
        let upscaler = build_upscaler(
            &device,
            model,
            InputFormats::default(),
            pipeline,
            backend,
            models_dir,
        )?;
        let queue = device.create_command_queue("host");
        Ok(Self {
            device,
            queue,
            upscaler: Some(upscaler),
            color: None,
            depth: None,
            motion: None,
            output: None,
            frames: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn upscaler(&self) -> Option<&Upscaler> {
        self.upscaler.as_ref()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn set_input_textures(
        &mut self,
        color: Option<Texture>,
        depth: Option<Texture>,
        motion: Option<Texture>,
    ) {
        self.color = color;
        self.depth = depth;
        self.motion = motion;
    }

    pub fn set_output_texture(&mut self, output: Option<Texture>) {
        self.output = output;
    }

    /// Runs one frame over the bound textures.
    pub fn perform_super_sampling(&mut self) -> Result<SuperSamplingOutcome, PipelineError> {
        let Some(upscaler) = self.upscaler.as_mut() else {
            warn!("perform_super_sampling called after shutdown");
            return Ok(SuperSamplingOutcome::Skipped);
        };
        let (Some(color), Some(depth), Some(output)) = (&self.color, &self.depth, &self.output)
        else {
            warn!(
                color = self.color.is_some(),
                depth = self.depth.is_some(),
                output = self.output.is_some(),
                "Skipping super-sampling: missing texture handles"
            );
            return Ok(SuperSamplingOutcome::Skipped);
        };

        upscaler.process_with_queue(color, depth, self.motion.as_ref(), output, &self.queue)?;
        self.frames += 1;
        Ok(SuperSamplingOutcome::Processed)
    }

    /// Releases the pipeline and every bound texture.
    pub fn shutdown(&mut self) {
        if self.upscaler.take().is_some() {
            debug!(frames = self.frames, "Host session shut down");
        }
        self.color = None;
        self.depth = None;
        self.motion = None;
        self.output = None;
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
