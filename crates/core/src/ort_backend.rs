//! ONNX Runtime inference backend: CUDA EP, TensorRT EP and CPU.
//!
//! Provides [`ExecutionProvider`], the [`build_session`] helper that creates an
//! `ort::Session` with the requested providers and optional TRT engine caching,
//! and [`OrtBackend`], which plugs a session into the [`Reconstructor`].
//!
//! ONNX exports of the super-sampling networks are NCHW. Shapes are reported
//! to the reconstructor in model-key order (`[C, W, 1, H, N]`), and the
//! interleaved tensor buffers are converted to and from NCHW planes around
//! each run.
//!
//! [`Reconstructor`]: crate::reconstructor::Reconstructor

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use half::f16;
use ndarray::{ArrayD, IxDyn};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider as _, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    tensor::TensorElementType,
    value::{Tensor, ValueType},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::buffer::AcceleratorAccess;
use crate::error::{LoadError, ProcessError};
use crate::model::{ModelDescriptor, TensorLayout, TENSOR_ELEMENT_SIZE};
use crate::reconstructor::{key_shape, InferenceBackend, InferenceHandle, TensorSignature};

/// Execution provider selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries (`libnvinfer.so.10` or `nvinfer.dll`)
/// to be installed; if unavailable, the session falls back to CUDA EP automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl ExecutionProvider {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub provider: ExecutionProvider,
    pub trt_cache_dir: Option<&'a Path>,
    pub device_id: i32,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    if !root.exists() {
        return CacheStats::default();
    }

    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
    }

    stats
}

/// Build an `ort::Session` for the requested provider.
///
/// `Tensorrt` registers the TRT EP with engine caching and the CUDA EP as
/// fallback. `Cuda` registers the CUDA EP only and fails if it cannot be
/// registered. `Cpu` registers nothing.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.provider {
        ExecutionProvider::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_stats(cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let cache_dir_for_log = cache_dir.display().to_string();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                cache_dir = %cache_dir_for_log,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += 15;
                        }
                    }
                }
            });

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            let after = cache_stats(cache_dir);
            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        cache_updated = after.total_bytes != before.total_bytes,
                        cache_files = after.file_count,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        ExecutionProvider::Cuda => {
            let cuda = CUDAExecutionProvider::default().with_device_id(config.device_id);
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available on this machine");
            }

            debug!(provider = "cuda", device_id = config.device_id, "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build().error_on_failure()])
                .context("CUDA execution provider could not be registered")?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        ExecutionProvider::Cpu => {
            debug!(provider = "cpu", "Building session on the CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}

/// Format: `{provider}_{model_hash}_{output_w}x{output_h}`
pub fn trt_cache_key(provider: &str, model_hash: &str, output_w: usize, output_h: usize) -> String {
    format!("{provider}_{model_hash}_{output_w}x{output_h}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

/// Maps an ONNX shape to model-key order. NCHW becomes `[C, W, 1, H, N]`;
/// five-dimensional shapes are assumed to already be in key order.
pub fn to_key_order(shape: &[i64]) -> Vec<i64> {
    match shape {
        [n, c, h, w] => vec![*c, *w, 1, *h, *n],
        other => other.to_vec(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrtBackend {
    provider: ExecutionProvider,
    trt_cache_dir: Option<PathBuf>,
    device_id: i32,
}

impl OrtBackend {
    pub fn new(provider: ExecutionProvider) -> Self {
        Self {
            provider,
            trt_cache_dir: None,
            device_id: 0,
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trt_cache_dir = Some(dir.into());
        self
    }

    pub fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn provider(&self) -> ExecutionProvider {
        self.provider
    }
}

fn classify_load_error(path: &Path, error: anyhow::Error) -> LoadError {
    let message = format!("{error:#}");
    if message.contains("execution provider") {
        LoadError::AcceleratorUnavailable(message)
    } else {
        LoadError::Backend {
            path: path.to_path_buf(),
            source: error.into(),
        }
    }
}

fn classify_run_error(error: ort::Error) -> ProcessError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("out of memory") || lower.contains("failed to allocate") {
        ProcessError::ResourceExhausted(message)
    } else {
        ProcessError::AcceleratorFault(message)
    }
}

impl InferenceBackend for OrtBackend {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn compile(
        &self,
        artifact: &Path,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceHandle>, LoadError> {
        let hash = crate::model::sha256_file(artifact)
            .map(|h| h[..16].to_string())
            .unwrap_or_else(|_| "unhashed".to_string());
        let cache_dir = self.trt_cache_dir.as_deref().map(|base| {
            resolve_trt_cache_dir(
                base,
                Some(&trt_cache_key(
                    &self.provider.to_string(),
                    &hash,
                    model.output_width() as usize,
                    model.output_height() as usize,
                )),
            )
        });

        debug!(
            model = %artifact.display(),
            provider = %self.provider,
            output = %model.output_extent(),
            "Compiling ONNX super-sampling network"
        );

        let session = build_session(&SessionConfig {
            model_path: artifact,
            provider: self.provider,
            trt_cache_dir: cache_dir.as_deref(),
            device_id: self.device_id,
        })
        .map_err(|e| classify_load_error(artifact, e))?;

        let mut signature = TensorSignature::default();
        for input in session.inputs() {
            signature
                .inputs
                .insert(input.name().to_string(), value_shape(input.dtype()));
        }
        for output in session.outputs() {
            signature
                .outputs
                .insert(output.name().to_string(), value_shape(output.dtype()));
        }

        let key_error = |e: crate::error::ConfigurationError| LoadError::Backend {
            path: artifact.to_path_buf(),
            source: e.into(),
        };
        let (input_name, _) = model.model_key().input().map_err(key_error)?;
        let (output_name, _) = model.model_key().output().map_err(key_error)?;
        let is_fp16 = session
            .inputs()
            .first()
            .map(|input| {
                matches!(input.dtype(), ValueType::Tensor { ty, .. } if *ty == TensorElementType::Float16)
            })
            .unwrap_or(false);

        debug!(
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Box::new(OrtHandle {
            session,
            signature,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            is_fp16,
        }))
    }
}

fn value_shape(value: &ValueType) -> Vec<i64> {
    match value {
        ValueType::Tensor { shape, .. } => {
            let dims: Vec<i64> = shape.iter().copied().collect();
            to_key_order(&dims)
        }
        _ => Vec::new(),
    }
}

struct OrtHandle {
    session: Session,
    signature: TensorSignature,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

/// Interleaved history slots to one NCHW plane per (slot, channel).
fn buffer_to_nchw(access: &AcceleratorAccess<'_>) -> Vec<f16> {
    let layout = *access.layout();
    let plane = layout.width * layout.height;
    let bytes = access.as_bytes();
    let mut data = vec![f16::ZERO; plane * layout.channels * layout.slots];
    if data.is_empty() {
        return data;
    }
    data.par_chunks_mut(plane)
        .enumerate()
        .for_each(|(index, dst)| {
            let slot = index / layout.channels;
            let channel = index % layout.channels;
            for y in 0..layout.height {
                for x in 0..layout.width {
                    let offset = layout.offset(slot, x, y, channel);
                    dst[y * layout.width + x] = f16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
                }
            }
        });
    data
}

/// NCHW planes (already f16) back into the interleaved output slot.
fn nchw_to_buffer(planes: &[f16], layout: &TensorLayout, bytes: &mut [u8]) {
    let plane = layout.width * layout.height;
    bytes
        .par_chunks_mut(layout.row_stride)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..layout.width {
                for c in 0..layout.channels {
                    let value = planes[c * plane + y * layout.width + x];
                    let offset = x * layout.pixel_stride + c * TENSOR_ELEMENT_SIZE;
                    row[offset..offset + TENSOR_ELEMENT_SIZE].copy_from_slice(&value.to_le_bytes());
                }
            }
            row[layout.width * layout.pixel_stride..].fill(0);
        });
}

impl OrtHandle {
    fn infer(&mut self, input: ArrayD<f16>) -> Result<(Vec<usize>, Vec<f16>), ort::Error> {
        if self.is_fp16 {
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            let shape = view.shape().to_vec();
            let data: Vec<f16> = view.iter().copied().collect();
            Ok((shape, data))
        } else {
            let input = input.mapv(f16::to_f32);
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            let shape = view.shape().to_vec();
            let data: Vec<f16> = view.iter().map(|v| f16::from_f32(*v)).collect();
            Ok((shape, data))
        }
    }
}

impl InferenceHandle for OrtHandle {
    fn signature(&self) -> &TensorSignature {
        &self.signature
    }

    fn run(
        &mut self,
        input: &AcceleratorAccess<'_>,
        output: &mut AcceleratorAccess<'_>,
    ) -> Result<(), ProcessError> {
        let in_layout = *input.layout();
        let out_layout = *output.layout();
        let nchw_shape = vec![
            1,
            in_layout.channels * in_layout.slots,
            in_layout.height,
            in_layout.width,
        ];
        let array = ArrayD::from_shape_vec(IxDyn(&nchw_shape), buffer_to_nchw(input))
            .map_err(|e| ProcessError::AcceleratorFault(e.to_string()))?;

        let started = Instant::now();
        let (shape, planes) = self.infer(array).map_err(classify_run_error)?;
        debug!(
            run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Super-sampling inference finished"
        );

        let expected = [1, out_layout.channels, out_layout.height, out_layout.width];
        if shape != expected {
            let actual: Vec<i64> = shape.iter().map(|d| *d as i64).collect();
            return Err(ProcessError::ShapeMismatch {
                name: self.output_name.clone(),
                expected: key_shape(out_layout.channels, out_layout.width, out_layout.height),
                actual: to_key_order(&actual),
            });
        }

        nchw_to_buffer(&planes, &out_layout, output.as_bytes_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Device;

    #[test]
    fn test_provider_from_str_lossy() {
        assert_eq!(ExecutionProvider::from_str_lossy("cuda"), ExecutionProvider::Cuda);
        assert_eq!(ExecutionProvider::from_str_lossy("TensorRT"), ExecutionProvider::Tensorrt);
        assert_eq!(ExecutionProvider::from_str_lossy("trt"), ExecutionProvider::Tensorrt);
        assert_eq!(ExecutionProvider::from_str_lossy("CPU"), ExecutionProvider::Cpu);
        assert_eq!(ExecutionProvider::from_str_lossy("unknown"), ExecutionProvider::Cuda);
        assert_eq!(ExecutionProvider::from_str_lossy(""), ExecutionProvider::Cuda);
    }

    #[test]
    fn test_provider_display_roundtrip() {
        for provider in [
            ExecutionProvider::Cuda,
            ExecutionProvider::Tensorrt,
            ExecutionProvider::Cpu,
        ] {
            assert_eq!(ExecutionProvider::from_str_lossy(&provider.to_string()), provider);
        }
    }

    #[test]
    fn test_trt_cache_key() {
        assert_eq!(trt_cache_key("tensorrt", "abc123", 1280, 720), "tensorrt_abc123_1280x720");
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("k")),
            PathBuf::from("trt_cache/k")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }

    #[test]
    fn nchw_shapes_map_to_key_order() {
        assert_eq!(to_key_order(&[1, 12, 720, 1280]), vec![12, 1280, 1, 720, 1]);
        assert_eq!(to_key_order(&[-1, 3, -1, -1]), vec![3, -1, 1, -1, -1]);
        assert_eq!(to_key_order(&[12, 1280, 1, 720, 1]), vec![12, 1280, 1, 720, 1]);
    }

    #[test]
    fn buffer_planes_roundtrip_through_nchw() {
        let device = Device::cpu_reference();
        let layout = TensorLayout::new(3, 2, 3, 1);
        let buffer = device.create_shared_buffer("out", layout);
        let planes: Vec<f16> = (0..18).map(|v| f16::from_f32(v as f32)).collect();

        {
            let mut guard = buffer.lock().expect("lock");
            nchw_to_buffer(&planes, &layout, guard.as_bytes_mut());
        }
        let guard = buffer.lock().expect("lock");
        // Channel 2 plane starts at 12; pixel (1, 1) is index 4 within it.
        assert_eq!(guard.element(0, 1, 1, 2), 16.0);
        assert_eq!(buffer_to_nchw(&guard), planes);
    }
}
