//! Model descriptor: the single source of truth for every tensor shape and
//! buffer size in the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigurationError, LoadError};
use crate::gpu::Extent;

/// Tensor elements are IEEE half floats.
pub const TENSOR_ELEMENT_SIZE: usize = 2;
/// Rows of a tensor slot start on this byte alignment.
pub const ROW_ALIGNMENT: usize = 64;

/// Byte layout of a tensor buffer: interleaved channels per pixel, padded
/// rows, `slots` consecutive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TensorLayout {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub slots: usize,
    pub pixel_stride: usize,
    pub row_stride: usize,
    pub slot_stride: usize,
    pub length: usize,
}

impl TensorLayout {
    pub fn new(width: usize, height: usize, channels: usize, slots: usize) -> Self {
        let pixel_stride = channels * TENSOR_ELEMENT_SIZE;
        let row_stride = (width * pixel_stride).div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT;
        let slot_stride = row_stride * height;
        Self {
            width,
            height,
            channels,
            slots,
            pixel_stride,
            row_stride,
            slot_stride,
            length: slot_stride * slots,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width as u32, self.height as u32)
    }

    /// Byte offset of one element.
    pub fn offset(&self, slot: usize, x: usize, y: usize, channel: usize) -> usize {
        slot * self.slot_stride
            + y * self.row_stride
            + x * self.pixel_stride
            + channel * TENSOR_ELEMENT_SIZE
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch {}x{} x{} (row stride {}, {} bytes)",
            self.channels, self.width, self.height, self.slots, self.row_stride, self.length
        )
    }
}

/// Shape of one named tensor in key order `[channels, width, depth, height, batch]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn image(channels: usize, width: usize, height: usize) -> Self {
        Self {
            shape: vec![channels as i64, width as i64, 1, height as i64, 1],
        }
    }

    pub fn channels(&self) -> Option<usize> {
        self.shape.first().and_then(|c| usize::try_from(*c).ok())
    }
}

/// Parsed model key: the tensor contract the compiled network must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelKey {
    #[serde(default)]
    pub isegment: u32,
    pub inputs: BTreeMap<String, TensorSpec>,
    pub outputs: BTreeMap<String, TensorSpec>,
}

impl ModelKey {
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(raw).map_err(|e| ConfigurationError::InvalidModelKey(e.to_string()))
    }

    /// The single input tensor.
    pub fn input(&self) -> Result<(&str, &TensorSpec), ConfigurationError> {
        single("input", &self.inputs)
    }

    /// The single output tensor.
    pub fn output(&self) -> Result<(&str, &TensorSpec), ConfigurationError> {
        single("output", &self.outputs)
    }
}

fn single<'a>(
    what: &str,
    tensors: &'a BTreeMap<String, TensorSpec>,
) -> Result<(&'a str, &'a TensorSpec), ConfigurationError> {
    let mut iter = tensors.iter();
    match (iter.next(), iter.next()) {
        (Some((name, spec)), None) => Ok((name.as_str(), spec)),
        _ => Err(ConfigurationError::InvalidModelKey(format!(
            "expected exactly one {what} tensor, found {}",
            tensors.len()
        ))),
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// Resolved as `<models_dir>/<name>.onnx`.
    Bundled(String),
    Path(PathBuf),
}

/// Where the compiled-network artifact lives, plus an optional checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLocation {
    pub source: ModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelLocation {
    pub fn bundled(name: impl Into<String>) -> Self {
        Self {
            source: ModelSource::Bundled(name.into()),
            sha256: None,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::Path(path.into()),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, hex: impl Into<String>) -> Self {
        self.sha256 = Some(hex.into().to_ascii_lowercase());
        self
    }

    pub fn resolve(&self, models_dir: &Path) -> PathBuf {
        match &self.source {
            ModelSource::Bundled(name) => models_dir.join(format!("{name}.onnx")),
            ModelSource::Path(path) => crate::config::resolve_relative_to(models_dir, path),
        }
    }

    /// Checks that the resolved artifact exists and matches the checksum, if any.
    pub fn verify(&self, models_dir: &Path) -> Result<PathBuf, LoadError> {
        let path = self.resolve(models_dir);
        if !path.is_file() {
            return Err(LoadError::ArtifactMissing { path });
        }
        if let Some(expected) = &self.sha256 {
            let actual = sha256_file(&path).map_err(|source| LoadError::Backend {
                path: path.clone(),
                source: source.into(),
            })?;
            if actual != *expected {
                return Err(LoadError::ChecksumMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(path)
    }
}

impl fmt::Display for ModelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ModelSource::Bundled(name) => write!(f, "bundled:{name}"),
            ModelSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fields a descriptor is built from.
#[derive(Debug, Clone)]
pub struct ModelParameters {
    pub input_width: u32,
    pub input_height: u32,
    pub input_channel_count: usize,
    pub input_frame_count: usize,
    pub scale_factor: u32,
    pub model_key: String,
    pub model_location: ModelLocation,
}

/// Immutable description of one super-sampling network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    input_width: u32,
    input_height: u32,
    input_channel_count: usize,
    input_frame_count: usize,
    scale_factor: u32,
    output_width: u32,
    output_height: u32,
    output_channel_count: usize,
    model_key: ModelKey,
    model_location: ModelLocation,
}

impl ModelDescriptor {
    pub fn new(params: ModelParameters) -> Result<Self, ConfigurationError> {
        if params.input_width == 0 || params.input_height == 0 {
            return Err(ConfigurationError::InvalidDescriptor(format!(
                "input extent must be non-zero, got {}x{}",
                params.input_width, params.input_height
            )));
        }
        if params.input_frame_count == 0 {
            return Err(ConfigurationError::InvalidDescriptor(
                "input frame count must be at least 1".to_string(),
            ));
        }
        if params.scale_factor == 0 {
            return Err(ConfigurationError::InvalidDescriptor(
                "scale factor must be at least 1".to_string(),
            ));
        }
        if params.input_channel_count == 0 {
            return Err(ConfigurationError::InvalidDescriptor(
                "input channel count must be at least 1".to_string(),
            ));
        }

        let model_key = ModelKey::parse(&params.model_key)?;
        let scaled = |extent: u32, axis: &str| {
            extent
                .checked_mul(params.scale_factor)
                .ok_or_else(|| {
                    ConfigurationError::InvalidDescriptor(format!(
                        "output {axis} {extent} x {} does not fit in u32",
                        params.scale_factor
                    ))
                })
        };
        let output_width = scaled(params.input_width, "width")?;
        let output_height = scaled(params.input_height, "height")?;

        let (input_name, input) = model_key.input()?;
        let expected_input = TensorSpec::image(
            params.input_channel_count * params.input_frame_count,
            output_width as usize,
            output_height as usize,
        );
        if *input != expected_input {
            return Err(ConfigurationError::InvalidModelKey(format!(
                "input `{input_name}` declares {:?}, descriptor implies {:?}",
                input.shape, expected_input.shape
            )));
        }

        let (output_name, output) = model_key.output()?;
        let output_channel_count = match output.channels() {
            Some(c @ (3 | 4)) => c,
            _ => {
                return Err(ConfigurationError::InvalidModelKey(format!(
                    "output `{output_name}` must have 3 or 4 channels, declares {:?}",
                    output.shape
                )))
            }
        };
        let expected_output = TensorSpec::image(
            output_channel_count,
            output_width as usize,
            output_height as usize,
        );
        if *output != expected_output {
            return Err(ConfigurationError::InvalidModelKey(format!(
                "output `{output_name}` declares {:?}, descriptor implies {:?}",
                output.shape, expected_output.shape
            )));
        }

        Ok(Self {
            input_width: params.input_width,
            input_height: params.input_height,
            input_channel_count: params.input_channel_count,
            input_frame_count: params.input_frame_count,
            scale_factor: params.scale_factor,
            output_width,
            output_height,
            output_channel_count,
            model_key,
            model_location: params.model_location,
        })
    }

    /// 640x360 → 1280x720, three RGBD frames of history.
    pub fn priamp_multi_frame_3fps_720p() -> Self {
        EmbeddedModel::PriampMultiFrame3fps720p.descriptor()
    }

    pub fn input_width(&self) -> u32 {
        self.input_width
    }

    pub fn input_height(&self) -> u32 {
        self.input_height
    }

    pub fn input_channel_count(&self) -> usize {
        self.input_channel_count
    }

    pub fn input_frame_count(&self) -> usize {
        self.input_frame_count
    }

    pub fn scale_factor(&self) -> u32 {
        self.scale_factor
    }

    pub fn output_width(&self) -> u32 {
        self.output_width
    }

    pub fn output_height(&self) -> u32 {
        self.output_height
    }

    pub fn output_channel_count(&self) -> usize {
        self.output_channel_count
    }

    pub fn input_extent(&self) -> Extent {
        Extent::new(self.input_width, self.input_height)
    }

    pub fn output_extent(&self) -> Extent {
        Extent::new(self.output_width(), self.output_height())
    }

    pub fn model_key(&self) -> &ModelKey {
        &self.model_key
    }

    pub fn model_location(&self) -> &ModelLocation {
        &self.model_location
    }

    /// Layout of the history buffer the preprocessor writes.
    pub fn input_layout(&self) -> TensorLayout {
        TensorLayout::new(
            self.output_width() as usize,
            self.output_height() as usize,
            self.input_channel_count,
            self.input_frame_count,
        )
    }

    /// Layout of the buffer the network writes.
    pub fn output_layout(&self) -> TensorLayout {
        TensorLayout::new(
            self.output_width() as usize,
            self.output_height() as usize,
            self.output_channel_count,
            1,
        )
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "input": {
                "width": self.input_width,
                "height": self.input_height,
                "channels": self.input_channel_count,
                "frames": self.input_frame_count,
            },
            "scale_factor": self.scale_factor,
            "output": {
                "width": self.output_width(),
                "height": self.output_height(),
                "channels": self.output_channel_count,
            },
            "model_key": self.model_key,
            "model_location": self.model_location.to_string(),
            "input_layout": self.input_layout(),
            "output_layout": self.output_layout(),
        })
    }
}

/// Networks shipped with the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddedModel {
    PriampMultiFrame3fps720p,
}

impl EmbeddedModel {
    pub const ALL: [EmbeddedModel; 1] = [EmbeddedModel::PriampMultiFrame3fps720p];

    pub fn name(self) -> &'static str {
        match self {
            Self::PriampMultiFrame3fps720p => "priamp-multi-frame-3fps-720p",
        }
    }

    pub fn descriptor(self) -> ModelDescriptor {
        match self {
            Self::PriampMultiFrame3fps720p => ModelDescriptor {
                input_width: 640,
                input_height: 360,
                input_channel_count: 4,
                input_frame_count: 3,
                scale_factor: 2,
                output_width: 1280,
                output_height: 720,
                output_channel_count: 3,
                model_key: ModelKey {
                    isegment: 0,
                    inputs: BTreeMap::from([(
                        "input_1".to_string(),
                        TensorSpec::image(12, 1280, 720),
                    )]),
                    outputs: BTreeMap::from([(
                        "Identity".to_string(),
                        TensorSpec::image(3, 1280, 720),
                    )]),
                },
                model_location: ModelLocation::bundled("NSS2x"),
            },
        }
    }
}

impl fmt::Display for EmbeddedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EmbeddedModel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|model| model.name() == normalized || normalized == "priamp-multiframe3fps720p")
            .ok_or_else(|| {
                ConfigurationError::InvalidDescriptor(format!("unknown embedded model `{s}`"))
            })
    }
}
