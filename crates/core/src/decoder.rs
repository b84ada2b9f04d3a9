//! Conversion of the network's output tensor back into a display texture.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::buffer::SharedBuffer;
use crate::error::{ConfigurationError, GpuError};
use crate::gpu::{kernels, CommandStream, Extent, Texture, TextureFormat};
use crate::model::{ModelDescriptor, TensorLayout};

pub const DECODE_PASS: &str = "nss.decode";

/// Texture formats the decode pass can write.
pub const OUTPUT_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba32Float,
    TextureFormat::Bgra8Unorm,
];

/// Capability interface for the last stage of a frame.
pub trait Decoder: Send {
    /// Binds the buffer the next decode passes read from.
    fn attach_input(&mut self, buffer: SharedBuffer) -> Result<(), ConfigurationError>;

    fn validate_target(&self, texture: &Texture) -> Result<(), ConfigurationError>;

    /// Records the pass that writes the attached buffer into `texture`.
    fn decode_into_texture(
        &self,
        texture: &Texture,
        stream: &mut CommandStream,
    ) -> Result<(), ConfigurationError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeColorspace {
    #[default]
    Identity,
    /// BT.709 full-range YUV with chroma centred at 0.5.
    YuvToRgb,
}

impl DecodeColorspace {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "yuv_to_rgb" | "yuv" => Self::YuvToRgb,
            _ => Self::Identity,
        }
    }

    /// Maps one tensor pixel (first three channels) to RGB in [0, 1].
    pub fn to_rgb(self, c0: f32, c1: f32, c2: f32) -> [f32; 3] {
        match self {
            Self::Identity => [c0, c1, c2].map(|v| v.clamp(0.0, 1.0)),
            Self::YuvToRgb => {
                let (y, u, v) = (c0, c1 - 0.5, c2 - 0.5);
                [
                    y + 1.5748 * v,
                    y - 0.1873 * u - 0.4681 * v,
                    y + 1.8556 * u,
                ]
                .map(|c| c.clamp(0.0, 1.0))
            }
        }
    }
}

impl fmt::Display for DecodeColorspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::YuvToRgb => write!(f, "yuv_to_rgb"),
        }
    }
}

/// Decodes the single output slot of the reconstructor into an RGBA texture.
pub struct AcceleratorOutputDecoder {
    layout: TensorLayout,
    extent: Extent,
    colorspace: DecodeColorspace,
    input: Option<SharedBuffer>,
}

impl AcceleratorOutputDecoder {
    pub fn new(model: &ModelDescriptor, colorspace: DecodeColorspace) -> Self {
        Self {
            layout: model.output_layout(),
            extent: model.output_extent(),
            colorspace,
            input: None,
        }
    }

    pub fn colorspace(&self) -> DecodeColorspace {
        self.colorspace
    }
}

impl Decoder for AcceleratorOutputDecoder {
    fn attach_input(&mut self, buffer: SharedBuffer) -> Result<(), ConfigurationError> {
        if buffer.layout() != &self.layout {
            return Err(ConfigurationError::LayoutMismatch {
                what: "decoder input",
                expected: self.layout,
                actual: *buffer.layout(),
            });
        }
        self.input = Some(buffer);
        Ok(())
    }

    fn validate_target(&self, texture: &Texture) -> Result<(), ConfigurationError> {
        if texture.extent() != self.extent {
            return Err(ConfigurationError::ResolutionMismatch {
                what: "output",
                expected: self.extent,
                actual: texture.extent(),
            });
        }
        if !OUTPUT_FORMATS.contains(&texture.format()) {
            return Err(ConfigurationError::FormatMismatch {
                what: "output",
                expected: "rgba16float, rgba32float or bgra8unorm".to_string(),
                actual: texture.format(),
            });
        }
        Ok(())
    }

    fn decode_into_texture(
        &self,
        texture: &Texture,
        stream: &mut CommandStream,
    ) -> Result<(), ConfigurationError> {
        self.validate_target(texture)?;
        let Some(input) = self.input.clone() else {
            return Err(ConfigurationError::InvalidDescriptor(
                "decoder has no attached input buffer".to_string(),
            ));
        };

        trace!(colorspace = %self.colorspace, target = %texture.label(), "Encoding decode pass");

        let layout = self.layout;
        let colorspace = self.colorspace;
        let texture = texture.clone();
        stream.encode_pass(DECODE_PASS, move || {
            let tensor = input.gpu_read(|bytes| kernels::unpack_slot(bytes, &layout, 0))?;
            let rgba = tensor_to_rgba(&tensor, layout.channels, colorspace);
            texture.write_texels(&rgba).map_err(|error| match error {
                GpuError::TexelCountMismatch { .. } => GpuError::command_failed(DECODE_PASS, error),
                other => other,
            })
        });
        Ok(())
    }
}

/// Interleaved tensor pixels to interleaved RGBA; alpha is 1 without a
/// fourth channel.
pub fn tensor_to_rgba(tensor: &[f32], channels: usize, colorspace: DecodeColorspace) -> Vec<f32> {
    let pixels = tensor.len() / channels.max(1);
    let mut rgba = vec![0.0f32; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(tensor.par_chunks(channels.max(1)))
        .for_each(|(dst, src)| {
            let channel = |c: usize| src.get(c).copied().unwrap_or(0.0);
            let [r, g, b] = colorspace.to_rgb(channel(0), channel(1), channel(2));
            dst[0] = r;
            dst[1] = g;
            dst[2] = b;
            dst[3] = if channels >= 4 {
                channel(3).clamp(0.0, 1.0)
            } else {
                1.0
            };
        });
    rgba
}
