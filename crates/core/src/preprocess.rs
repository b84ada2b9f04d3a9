//! GPU-side packing of one rendered frame into a tensor history slot.
//!
//! [`MultiFrameRgbdMotionPreprocessor`] records three passes per frame:
//! `nss.upsample` (color and depth to output resolution), `nss.warp`
//! (motion-compensated reprojection, only when motion is supplied) and
//! `nss.pack` (interleaved f16 write into the requested slot).

use tracing::trace;

use crate::buffer::SharedBuffer;
use crate::error::{ConfigurationError, GpuError};
use crate::gpu::kernels::{self, ChannelSource, UpsampleFilter};
use crate::gpu::{CommandStream, Device, Extent, Texture, TextureDescriptor, TextureFormat};
use crate::model::{ModelDescriptor, TensorLayout};

pub const UPSAMPLE_PASS: &str = "nss.upsample";
pub const WARP_PASS: &str = "nss.warp";
pub const PACK_PASS: &str = "nss.pack";

/// Capability interface the upscaler drives once per frame.
pub trait Preprocessor: Send {
    fn descriptor(&self) -> &PreprocessorDescriptor;

    /// Rejects textures that do not match what the preprocessor was built for.
    fn validate_input(
        &self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
    ) -> Result<(), ConfigurationError>;

    /// Records the passes that write one frame into `frame_index` of `output`.
    ///
    /// Only encodes work; the caller owns submission and ordering.
    fn preprocess(
        &self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
        output: &SharedBuffer,
        frame_index: usize,
        stream: &mut CommandStream,
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessorDescriptor {
    pub width: u32,
    pub height: u32,
    pub scale_factor: u32,
    pub channel_count: usize,
    pub frame_count: usize,
    /// Bytes between consecutive history slots of the output buffer.
    pub output_buffer_stride: usize,
    pub layout: TensorLayout,
    pub filter: UpsampleFilter,
}

impl PreprocessorDescriptor {
    pub fn from_model(model: &ModelDescriptor, filter: UpsampleFilter) -> Self {
        let layout = model.input_layout();
        Self {
            width: model.input_width(),
            height: model.input_height(),
            scale_factor: model.scale_factor(),
            channel_count: model.input_channel_count(),
            frame_count: model.input_frame_count(),
            output_buffer_stride: layout.slot_stride,
            layout,
            filter,
        }
    }

    pub fn input_extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    pub fn output_extent(&self) -> Extent {
        self.input_extent().scaled(self.scale_factor)
    }
}

/// Per-pixel channel of the packed tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorChannel {
    Red,
    Green,
    Blue,
    Alpha,
    Depth,
    MotionX,
    MotionY,
}

impl TensorChannel {
    pub fn is_motion(self) -> bool {
        matches!(self, Self::MotionX | Self::MotionY)
    }
}

/// Packing order for a given channel count.
pub fn channel_layout(channel_count: usize) -> Result<&'static [TensorChannel], ConfigurationError> {
    use TensorChannel::*;
    match channel_count {
        4 => Ok(&[Red, Green, Blue, Depth]),
        5 => Ok(&[Red, Green, Blue, Alpha, Depth]),
        6 => Ok(&[Red, Green, Blue, Depth, MotionX, MotionY]),
        7 => Ok(&[Red, Green, Blue, Alpha, Depth, MotionX, MotionY]),
        other => Err(ConfigurationError::UnsupportedChannelCount(other)),
    }
}

/// Texture formats the caller promises to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormats {
    pub color: TextureFormat,
    pub depth: TextureFormat,
    pub motion: Option<TextureFormat>,
}

impl Default for InputFormats {
    fn default() -> Self {
        Self {
            color: TextureFormat::Rgba16Float,
            depth: TextureFormat::R16Float,
            motion: Some(TextureFormat::Rg16Float),
        }
    }
}

const COLOR_FORMATS: [TextureFormat; 2] = [TextureFormat::Rgba16Float, TextureFormat::Rgba32Float];
const DEPTH_FORMATS: [TextureFormat; 2] = [TextureFormat::R16Float, TextureFormat::R32Float];
const MOTION_FORMATS: [TextureFormat; 2] = [TextureFormat::Rg16Float, TextureFormat::Rg32Float];

fn accepted(formats: &[TextureFormat]) -> String {
    formats
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" or ")
}

fn check_format(
    what: &'static str,
    actual: TextureFormat,
    allowed: &[TextureFormat],
) -> Result<(), ConfigurationError> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(ConfigurationError::FormatMismatch {
            what,
            expected: accepted(allowed),
            actual,
        })
    }
}

fn check_texture(
    what: &'static str,
    texture: &Texture,
    extent: Extent,
    format: TextureFormat,
) -> Result<(), ConfigurationError> {
    if texture.extent() != extent {
        return Err(ConfigurationError::ResolutionMismatch {
            what,
            expected: extent,
            actual: texture.extent(),
        });
    }
    if texture.format() != format {
        return Err(ConfigurationError::FormatMismatch {
            what,
            expected: format.to_string(),
            actual: texture.format(),
        });
    }
    Ok(())
}

/// Upsample, warp and pack RGBD(+motion) frames into a multi-frame history.
pub struct MultiFrameRgbdMotionPreprocessor {
    descriptor: PreprocessorDescriptor,
    formats: InputFormats,
    channels: &'static [TensorChannel],
    color_scratch: Texture,
    depth_scratch: Texture,
}

impl MultiFrameRgbdMotionPreprocessor {
    pub fn new(
        device: &Device,
        model: &ModelDescriptor,
        formats: InputFormats,
        filter: UpsampleFilter,
    ) -> Result<Self, ConfigurationError> {
        Self::with_descriptor(device, PreprocessorDescriptor::from_model(model, filter), formats)
    }

    pub fn with_descriptor(
        device: &Device,
        descriptor: PreprocessorDescriptor,
        formats: InputFormats,
    ) -> Result<Self, ConfigurationError> {
        let channels = channel_layout(descriptor.channel_count)?;
        check_format("color", formats.color, &COLOR_FORMATS)?;
        check_format("depth", formats.depth, &DEPTH_FORMATS)?;
        match formats.motion {
            Some(motion) => check_format("motion", motion, &MOTION_FORMATS)?,
            None if channels.iter().any(|c| c.is_motion()) => {
                return Err(ConfigurationError::InvalidDescriptor(format!(
                    "{}-channel layout packs motion vectors but no motion format was declared",
                    descriptor.channel_count
                )))
            }
            None => {}
        }
        if descriptor.layout.channels != descriptor.channel_count
            || descriptor.layout.slots != descriptor.frame_count
            || descriptor.layout.extent() != descriptor.output_extent()
        {
            return Err(ConfigurationError::InvalidDescriptor(format!(
                "preprocessor layout {} disagrees with {} channels x {} frames at {}",
                descriptor.layout,
                descriptor.channel_count,
                descriptor.frame_count,
                descriptor.output_extent()
            )));
        }

        let output_extent = descriptor.output_extent();
        let color_scratch = device.create_texture(&TextureDescriptor::new(
            "nss.preprocess.color",
            output_extent,
            TextureFormat::Rgba32Float,
        ));
        let depth_scratch = device.create_texture(&TextureDescriptor::new(
            "nss.preprocess.depth",
            output_extent,
            TextureFormat::R32Float,
        ));

        Ok(Self {
            descriptor,
            formats,
            channels,
            color_scratch,
            depth_scratch,
        })
    }

    pub fn formats(&self) -> InputFormats {
        self.formats
    }

    pub fn channels(&self) -> &'static [TensorChannel] {
        self.channels
    }
}

impl Preprocessor for MultiFrameRgbdMotionPreprocessor {
    fn descriptor(&self) -> &PreprocessorDescriptor {
        &self.descriptor
    }

    fn validate_input(
        &self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
    ) -> Result<(), ConfigurationError> {
        let extent = self.descriptor.input_extent();
        check_texture("color", color, extent, self.formats.color)?;
        check_texture("depth", depth, extent, self.formats.depth)?;
        match (motion, self.formats.motion) {
            (Some(motion), Some(format)) => check_texture("motion", motion, extent, format),
            (Some(motion), None) => Err(ConfigurationError::FormatMismatch {
                what: "motion",
                expected: "no motion texture".to_string(),
                actual: motion.format(),
            }),
            (None, _) => Ok(()),
        }
    }

    fn preprocess(
        &self,
        color: &Texture,
        depth: &Texture,
        motion: Option<&Texture>,
        output: &SharedBuffer,
        frame_index: usize,
        stream: &mut CommandStream,
    ) {
        debug_assert!(frame_index < self.descriptor.frame_count);
        trace!(
            slot = frame_index,
            motion = motion.is_some(),
            "Encoding preprocess passes"
        );

        let input_extent = self.descriptor.input_extent();
        let output_extent = self.descriptor.output_extent();
        let scale = self.descriptor.scale_factor;
        let filter = self.descriptor.filter;

        {
            let color = color.clone();
            let depth = depth.clone();
            let color_scratch = self.color_scratch.clone();
            let depth_scratch = self.depth_scratch.clone();
            stream.encode_pass(UPSAMPLE_PASS, move || {
                let upsampled = kernels::upsample(&color.texels(), input_extent, 4, scale, filter);
                *color_scratch.texels_mut() = upsampled;
                let upsampled = kernels::upsample(&depth.texels(), input_extent, 1, scale, filter);
                *depth_scratch.texels_mut() = upsampled;
                Ok(())
            });
        }

        if let Some(motion) = motion {
            let motion = motion.clone();
            let color_scratch = self.color_scratch.clone();
            let depth_scratch = self.depth_scratch.clone();
            stream.encode_pass(WARP_PASS, move || {
                let vectors = motion.texels();
                let warped = kernels::warp(
                    &color_scratch.texels(),
                    output_extent,
                    4,
                    &vectors,
                    input_extent,
                    scale,
                );
                *color_scratch.texels_mut() = warped;
                let warped = kernels::warp(
                    &depth_scratch.texels(),
                    output_extent,
                    1,
                    &vectors,
                    input_extent,
                    scale,
                );
                *depth_scratch.texels_mut() = warped;
                Ok(())
            });
        }

        let layout = self.descriptor.layout;
        let channels = self.channels;
        let motion = motion.cloned();
        let color_scratch = self.color_scratch.clone();
        let depth_scratch = self.depth_scratch.clone();
        let output = output.clone();
        stream.encode_pass(PACK_PASS, move || {
            if frame_index >= layout.slots || output.layout() != &layout {
                return Err(GpuError::OutOfBounds {
                    offset: frame_index * layout.slot_stride,
                    len: layout.slot_stride,
                    capacity: output.length(),
                });
            }

            let motion_upsampled = motion.as_ref().map(|motion| {
                kernels::upsample(
                    &motion.texels(),
                    input_extent,
                    2,
                    scale,
                    UpsampleFilter::Nearest,
                )
            });
            let color = color_scratch.texels();
            let depth = depth_scratch.texels();
            let sources: Vec<Option<ChannelSource<'_>>> = channels
                .iter()
                .map(|channel| match channel {
                    TensorChannel::Red => Some(ChannelSource::new(&color, 4, 0)),
                    TensorChannel::Green => Some(ChannelSource::new(&color, 4, 1)),
                    TensorChannel::Blue => Some(ChannelSource::new(&color, 4, 2)),
                    TensorChannel::Alpha => Some(ChannelSource::new(&color, 4, 3)),
                    TensorChannel::Depth => Some(ChannelSource::new(&depth, 1, 0)),
                    TensorChannel::MotionX => motion_upsampled
                        .as_deref()
                        .map(|m| ChannelSource::new(m, 2, 0)),
                    TensorChannel::MotionY => motion_upsampled
                        .as_deref()
                        .map(|m| ChannelSource::new(m, 2, 1)),
                })
                .collect();

            output.gpu_write(|bytes| kernels::pack_slot(bytes, &layout, frame_index, &sources))
        });
    }
}
