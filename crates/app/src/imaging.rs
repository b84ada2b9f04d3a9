//! PNG and EXR frames as interleaved `f32` texels.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgba32FImage};
use nss_core::gpu::Extent;

/// A decoded image with `channels` interleaved values per texel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub extent: Extent,
    pub channels: usize,
    pub texels: Vec<f32>,
}

impl Frame {
    pub fn rgba(extent: Extent, texels: Vec<f32>) -> Self {
        Self {
            extent,
            channels: 4,
            texels,
        }
    }

    /// Keeps the first `channels` components of every RGBA texel.
    fn narrowed(self, channels: usize) -> Self {
        if channels >= self.channels {
            return self;
        }
        let texels = self
            .texels
            .chunks_exact(self.channels)
            .flat_map(|texel| texel[..channels].iter().copied())
            .collect();
        Self {
            extent: self.extent,
            channels,
            texels,
        }
    }
}

pub fn load_rgba(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    let rgba = image.to_rgba32f();
    let extent = Extent::new(rgba.width(), rgba.height());
    Ok(Frame::rgba(extent, rgba.into_raw()))
}

/// Depth is read from the first channel.
pub fn load_depth(path: &Path) -> Result<Frame> {
    Ok(load_rgba(path)?.narrowed(1))
}

/// Motion vectors are read from the first two channels.
pub fn load_motion(path: &Path) -> Result<Frame> {
    Ok(load_rgba(path)?.narrowed(2))
}

/// Writes an RGBA frame. EXR keeps full float precision, PNG is quantized
/// to eight bits per channel.
pub fn save_rgba(path: &Path, frame: &Frame) -> Result<()> {
    if frame.channels != 4 {
        bail!("expected RGBA texels, got {} channels", frame.channels);
    }
    let buffer = Rgba32FImage::from_raw(
        frame.extent.width,
        frame.extent.height,
        frame.texels.clone(),
    )
    .with_context(|| format!("texel count does not match {} image", frame.extent))?;
    let image = DynamicImage::ImageRgba32F(buffer);

    let format = ImageFormat::from_path(path)
        .with_context(|| format!("unsupported output extension: {}", path.display()))?;
    let encoded = match format {
        ImageFormat::OpenExr => image,
        ImageFormat::Png => DynamicImage::ImageRgba8(image.to_rgba8()),
        other => bail!("unsupported output format {other:?}: {}", path.display()),
    };
    encoded
        .save_with_format(path, format)
        .with_context(|| format!("failed to write image: {}", path.display()))
}
