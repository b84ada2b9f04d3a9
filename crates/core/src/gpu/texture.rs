use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::GpuError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn scaled(&self, factor: u32) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Texel formats understood by the pipeline's compute passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    Rgba16Float,
    Rgba32Float,
    Bgra8Unorm,
    R16Float,
    R32Float,
    Rg16Float,
    Rg32Float,
}

impl TextureFormat {
    pub fn channel_count(self) -> usize {
        match self {
            Self::Rgba16Float | Self::Rgba32Float | Self::Bgra8Unorm => 4,
            Self::Rg16Float | Self::Rg32Float => 2,
            Self::R16Float | Self::R32Float => 1,
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(self, Self::Bgra8Unorm)
    }

    /// Rounds a value to what a texel of this format can hold.
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Self::Rgba16Float | Self::R16Float | Self::Rg16Float => f16::from_f32(value).to_f32(),
            Self::Rgba32Float | Self::R32Float | Self::Rg32Float => value,
            Self::Bgra8Unorm => (value.clamp(0.0, 1.0) * 255.0).round() / 255.0,
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgba16Float => "rgba16float",
            Self::Rgba32Float => "rgba32float",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::R16Float => "r16float",
            Self::R32Float => "r32float",
            Self::Rg16Float => "rg16float",
            Self::Rg32Float => "rg32float",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: String,
    pub extent: Extent,
    pub format: TextureFormat,
}

impl TextureDescriptor {
    pub fn new(label: impl Into<String>, extent: Extent, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            extent,
            format,
        }
    }
}

/// Reference-counted handle to a 2D texture.
///
/// Texels are stored as `f32` in row-major order with `format.channel_count()`
/// interleaved channels, already quantized to the precision of `format`.
/// Channel order is always logical RGBA even for [`TextureFormat::Bgra8Unorm`].
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    id: u64,
    label: String,
    extent: Extent,
    format: TextureFormat,
    texels: RwLock<Vec<f32>>,
}

impl Texture {
    pub(crate) fn new(id: u64, descriptor: &TextureDescriptor) -> Self {
        let len = descriptor.extent.texel_count() * descriptor.format.channel_count();
        Self {
            inner: Arc::new(TextureInner {
                id,
                label: descriptor.label.clone(),
                extent: descriptor.extent,
                format: descriptor.format,
                texels: RwLock::new(vec![0.0; len]),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn extent(&self) -> Extent {
        self.inner.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.inner.format
    }

    pub fn channel_count(&self) -> usize {
        self.inner.format.channel_count()
    }

    /// Number of `f32` values backing the texture.
    pub fn len(&self) -> usize {
        self.inner.extent.texel_count() * self.channel_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn texels(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.inner
            .texels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn texels_mut(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.inner
            .texels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current texel contents.
    pub fn read_texels(&self) -> Vec<f32> {
        self.texels().clone()
    }

    /// Replaces the texel contents, quantizing to the texture's format.
    pub fn write_texels(&self, data: &[f32]) -> Result<(), GpuError> {
        if data.len() != self.len() {
            return Err(GpuError::TexelCountMismatch {
                expected: self.len(),
                actual: data.len(),
            });
        }
        let format = self.format();
        let mut texels = self.texels_mut();
        for (dst, src) in texels.iter_mut().zip(data) {
            *dst = format.quantize(*src);
        }
        Ok(())
    }

    pub fn same_as(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("extent", &self.inner.extent)
            .field("format", &self.inner.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_matches_format_precision() {
        assert_eq!(TextureFormat::Rgba32Float.quantize(0.1), 0.1);
        assert_eq!(
            TextureFormat::R16Float.quantize(0.1),
            f16::from_f32(0.1).to_f32()
        );
        assert_eq!(TextureFormat::Bgra8Unorm.quantize(1.5), 1.0);
        assert_eq!(TextureFormat::Bgra8Unorm.quantize(-0.2), 0.0);
        assert_eq!(TextureFormat::Bgra8Unorm.quantize(0.5), 128.0 / 255.0);
    }

    #[test]
    fn write_texels_rejects_wrong_length() {
        let texture = Texture::new(
            1,
            &TextureDescriptor::new("depth", Extent::new(2, 2), TextureFormat::R32Float),
        );
        let error = texture.write_texels(&[0.0; 3]).expect_err("length mismatch");
        assert!(matches!(
            error,
            GpuError::TexelCountMismatch {
                expected: 4,
                actual: 3
            }
        ));
        texture
            .write_texels(&[0.25, 0.5, 0.75, 1.0])
            .expect("write depth");
        assert_eq!(texture.read_texels(), vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn clones_share_storage() {
        let texture = Texture::new(
            7,
            &TextureDescriptor::new("color", Extent::new(1, 1), TextureFormat::Rgba32Float),
        );
        let alias = texture.clone();
        alias.write_texels(&[1.0, 2.0, 3.0, 4.0]).expect("write");
        assert!(texture.same_as(&alias));
        assert_eq!(texture.read_texels(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
