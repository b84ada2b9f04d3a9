//! CPU reference implementations of the pipeline's compute passes.
//!
//! Every kernel is data-parallel over output rows with rayon, the way a GPU
//! dispatch is parallel over threadgroups. Texel buffers are row-major `f32`
//! with interleaved channels; tensor slots use the byte layout described by
//! [`TensorLayout`].

use std::fmt;

use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::Extent;
use crate::model::{TensorLayout, TENSOR_ELEMENT_SIZE};

/// Spatial filter used by the upsample pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsampleFilter {
    Nearest,
    #[default]
    Bilinear,
    /// Low-resolution sample lands in the top-left texel of each block; the
    /// remaining texels of the block stay zero.
    ZeroInsert,
}

impl UpsampleFilter {
    /// Parse from string (case-insensitive). Returns `Bilinear` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "nearest" => Self::Nearest,
            "zero_insert" | "zeroinsert" => Self::ZeroInsert,
            _ => Self::Bilinear,
        }
    }
}

impl fmt::Display for UpsampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => write!(f, "nearest"),
            Self::Bilinear => write!(f, "bilinear"),
            Self::ZeroInsert => write!(f, "zero_insert"),
        }
    }
}

/// Bilinear sample with clamp-to-edge addressing at texel-center coordinates.
fn sample_bilinear(
    src: &[f32],
    extent: Extent,
    channels: usize,
    x: f32,
    y: f32,
    out: &mut [f32],
) {
    let width = extent.width as usize;
    let height = extent.height as usize;
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let tx = x - x0 as f32;
    let ty = y - y0 as f32;

    let p00 = (y0 * width + x0) * channels;
    let p10 = (y0 * width + x1) * channels;
    let p01 = (y1 * width + x0) * channels;
    let p11 = (y1 * width + x1) * channels;

    for (c, value) in out.iter_mut().enumerate().take(channels) {
        let top = src[p00 + c] + (src[p10 + c] - src[p00 + c]) * tx;
        let bottom = src[p01 + c] + (src[p11 + c] - src[p01 + c]) * tx;
        *value = top + (bottom - top) * ty;
    }
}

/// Upsamples `src` (at `extent`) by an integer `scale`.
pub fn upsample(
    src: &[f32],
    extent: Extent,
    channels: usize,
    scale: u32,
    filter: UpsampleFilter,
) -> Vec<f32> {
    let src_width = extent.width as usize;
    let scale = scale.max(1) as usize;
    let dst_extent = extent.scaled(scale as u32);
    let dst_width = dst_extent.width as usize;
    let mut dst = vec![0.0f32; dst_extent.texel_count() * channels];
    if dst.is_empty() {
        return dst;
    }

    dst.par_chunks_mut(dst_width * channels)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = y / scale;
            for x in 0..dst_width {
                let sx = x / scale;
                let out = &mut row[x * channels..(x + 1) * channels];
                match filter {
                    UpsampleFilter::Nearest => {
                        let base = (sy * src_width + sx) * channels;
                        out.copy_from_slice(&src[base..base + channels]);
                    }
                    UpsampleFilter::ZeroInsert => {
                        if x % scale == 0 && y % scale == 0 {
                            let base = (sy * src_width + sx) * channels;
                            out.copy_from_slice(&src[base..base + channels]);
                        }
                    }
                    UpsampleFilter::Bilinear => {
                        let fx = (x as f32 + 0.5) / scale as f32 - 0.5;
                        let fy = (y as f32 + 0.5) / scale as f32 - 0.5;
                        sample_bilinear(src, extent, channels, fx, fy, out);
                    }
                }
            }
        });
    dst
}

/// Reprojects `src` along per-pixel motion.
///
/// `motion` is a 2-channel field at `motion_extent` (the input resolution)
/// holding displacements in input texels. Output texel `p` takes the value
/// of `src` at `p + motion * scale`, sampled bilinearly with clamp-to-edge.
pub fn warp(
    src: &[f32],
    extent: Extent,
    channels: usize,
    motion: &[f32],
    motion_extent: Extent,
    scale: u32,
) -> Vec<f32> {
    let width = extent.width as usize;
    let motion_width = motion_extent.width as usize;
    let motion_height = motion_extent.height as usize;
    let scale = scale.max(1) as usize;
    let mut dst = vec![0.0f32; extent.texel_count() * channels];
    if dst.is_empty() || motion_width == 0 || motion_height == 0 {
        return dst;
    }

    dst.par_chunks_mut(width * channels)
        .enumerate()
        .for_each(|(y, row)| {
            let my = (y / scale).min(motion_height - 1);
            for x in 0..width {
                let mx = (x / scale).min(motion_width - 1);
                let m = (my * motion_width + mx) * 2;
                let sx = x as f32 + motion[m] * scale as f32;
                let sy = y as f32 + motion[m + 1] * scale as f32;
                sample_bilinear(
                    src,
                    extent,
                    channels,
                    sx,
                    sy,
                    &mut row[x * channels..(x + 1) * channels],
                );
            }
        });
    dst
}

/// One tensor channel read from an interleaved texel buffer.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSource<'a> {
    pub data: &'a [f32],
    pub stride: usize,
    pub channel: usize,
}

impl<'a> ChannelSource<'a> {
    pub fn new(data: &'a [f32], stride: usize, channel: usize) -> Self {
        Self {
            data,
            stride,
            channel,
        }
    }
}

/// Writes one frame into `slot` of a tensor buffer as little-endian f16.
///
/// `sources[c]` feeds tensor channel `c`; `None` packs zeros. Row padding is
/// zeroed so the slot's bytes depend only on the sources.
pub fn pack_slot(
    dst: &mut [u8],
    layout: &TensorLayout,
    slot: usize,
    sources: &[Option<ChannelSource<'_>>],
) {
    debug_assert_eq!(sources.len(), layout.channels);
    debug_assert!(slot < layout.slots);
    let start = slot * layout.slot_stride;
    let slot_bytes = &mut dst[start..start + layout.slot_stride];
    let width = layout.width;
    let pixel_stride = layout.pixel_stride;

    slot_bytes
        .par_chunks_mut(layout.row_stride)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let pixel = y * width + x;
                for (c, source) in sources.iter().enumerate() {
                    let value = match source {
                        Some(source) => source.data[pixel * source.stride + source.channel],
                        None => 0.0,
                    };
                    let offset = x * pixel_stride + c * TENSOR_ELEMENT_SIZE;
                    row[offset..offset + TENSOR_ELEMENT_SIZE]
                        .copy_from_slice(&f16::from_f32(value).to_le_bytes());
                }
            }
            row[width * pixel_stride..].fill(0);
        });
}

/// Reads `slot` of a tensor buffer back into interleaved `f32` texels.
pub fn unpack_slot(src: &[u8], layout: &TensorLayout, slot: usize) -> Vec<f32> {
    let channels = layout.channels;
    let width = layout.width;
    let start = slot * layout.slot_stride;
    let slot_bytes = &src[start..start + layout.slot_stride];
    let mut out = vec![0.0f32; width * layout.height * channels];
    if out.is_empty() {
        return out;
    }

    out.par_chunks_mut(width * channels)
        .zip(slot_bytes.par_chunks(layout.row_stride))
        .for_each(|(dst_row, src_row)| {
            for x in 0..width {
                for c in 0..channels {
                    let offset = x * layout.pixel_stride + c * TENSOR_ELEMENT_SIZE;
                    let bytes = [src_row[offset], src_row[offset + 1]];
                    dst_row[x * channels + c] = f16::from_le_bytes(bytes).to_f32();
                }
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_upsample_replicates_blocks() {
        let src = [1.0, 2.0, 3.0, 4.0];
        let out = upsample(&src, Extent::new(2, 2), 1, 2, UpsampleFilter::Nearest);
        assert_eq!(
            out,
            vec![
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );
    }

    #[test]
    fn zero_insert_leaves_gaps() {
        let src = [5.0, 6.0];
        let out = upsample(&src, Extent::new(2, 1), 1, 2, UpsampleFilter::ZeroInsert);
        assert_eq!(out, vec![5.0, 0.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn bilinear_upsample_of_constant_is_constant() {
        let src = vec![0.25; 3 * 2 * 4];
        let out = upsample(&src, Extent::new(3, 2), 4, 2, UpsampleFilter::Bilinear);
        assert_eq!(out.len(), 6 * 4 * 4);
        assert!(out.iter().all(|v| (*v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn bilinear_upsample_interpolates_between_texels() {
        let src = [0.0, 1.0];
        let out = upsample(&src, Extent::new(2, 1), 1, 2, UpsampleFilter::Bilinear);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.25).abs() < 1e-6);
        assert!((out[2] - 0.75).abs() < 1e-6);
        assert_eq!(out[3], 1.0);
    }

    #[test]
    fn zero_motion_warp_is_identity() {
        let src: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let motion = vec![0.0; 2 * 2 * 2];
        let out = warp(&src, Extent::new(4, 4), 1, &motion, Extent::new(2, 2), 2);
        assert_eq!(out, src);
    }

    #[test]
    fn warp_shifts_by_scaled_motion() {
        let src: Vec<f32> = (0..4).map(|v| v as f32).collect();
        // One input texel to the right is two output texels at scale 2.
        let motion = vec![1.0, 0.0, 1.0, 0.0];
        let out = warp(&src, Extent::new(4, 1), 1, &motion, Extent::new(2, 1), 2);
        assert_eq!(out, vec![2.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn pack_then_unpack_preserves_values_and_zero_channels() {
        let layout = TensorLayout::new(3, 2, 2, 2);
        let mut bytes = vec![0xAAu8; layout.length];
        let values: Vec<f32> = (0..6).map(|v| v as f32 * 0.5).collect();
        pack_slot(
            &mut bytes,
            &layout,
            1,
            &[Some(ChannelSource::new(&values, 1, 0)), None],
        );

        let unpacked = unpack_slot(&bytes, &layout, 1);
        let expected: Vec<f32> = values.iter().flat_map(|v| [*v, 0.0]).collect();
        assert_eq!(unpacked, expected);

        let slot_one = &bytes[layout.slot_stride..];
        let padding_start = 3 * layout.pixel_stride;
        assert!(slot_one[padding_start..layout.row_stride]
            .iter()
            .all(|b| *b == 0));
        assert!(bytes[..layout.slot_stride].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn upsample_filter_parses_lossily() {
        assert_eq!(UpsampleFilter::from_str_lossy("NEAREST"), UpsampleFilter::Nearest);
        assert_eq!(
            UpsampleFilter::from_str_lossy("zero-insert"),
            UpsampleFilter::ZeroInsert
        );
        assert_eq!(UpsampleFilter::from_str_lossy("lanczos"), UpsampleFilter::Bilinear);
        assert_eq!(UpsampleFilter::ZeroInsert.to_string(), "zero_insert");
    }
}
