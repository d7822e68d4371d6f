//! Image to tensor preprocessing
//!
//! Resizes a decoded frame to a classifier's input size, flattens it to
//! row-major interleaved RGB floats and records the geometry needed to map
//! tensor coordinates back onto the source frame.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};

/// How a frame is fitted into the classifier's input size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Keep aspect ratio, centre the content and fill the rest with black.
    #[default]
    Pad,
    /// Resize to the exact target, distorting content.
    Stretch,
}

/// Per-channel value transform applied to every 0-255 channel value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Raw 0-255 values.
    #[default]
    None,
    /// `x / 255`, range [0, 1].
    UnitRange,
    /// `(x - 128) / 128`, range [-1, 1).
    Symmetric,
    /// `(x / 255 - mean[c]) / std[c]`.
    MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
    #[inline]
    pub fn apply(&self, channel: usize, value: f32) -> f32 {
        match self {
            Normalization::None => value,
            Normalization::UnitRange => value / 255.0,
            Normalization::Symmetric => (value - 128.0) / 128.0,
            Normalization::MeanStd { mean, std } => (value / 255.0 - mean[channel]) / std[channel],
        }
    }
}

/// A frame resized and flattened for one classifier.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// `width * height * 3` values, RGB interleaved, row-major.
    pub pixels: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    /// `width / source_width`, recorded regardless of resize mode.
    pub ratio_x: f32,
    /// `height / source_height`, recorded regardless of resize mode.
    pub ratio_y: f32,
    /// Left padding in tensor pixels.
    pub pad_x: u32,
    /// Top padding in tensor pixels.
    pub pad_y: u32,
    /// Scale actually applied to the content (equals the ratios for stretch).
    pub scale_x: f32,
    pub scale_y: f32,
}

impl PreprocessedImage {
    /// Map a tensor-space point onto the source frame.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale_x,
            (y - self.pad_y as f32) / self.scale_y,
        )
    }

    /// Map a source-frame point into tensor space.
    pub fn to_tensor(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale_x + self.pad_x as f32,
            y * self.scale_y + self.pad_y as f32,
        )
    }

    /// Scale a tensor-space length along x/y onto the source frame.
    pub fn length_to_source(&self, w: f32, h: f32) -> (f32, f32) {
        (w / self.scale_x, h / self.scale_y)
    }

    /// Planar copy of the pixels (`C x H x W`).
    pub fn planar(&self) -> Vec<f32> {
        let plane = self.width as usize * self.height as usize;
        let mut data = vec![0f32; plane * 3];
        for (i, px) in self.pixels.chunks_exact(3).enumerate() {
            data[i] = px[0];
            data[plane + i] = px[1];
            data[2 * plane + i] = px[2];
        }
        data
    }
}

/// Values in an interleaved RGB buffer of `width x height`.
fn tensor_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Resize and normalize a frame. The input image is left untouched.
pub fn preprocess(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    mode: ResizeMode,
    normalization: Normalization,
) -> FilterResult<PreprocessedImage> {
    let (source_width, source_height) = (image.width(), image.height());
    if source_width == 0 || source_height == 0 {
        return Err(FilterError::InvalidImage(format!(
            "frame has zero dimension ({}x{})",
            source_width, source_height
        )));
    }
    if target_width == 0 || target_height == 0 {
        return Err(FilterError::Configuration(format!(
            "target size must be non-zero, got {}x{}",
            target_width, target_height
        )));
    }

    let ratio_x = target_width as f32 / source_width as f32;
    let ratio_y = target_height as f32 / source_height as f32;

    let rgb = image.to_rgb8();
    let (canvas, pad_x, pad_y, scale_x, scale_y) = match mode {
        ResizeMode::Stretch => {
            let resized = imageops::resize(&rgb, target_width, target_height, FilterType::Triangle);
            (resized, 0, 0, ratio_x, ratio_y)
        }
        ResizeMode::Pad => {
            let scale = ratio_x.min(ratio_y);
            let content_width = ((source_width as f32 * scale).round() as u32).clamp(1, target_width);
            let content_height =
                ((source_height as f32 * scale).round() as u32).clamp(1, target_height);
            let resized = imageops::resize(&rgb, content_width, content_height, FilterType::Triangle);

            let pad_x = (target_width - content_width) / 2;
            let pad_y = (target_height - content_height) / 2;
            let mut canvas = RgbImage::from_pixel(target_width, target_height, Rgb([0, 0, 0]));
            imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

            (
                canvas,
                pad_x,
                pad_y,
                content_width as f32 / source_width as f32,
                content_height as f32 / source_height as f32,
            )
        }
    };

    let mut pixels = Vec::with_capacity(tensor_len(target_width, target_height));
    for pixel in canvas.pixels() {
        for channel in 0..3 {
            pixels.push(normalization.apply(channel, pixel[channel] as f32));
        }
    }

    Ok(PreprocessedImage {
        pixels,
        width: target_width,
        height: target_height,
        source_width,
        source_height,
        ratio_x,
        ratio_y,
        pad_x,
        pad_y,
        scale_x,
        scale_y,
    })
}
