//! Batched image tensors
//!
//! A `TensorBatch` is a dense NHWC f32 tensor holding one discovery batch's
//! worth of decoded images. Images are stacked along the leading axis; a
//! batch always shares one height and width, so stragglers with different
//! dimensions are resized to the batch's leading image before stacking.

use image::imageops::{self, FilterType};
use image::RgbImage;
use styleflow_common::{Result, StyleFlowError};
use tracing::debug;

/// Channels per pixel; inputs are always decoded to RGB.
pub const CHANNELS: usize = 3;

/// A stack of same-sized RGB images as one NHWC f32 tensor.
#[derive(Debug, Clone)]
pub struct TensorBatch {
    data: Vec<f32>,
    n: usize,
    h: usize,
    w: usize,
}

impl TensorBatch {
    /// Stack decoded images into one tensor.
    ///
    /// The first image fixes the batch's height and width; any image with
    /// other dimensions is resized to match.
    pub fn from_images(images: Vec<RgbImage>) -> Result<Self> {
        if images.is_empty() {
            return Err(StyleFlowError::tensor("cannot stack an empty batch"));
        }

        let (w, h) = images[0].dimensions();
        if w == 0 || h == 0 {
            return Err(StyleFlowError::tensor("cannot stack zero-sized images"));
        }
        let n = images.len();
        let mut data = Vec::with_capacity(n * (h as usize) * (w as usize) * CHANNELS);

        for img in images {
            let img = if img.dimensions() == (w, h) {
                img
            } else {
                debug!(
                    "Resizing {}x{} image to batch dimensions {}x{}",
                    img.width(),
                    img.height(),
                    w,
                    h
                );
                imageops::resize(&img, w, h, FilterType::Triangle)
            };
            data.extend(img.into_raw().into_iter().map(f32::from));
        }

        Ok(Self {
            data,
            n,
            h: h as usize,
            w: w as usize,
        })
    }

    /// Build a batch from raw NHWC data.
    pub(crate) fn from_raw(data: Vec<f32>, n: usize, h: usize, w: usize) -> Result<Self> {
        if data.len() != n * h * w * CHANNELS {
            return Err(StyleFlowError::tensor(format!(
                "raw buffer of {} floats does not match shape [{}, {}, {}, {}]",
                data.len(),
                n,
                h,
                w,
                CHANNELS
            )));
        }
        Ok(Self { data, n, h, w })
    }

    /// Shape as (n, h, w, c).
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.n, self.h, self.w, CHANNELS)
    }

    /// Number of stacked images.
    pub fn len(&self) -> usize {
        self.n
    }

    /// True if the batch holds no images.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// The full NHWC buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Floats per image.
    pub fn image_len(&self) -> usize {
        self.h * self.w * CHANNELS
    }

    /// Unstack into 8-bit RGB images, clamping each channel to [0, 255].
    pub fn to_images(&self) -> Result<Vec<RgbImage>> {
        self.data
            .chunks(self.image_len())
            .map(|chunk| {
                let bytes: Vec<u8> = chunk.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
                RgbImage::from_raw(self.w as u32, self.h as u32, bytes).ok_or_else(|| {
                    StyleFlowError::tensor("image buffer does not match batch dimensions")
                })
            })
            .collect()
    }
}
