use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use imageproc::contrast::{ThresholdType, threshold};
use ndarray::{Array1, Array2, Array3, Axis};

use crate::error::{GradCamError, Result};

/// Default guard added to the normalisation denominator.
pub const EPSILON: f32 = 1e-8;

/// Spatial mean of the gradient, one weight per channel.
///
/// `gradients` is `(height, width, channels)`.
pub fn channel_weights(gradients: &Array3<f32>) -> Option<Array1<f32>> {
    gradients.mean_axis(Axis(0))?.mean_axis(Axis(0))
}

/// Sum of activation channels weighted by `weights`, per spatial location.
pub fn weighted_activation_sum(activations: &Array3<f32>, weights: &Array1<f32>) -> Array2<f32> {
    activations.map_axis(Axis(2), |channels| channels.dot(weights))
}

/// Single-channel saliency map with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    values: Array2<f32>,
}

impl Heatmap {
    /// Grad-CAM map for one layer capture: ReLU of the gradient-weighted
    /// channel sum, divided by its maximum.
    pub fn from_gradients(
        activations: &Array3<f32>,
        gradients: &Array3<f32>,
        epsilon: f32,
    ) -> Result<Self> {
        if activations.shape() != gradients.shape() {
            return Err(GradCamError::GradientUnavailable {
                layer: String::new(),
                reason: format!(
                    "gradient shape {:?} differs from activation shape {:?}",
                    gradients.shape(),
                    activations.shape()
                ),
            });
        }
        let weights = channel_weights(gradients).ok_or_else(|| GradCamError::GradientUnavailable {
            layer: String::new(),
            reason: "layer output has no spatial extent".into(),
        })?;
        Ok(Self::normalized(weighted_activation_sum(activations, &weights), epsilon))
    }

    /// Clips negatives to zero and scales by `1 / (max + epsilon)`.
    pub fn normalized(raw: Array2<f32>, epsilon: f32) -> Self {
        let clipped = raw.mapv(|v| v.max(0.0));
        let max = clipped.iter().copied().fold(0.0f32, f32::max);
        let values = clipped.mapv(|v| v / (max + epsilon));
        Self { values }
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn into_values(self) -> Array2<f32> {
        self.values
    }

    /// `(width, height)`, matching `image` conventions.
    pub fn dimensions(&self) -> (u32, u32) {
        let (rows, cols) = self.values.dim();
        (cols as u32, rows as u32)
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0f32, f32::max)
    }

    /// Bilinear resize to `width` x `height`.
    pub fn upsample(&self, width: u32, height: u32) -> Result<Self> {
        if self.dimensions() == (width, height) {
            return Ok(self.clone());
        }
        let (src_width, src_height) = self.dimensions();
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(src_width, src_height, self.values.iter().copied().collect())
                .ok_or_else(|| GradCamError::Preprocess("heatmap buffer size mismatch".into()))?;
        let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);
        let values =
            Array2::from_shape_vec((height as usize, width as usize), resized.into_raw())?;
        Ok(Self {
            values: values.mapv(|v| v.clamp(0.0, 1.0)),
        })
    }

    /// Zeroes background pixels, then renormalises.
    pub fn apply_mask(&self, mask: &Array2<f32>, epsilon: f32) -> Result<Self> {
        if mask.dim() != self.values.dim() {
            return Err(GradCamError::Preprocess(format!(
                "mask shape {:?} differs from heatmap shape {:?}",
                mask.dim(),
                self.values.dim()
            )));
        }
        Ok(Self::normalized(&self.values * mask, epsilon))
    }
}

/// Binary foreground mask: 1 where the grayscale image is brighter than
/// `cutoff`, 0 elsewhere (scan borders and background).
pub fn foreground_mask(image: &RgbImage, cutoff: u8) -> Array2<f32> {
    let gray = imageops::grayscale(image);
    let binary = threshold(&gray, cutoff, ThresholdType::Binary);
    let (width, height) = binary.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        if binary.get_pixel(x as u32, y as u32)[0] > 0 { 1.0 } else { 0.0 }
    })
}
