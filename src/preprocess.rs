use std::path::Path;

use fast_image_resize::images::Image;
use fast_image_resize::{PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{GradCamError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    Bilinear,
}

impl ResizeFilter {
    fn algorithm(self) -> ResizeAlg {
        match self {
            ResizeFilter::Nearest => ResizeAlg::Nearest,
            ResizeFilter::Bilinear => {
                ResizeAlg::Convolution(fast_image_resize::FilterType::Bilinear)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub height: usize,
    pub width: usize,
    pub filter: ResizeFilter,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        // Plain /255 scaling, the way the classifier was trained.
        Self {
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            height: 224,
            width: 224,
            filter: ResizeFilter::Nearest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    /// Create a new instance of the Processor struct
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Decode an image at its native resolution, converted to 8-bit RGB.
    pub fn load(&self, path: &Path) -> Result<RgbImage> {
        let image = image::open(path).map_err(|source| GradCamError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(image.to_rgb8())
    }

    /// Resize to the model resolution without preserving aspect ratio.
    pub fn resize(&self, image: &RgbImage) -> Result<RgbImage> {
        let (width, height) = (self.config.width as u32, self.config.height as u32);
        if image.dimensions() == (width, height) {
            return Ok(image.clone());
        }
        let src = DynamicImage::ImageRgb8(image.clone());
        let mut dst_image = Image::new(width, height, PixelType::U8x3);

        let mut resizer = Resizer::new();
        let resize_options = ResizeOptions::new().resize_alg(self.config.filter.algorithm());
        resizer
            .resize(&src, &mut dst_image, Some(&resize_options))
            .map_err(|e| GradCamError::Preprocess(e.to_string()))?;

        RgbImage::from_raw(width, height, dst_image.buffer().to_vec()).ok_or_else(|| {
            GradCamError::Preprocess("resized buffer does not match target size".into())
        })
    }

    /// Resize and normalize into a `(1, height, width, 3)` tensor.
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let resized = self.resize(image)?;
        let (mean, std) = (self.config.mean, self.config.std);
        let mut img_arr = Array4::<f32>::zeros((1, self.config.height, self.config.width, 3));
        for (x, y, rgb) in resized.enumerate_pixels() {
            for c in 0..3 {
                img_arr[[0, y as usize, x as usize, c]] =
                    (rgb[c] as f32 / 255.0 - mean[c]) / std[c];
            }
        }
        Ok(img_arr)
    }

    pub fn load_and_preprocess(&self, path: &Path) -> Result<(RgbImage, Array4<f32>)> {
        let original = self.load(path)?;
        let input = self.preprocess(&original)?;
        Ok((original, input))
    }
}
