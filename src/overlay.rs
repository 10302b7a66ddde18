use image::{Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{GradCamError, Result};
use crate::heatmap::Heatmap;

/// Overlay opacity chosen from the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendPolicy {
    pub abnormal_alpha: f32,
    pub normal_alpha: f32,
}

impl Default for BlendPolicy {
    fn default() -> Self {
        Self {
            abnormal_alpha: 0.45,
            normal_alpha: 0.25,
        }
    }
}

impl BlendPolicy {
    pub fn alpha(&self, abnormal: bool) -> f32 {
        if abnormal { self.abnormal_alpha } else { self.normal_alpha }
    }
}

/// Jet palette: dark blue at 0, through cyan, yellow and orange, to dark red at 1.
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| {
        let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// `(1 - alpha) * base + alpha * jet(heatmap)`, per pixel.
pub fn blend(base: &RgbImage, heatmap: &Heatmap, alpha: f32) -> Result<RgbImage> {
    if heatmap.dimensions() != base.dimensions() {
        return Err(GradCamError::Preprocess(format!(
            "heatmap {:?} does not cover image {:?}",
            heatmap.dimensions(),
            base.dimensions()
        )));
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let values = heatmap.values();
    let row_len = base.width() as usize * 3;
    let mut out = base.clone();
    out.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        for (x, px) in row.chunks_mut(3).enumerate() {
            let Rgb(color) = jet(values[[y, x]]);
            for (dst, src) in px.iter_mut().zip(color) {
                *dst = ((1.0 - alpha) * *dst as f32 + alpha * src as f32).round() as u8;
            }
        }
    });
    Ok(out)
}
