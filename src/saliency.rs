use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{Classifier, LayerCapture};
use crate::error::{GradCamError, Result};
use crate::heatmap::{EPSILON, Heatmap, foreground_mask};
use crate::overlay::{BlendPolicy, blend};
use crate::preprocess::Processor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    pub enabled: bool,
    /// Convolutional layer to probe; the last VGG16 convolution by default.
    pub target_layer: String,
    /// Grayscale level at or below which a pixel counts as background.
    pub foreground_cutoff: u8,
    pub epsilon: f32,
    #[serde(flatten)]
    pub blend: BlendPolicy,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_layer: "block5_conv3".to_string(),
            foreground_cutoff: 10,
            epsilon: EPSILON,
            blend: BlendPolicy::default(),
        }
    }
}

/// Result of one saliency computation.
#[derive(Debug, Clone)]
pub struct SaliencyMap {
    pub path: PathBuf,
    pub class_index: usize,
    pub alpha: f32,
    pub heatmap: Heatmap,
}

/// Grad-CAM renderer. Holds no per-request state, so one instance serves
/// every prediction.
#[derive(Debug, Clone)]
pub struct SaliencyGenerator {
    config: SaliencyConfig,
    processor: Processor,
}

impl SaliencyGenerator {
    pub fn new(config: SaliencyConfig, processor: Processor) -> Self {
        Self { config, processor }
    }

    pub fn config(&self) -> &SaliencyConfig {
        &self.config
    }

    /// Decodes `image_path`, renders the composite for `layer` and writes it
    /// to `output_path`. Nothing is written unless every step succeeds.
    pub fn compute_saliency(
        &self,
        classifier: &dyn Classifier,
        image_path: &Path,
        layer: &str,
        abnormal: bool,
        output_path: &Path,
    ) -> Result<SaliencyMap> {
        let original = self.processor.load(image_path)?;
        self.render(classifier, &original, layer, abnormal, output_path)
    }

    /// Same as [`compute_saliency`](Self::compute_saliency) for an image that
    /// is already decoded.
    pub fn render(
        &self,
        classifier: &dyn Classifier,
        original: &RgbImage,
        layer: &str,
        abnormal: bool,
        output_path: &Path,
    ) -> Result<SaliencyMap> {
        let input = self.processor.preprocess(original)?;
        self.render_input(classifier, original, &input, layer, abnormal, output_path)
    }

    /// Renders from a model input already derived from `original`.
    pub fn render_input(
        &self,
        classifier: &dyn Classifier,
        original: &RgbImage,
        input: &Array4<f32>,
        layer: &str,
        abnormal: bool,
        output_path: &Path,
    ) -> Result<SaliencyMap> {
        let capture = classifier.capture(input, layer)?;
        let heatmap = self.heatmap(&capture, layer)?;
        let (heatmap, composite) = self.overlay(original, &heatmap, abnormal)?;
        let alpha = self.config.blend.alpha(abnormal);
        debug!(
            layer,
            class_index = capture.class_index,
            alpha,
            width = original.width(),
            height = original.height(),
            "composited heatmap"
        );

        write_atomically(&composite, output_path)?;
        info!(path = %output_path.display(), "saved saliency map");
        Ok(SaliencyMap {
            path: output_path.to_path_buf(),
            class_index: capture.class_index,
            alpha,
            heatmap,
        })
    }

    /// Layer-resolution Grad-CAM map for a capture.
    pub fn heatmap(&self, capture: &LayerCapture, layer: &str) -> Result<Heatmap> {
        Heatmap::from_gradients(&capture.activations, &capture.gradients, self.config.epsilon)
            .map_err(|err| match err {
                GradCamError::GradientUnavailable { reason, .. } => {
                    GradCamError::GradientUnavailable {
                        layer: layer.to_string(),
                        reason,
                    }
                }
                other => other,
            })
    }

    /// Upsampled, masked and blended composite at the original resolution.
    pub fn composite(
        &self,
        original: &RgbImage,
        heatmap: &Heatmap,
        abnormal: bool,
    ) -> Result<RgbImage> {
        Ok(self.overlay(original, heatmap, abnormal)?.1)
    }

    fn overlay(
        &self,
        original: &RgbImage,
        heatmap: &Heatmap,
        abnormal: bool,
    ) -> Result<(Heatmap, RgbImage)> {
        let (width, height) = original.dimensions();
        let heatmap = heatmap.upsample(width, height)?;
        let mask = foreground_mask(original, self.config.foreground_cutoff);
        let heatmap = heatmap.apply_mask(&mask, self.config.epsilon)?;
        let composite = blend(original, &heatmap, self.config.blend.alpha(abnormal))?;
        Ok((heatmap, composite))
    }
}

/// Encodes into a temporary file next to `path`, then renames it over `path`.
fn write_atomically(image: &RgbImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).map_err(|e| {
        GradCamError::write(path, io::Error::new(io::ErrorKind::InvalidInput, e))
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| GradCamError::write(path, e))?;
    encode(image, format, tmp.as_file_mut(), path)?;
    tmp.as_file().sync_all().map_err(|e| GradCamError::write(path, e))?;
    tmp.persist(path).map_err(|e| GradCamError::write(path, e.error))?;
    Ok(())
}

/// Encodes through a buffer and flushes it, so a failed tail write is an
/// error rather than a truncated file.
fn encode<W: Write + Seek>(
    image: &RgbImage,
    format: ImageFormat,
    out: W,
    path: &Path,
) -> Result<()> {
    let mut writer = BufWriter::new(out);
    image.write_to(&mut writer, format).map_err(|e| {
        let io = match e {
            image::ImageError::IoError(io) => io,
            other => io::Error::other(other),
        };
        GradCamError::write(path, io)
    })?;
    writer.flush().map_err(|e| GradCamError::write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn defaults_probe_last_vgg16_conv() {
        let config = SaliencyConfig::default();
        assert_eq!(config.target_layer, "block5_conv3");
        assert_eq!(config.foreground_cutoff, 10);
        assert_eq!(config.blend.alpha(true), 0.45);
        assert_eq!(config.blend.alpha(false), 0.25);
    }

    #[test]
    fn atomic_write_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradcam.png");
        write_atomically(&RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])), &path).unwrap();
        write_atomically(&RgbImage::from_pixel(5, 4, Rgb([9, 9, 9])), &path).unwrap();
        let written = image::open(&path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (5, 4));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    /// Accepts every write but fails to flush, like a full disk.
    struct FullDisk(io::Cursor<Vec<u8>>);

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("no space left on device"))
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    #[test]
    fn failed_flush_is_a_write_error() {
        let image = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));
        let sink = FullDisk(io::Cursor::new(Vec::new()));
        let err = encode(&image, ImageFormat::Png, sink, Path::new("gradcam.png")).unwrap_err();
        match err {
            GradCamError::Write { path, source } => {
                assert_eq!(path, Path::new("gradcam.png"));
                assert_eq!(source.to_string(), "no space left on device");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_extension_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradcam.unknown");
        let err = write_atomically(&RgbImage::new(2, 2), &path).unwrap_err();
        assert!(matches!(err, GradCamError::Write { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn missing_directory_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("gradcam.jpg");
        let err = write_atomically(&RgbImage::new(2, 2), &path).unwrap_err();
        assert!(matches!(err, GradCamError::Write { .. }));
    }
}
