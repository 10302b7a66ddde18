//! Classifier backends able to expose a named intermediate layer together with
//! the gradient of the predicted class score with respect to that layer.

mod autodiff;
mod onnx;
mod vgg;

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array3, Array4};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GradCamError, Result};
use crate::postprocess::argmax_and_max;

pub use autodiff::{BurnClassifier, CpuAutodiff};
pub use onnx::{GRADIENT_SUFFIX, OnnxClassifier, OnnxModel};
pub use vgg::{Stage, VggBlock, VggConfig, VggNet};

/// Output of one forward pass probed at an intermediate layer.
#[derive(Debug, Clone)]
pub struct LayerCapture {
    pub scores: Array1<f32>,
    pub class_index: usize,
    /// `(height, width, channels)`
    pub activations: Array3<f32>,
    /// Gradient of `scores[class_index]` with respect to `activations`.
    pub gradients: Array3<f32>,
}

impl LayerCapture {
    pub fn new(scores: Array1<f32>, activations: Array3<f32>, gradients: Array3<f32>) -> Self {
        let (class_index, _) = argmax_and_max(&scores);
        Self {
            scores,
            class_index,
            activations,
            gradients,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    pub name: String,
    /// `(height, width, channels)` when known without running the model.
    pub shape: Option<[usize; 3]>,
}

/// Shared read-only across requests, possibly from several threads.
pub trait Classifier: Send + Sync {
    /// Addressable layers, in graph order.
    fn layers(&self) -> Vec<LayerInfo>;

    /// Class scores for a `(1, height, width, 3)` input.
    fn predict(&self, input: &Array4<f32>) -> Result<Array1<f32>>;

    /// Forward pass that also returns `layer`'s activations and the gradient of
    /// the top class score with respect to them.
    fn capture(&self, input: &Array4<f32>, layer: &str) -> Result<LayerCapture>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Burn,
    Onnx,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "onnx" => Some(ModelFormat::Onnx),
            "mpk" => Some(ModelFormat::Burn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Detected from the file extension when unset.
    pub format: Option<ModelFormat>,
    pub cuda: bool,
    pub architecture: VggConfig,
    /// ONNX output holding the class scores; the first output when unset.
    pub scores_output: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("artifacts/training/model.mpk"),
            format: None,
            cuda: false,
            architecture: VggConfig::vgg16(),
            scores_output: None,
        }
    }
}

impl ModelConfig {
    pub fn resolved_format(&self) -> Result<ModelFormat> {
        self.format
            .or_else(|| ModelFormat::from_path(&self.path))
            .ok_or_else(|| {
                GradCamError::Model(format!(
                    "cannot infer model format from {}",
                    self.path.display()
                ))
            })
    }
}

/// Builds the classifier once; callers share it by reference afterwards.
pub fn load_classifier(config: &ModelConfig) -> Result<Box<dyn Classifier>> {
    let format = config.resolved_format()?;
    info!(path = %config.path.display(), ?format, "loading classifier");
    match format {
        ModelFormat::Burn => {
            let device = Default::default();
            let classifier =
                BurnClassifier::<CpuAutodiff>::load(&config.architecture, &config.path, &device)?;
            Ok(Box::new(classifier))
        }
        ModelFormat::Onnx => {
            let classifier =
                OnnxClassifier::load(&config.path, config.cuda, config.scores_output.clone())?;
            Ok(Box::new(classifier))
        }
    }
}
