//! ONNX Runtime classifier.
//!
//! ONNX Runtime has no reverse-mode differentiation at inference time, so the
//! exported graph has to carry the Grad-CAM tensors itself: the probed layer is
//! a graph output named exactly as the layer, and the gradient of the top class
//! score with respect to it is a second output named `<layer>_grad`.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array1, Array4, ArrayD, Axis, Ix3};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use tracing::debug;

use super::{Classifier, LayerCapture, LayerInfo};
use crate::error::{GradCamError, Result};

pub const GRADIENT_SUFFIX: &str = "_grad";

pub struct OnnxModel {
    provider: [ExecutionProviderDispatch; 1],
}

impl OnnxModel {
    pub fn new(cuda: bool) -> Self {
        let provider = if cuda {
            [CUDAExecutionProvider::default().build().error_on_failure()]
        } else {
            [CPUExecutionProvider::default().build()]
        };
        Self { provider }
    }

    pub fn load_model(&self, model_path: &Path) -> Result<Session> {
        let session = SessionBuilder::new()
            .map_err(GradCamError::model)?
            .with_execution_providers(self.provider.clone())
            .map_err(GradCamError::model)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(GradCamError::model)?
            .commit_from_file(model_path)
            .map_err(|e| {
                GradCamError::Model(format!("failed to load {}: {e}", model_path.display()))
            })?;
        Ok(session)
    }
}

pub struct OnnxClassifier {
    session: Session,
    scores_output: String,
}

impl OnnxClassifier {
    pub fn load(path: &Path, cuda: bool, scores_output: Option<String>) -> Result<Self> {
        let session = OnnxModel::new(cuda).load_model(path)?;
        let scores_output = match scores_output {
            Some(name) => name,
            None => session
                .outputs
                .first()
                .map(|output| output.name.clone())
                .ok_or_else(|| GradCamError::Model("model has no outputs".into()))?,
        };
        if !session.outputs.iter().any(|o| o.name == scores_output) {
            return Err(GradCamError::Model(format!(
                "scores output `{scores_output}` not found"
            )));
        }
        Ok(Self {
            session,
            scores_output,
        })
    }

    fn output_names(&self) -> Vec<String> {
        self.session.outputs.iter().map(|o| o.name.clone()).collect()
    }

    fn run(&self, input: &Array4<f32>) -> Result<HashMap<String, ArrayD<f32>>> {
        let xs = input.view().into_dyn();
        let input_data = ort::inputs![xs].map_err(GradCamError::model)?;
        let ys = self.session.run(input_data).map_err(GradCamError::model)?;
        let mut arrays = HashMap::new();
        for (name, value) in ys.iter() {
            // Non-f32 outputs (argmax indices and the like) are not needed here.
            if let Ok(tensor) = value.try_extract_tensor::<f32>() {
                arrays.insert(name.to_string(), tensor.into_owned());
            }
        }
        Ok(arrays)
    }

    fn take_output(
        outputs: &mut HashMap<String, ArrayD<f32>>,
        name: &str,
    ) -> Result<ArrayD<f32>> {
        outputs
            .remove(name)
            .ok_or_else(|| GradCamError::Model(format!("output `{name}` is not a f32 tensor")))
    }
}

/// Outputs other than the scores and the `_grad` companions.
fn probe_layers(outputs: &[String], scores_output: &str) -> Vec<LayerInfo> {
    outputs
        .iter()
        .filter(|name| *name != scores_output && !name.ends_with(GRADIENT_SUFFIX))
        .map(|name| LayerInfo {
            name: name.clone(),
            shape: None,
        })
        .collect()
}

/// Name of the output carrying the gradient for `layer`.
fn gradient_output(outputs: &[String], layer: &str) -> Result<String> {
    if !outputs.iter().any(|name| name == layer) {
        return Err(GradCamError::LayerNotFound(layer.to_string()));
    }
    let gradient = format!("{layer}{GRADIENT_SUFFIX}");
    if !outputs.contains(&gradient) {
        return Err(GradCamError::GradientUnavailable {
            layer: layer.to_string(),
            reason: format!("graph does not export `{gradient}`"),
        });
    }
    Ok(gradient)
}

/// Drops the batch axis, keeping the first sample.
fn first_sample(array: ArrayD<f32>, name: &str) -> Result<ArrayD<f32>> {
    if array.ndim() == 0 || array.len_of(Axis(0)) == 0 {
        return Err(GradCamError::Model(format!(
            "output `{name}` has no batch entries (shape {:?})",
            array.shape()
        )));
    }
    Ok(array.index_axis_move(Axis(0), 0))
}

impl Classifier for OnnxClassifier {
    fn layers(&self) -> Vec<LayerInfo> {
        probe_layers(&self.output_names(), &self.scores_output)
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Array1<f32>> {
        let mut outputs = self.run(input)?;
        let scores = Self::take_output(&mut outputs, &self.scores_output)?;
        Ok(first_sample(scores, &self.scores_output)?.iter().copied().collect())
    }

    fn capture(&self, input: &Array4<f32>, layer: &str) -> Result<LayerCapture> {
        let gradient_output = gradient_output(&self.output_names(), layer)?;

        let mut outputs = self.run(input)?;
        let scores = Self::take_output(&mut outputs, &self.scores_output)?;
        let scores: Array1<f32> = first_sample(scores, &self.scores_output)?
            .iter()
            .copied()
            .collect();
        let activations = first_sample(Self::take_output(&mut outputs, layer)?, layer)?
            .into_dimensionality::<Ix3>()?;
        let gradients =
            first_sample(Self::take_output(&mut outputs, &gradient_output)?, &gradient_output)?
                .into_dimensionality::<Ix3>()?;
        if activations.shape() != gradients.shape() {
            return Err(GradCamError::GradientUnavailable {
                layer: layer.to_string(),
                reason: format!(
                    "gradient shape {:?} differs from activation shape {:?}",
                    gradients.shape(),
                    activations.shape()
                ),
            });
        }
        debug!(layer, shape = ?activations.shape(), "captured onnx outputs");
        Ok(LayerCapture::new(scores, activations, gradients))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn outputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn layers_hide_scores_and_gradients() {
        let names = outputs(&["dense", "block5_conv3", "block5_conv3_grad", "block4_pool"]);
        let layers: Vec<_> = probe_layers(&names, "dense")
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(layers, ["block5_conv3", "block4_pool"]);
    }

    #[test]
    fn missing_layer_output_is_not_found() {
        let names = outputs(&["dense", "block5_conv3", "block5_conv3_grad"]);
        let err = gradient_output(&names, "block4_conv1").unwrap_err();
        assert!(matches!(err, GradCamError::LayerNotFound(name) if name == "block4_conv1"));
    }

    #[test]
    fn layer_without_gradient_output_is_unavailable() {
        let names = outputs(&["dense", "block5_conv3", "block4_pool"]);
        let err = gradient_output(&names, "block4_pool").unwrap_err();
        assert!(matches!(err, GradCamError::GradientUnavailable { ref layer, .. } if layer == "block4_pool"));
        assert_eq!(gradient_output(&outputs(&["a", "a_grad"]), "a").unwrap(), "a_grad");
    }

    #[test]
    fn empty_batch_is_a_model_error() {
        let scalar = Array::from_elem(IxDyn(&[]), 1.0f32);
        assert!(matches!(first_sample(scalar, "dense"), Err(GradCamError::Model(_))));
        let empty = Array::<f32, _>::zeros(IxDyn(&[0, 2]));
        assert!(matches!(first_sample(empty, "dense"), Err(GradCamError::Model(_))));

        let batch = Array::from_shape_vec(IxDyn(&[2, 2]), vec![0.3, 0.7, 0.9, 0.1]).unwrap();
        let first = first_sample(batch, "dense").unwrap();
        assert_eq!(first.as_slice().unwrap(), &[0.3, 0.7]);
    }
}
