use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use burn::{
    backend::{Autodiff, NdArray},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::AutodiffBackend,
};
use ndarray::{Array1, Array3, Array4};
use tracing::debug;

use super::vgg::{VggConfig, VggNet};
use super::{Classifier, LayerCapture, LayerInfo};
use crate::error::{GradCamError, Result};
use crate::postprocess::argmax_and_max;

pub type CpuAutodiff = Autodiff<NdArray<f32>>;

/// VGG classifier whose gradients come from burn's reverse-mode autodiff.
/// The model sits behind a lock so one instance can serve several threads.
pub struct BurnClassifier<B: AutodiffBackend> {
    model: Mutex<VggNet<B>>,
    config: VggConfig,
    device: B::Device,
}

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| GradCamError::Model(format!("cannot read tensor data: {e:?}")))
}

impl<B: AutodiffBackend> BurnClassifier<B> {
    pub fn new(model: VggNet<B>, config: VggConfig, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model),
            config,
            device,
        }
    }

    fn model(&self) -> Result<MutexGuard<'_, VggNet<B>>> {
        self.model
            .lock()
            .map_err(|_| GradCamError::Model("model lock poisoned by a failed capture".into()))
    }

    /// Randomly initialised weights.
    pub fn init(config: &VggConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.init(device), config.clone(), device.clone()))
    }

    /// Weights from a record written with `NamedMpkFileRecorder<FullPrecisionSettings>`.
    pub fn load(config: &VggConfig, path: &Path, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = config
            .init::<B>(device)
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| {
                GradCamError::Model(format!("failed to load {}: {e:?}", path.display()))
            })?;
        Ok(Self::new(model, config.clone(), device.clone()))
    }

    pub fn config(&self) -> &VggConfig {
        &self.config
    }

    /// `(1, H, W, 3)` ndarray input to a `[1, 3, H, W]` tensor.
    fn to_tensor(&self, input: &Array4<f32>) -> Result<Tensor<B, 4>> {
        let &[batch, height, width, channels] = input.shape() else {
            return Err(GradCamError::Preprocess("input must be 4-dimensional".into()));
        };
        let size = self.config.input_size;
        if channels != 3 || height != size || width != size {
            return Err(GradCamError::Preprocess(format!(
                "model expects (N, {size}, {size}, 3), got {:?}",
                input.shape()
            )));
        }
        let values: Vec<f32> = input.iter().copied().collect();
        let data = TensorData::new(values, [batch, height, width, channels]);
        Ok(Tensor::<B, 4>::from_data(data, &self.device).permute([0, 3, 1, 2]))
    }
}

impl<B: AutodiffBackend> Classifier for BurnClassifier<B> {
    fn layers(&self) -> Vec<LayerInfo> {
        self.config.layers()
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Array1<f32>> {
        let images = self.to_tensor(input)?;
        let scores = self.model()?.forward(images).slice([0..1]);
        Ok(Array1::from_vec(tensor_values(scores)?))
    }

    fn capture(&self, input: &Array4<f32>, layer: &str) -> Result<LayerCapture> {
        let model = self.model()?;
        let stage = model
            .stage_index(layer)
            .ok_or_else(|| GradCamError::LayerNotFound(layer.to_string()))?;
        let images = self.to_tensor(input)?;

        // Cut the graph at the probed layer so its output becomes a leaf.
        let activations = model.features(images, stage).detach().require_grad();
        let scores = model.classify_from(activations.clone(), stage);
        drop(model);

        let score_values = Array1::from_vec(tensor_values(scores.clone().slice([0..1]))?);
        let (class_index, _) = argmax_and_max(&score_values);

        let target = scores.slice([0..1, class_index..class_index + 1]).sum();
        let grads = target.backward();
        let gradients = activations
            .grad(&grads)
            .ok_or_else(|| GradCamError::GradientUnavailable {
                layer: layer.to_string(),
                reason: "no gradient reached the layer output".into(),
            })?;

        let [_, channels, height, width] = activations.dims();
        debug!(layer, height, width, channels, class_index, "captured layer");
        let activations = tensor_values(activations.permute([0, 2, 3, 1]))?;
        let gradients = tensor_values(gradients.permute([0, 2, 3, 1]))?;

        Ok(LayerCapture::new(
            score_values,
            Array3::from_shape_vec((height, width, channels), activations)?,
            Array3::from_shape_vec((height, width, channels), gradients)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> VggConfig {
        VggConfig {
            channels: vec![4, 6],
            convs: vec![1, 1],
            num_classes: 2,
            input_size: 16,
        }
    }

    fn input() -> Array4<f32> {
        Array4::from_shape_fn((1, 16, 16, 3), |(_, y, x, c)| {
            ((x * 7 + y * 3 + c) % 11) as f32 / 10.0
        })
    }

    #[test]
    fn capture_returns_layer_shaped_maps() {
        let device = Default::default();
        let classifier = BurnClassifier::<CpuAutodiff>::init(&tiny(), &device).unwrap();
        let capture = classifier.capture(&input(), "block2_conv1").unwrap();
        assert_eq!(capture.activations.shape(), &[8, 8, 6]);
        assert_eq!(capture.gradients.shape(), &[8, 8, 6]);
        assert_eq!(capture.scores.len(), 2);
        assert!(capture.activations.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn capture_scores_match_predict() {
        let device = Default::default();
        let classifier = BurnClassifier::<CpuAutodiff>::init(&tiny(), &device).unwrap();
        let scores = classifier.predict(&input()).unwrap();
        let capture = classifier.capture(&input(), "block1_pool").unwrap();
        for (a, b) in scores.iter().zip(capture.scores.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        let (expected, _) = argmax_and_max(&scores);
        assert_eq!(capture.class_index, expected);
    }

    /// Class scores from the head, fed with `(h, w, c)` layer activations.
    fn head_scores(
        classifier: &BurnClassifier<CpuAutodiff>,
        activations: &Array3<f32>,
        stage: usize,
    ) -> Vec<f32> {
        let (h, w, c) = activations.dim();
        let chw: Vec<f32> = activations.view().permuted_axes([2, 0, 1]).iter().copied().collect();
        let tensor =
            Tensor::<CpuAutodiff, 4>::from_data(TensorData::new(chw, [1, c, h, w]), &classifier.device);
        let model = classifier.model().unwrap();
        tensor_values(model.classify_from(tensor, stage)).unwrap()
    }

    #[test]
    fn gradients_match_finite_differences() {
        let device = Default::default();
        let classifier = BurnClassifier::<CpuAutodiff>::init(&tiny(), &device).unwrap();
        let layer = "block2_pool";
        let stage = classifier.model().unwrap().stage_index(layer).unwrap();
        let capture = classifier.capture(&input(), layer).unwrap();
        let class = capture.class_index;
        let other = 1 - class;

        let step = 1e-2;
        let max_grad = capture.gradients.iter().fold(0.0f32, |m, g| m.max(g.abs()));
        assert!(max_grad > 1e-5, "gradient vanished: {max_grad}");

        for (index, &grad) in capture.gradients.indexed_iter() {
            let mut plus = capture.activations.clone();
            plus[index] += step;
            let mut minus = capture.activations.clone();
            minus[index] -= step;
            let (up, down) = (
                head_scores(&classifier, &plus, stage),
                head_scores(&classifier, &minus, stage),
            );

            let numeric = (up[class] - down[class]) / (2.0 * step);
            let tolerance = 1e-4 + 1e-2 * grad.abs();
            assert!(
                (numeric - grad).abs() < tolerance,
                "at {index:?}: autodiff {grad}, finite difference {numeric}"
            );

            // two softmax outputs sum to one, so their gradients are opposite
            let numeric_other = (up[other] - down[other]) / (2.0 * step);
            assert!((numeric_other + grad).abs() < tolerance);
        }
    }

    #[test]
    fn unknown_layer_is_reported() {
        let device = Default::default();
        let classifier = BurnClassifier::<CpuAutodiff>::init(&tiny(), &device).unwrap();
        let err = classifier.capture(&input(), "block5_conv3").unwrap_err();
        assert!(matches!(err, GradCamError::LayerNotFound(name) if name == "block5_conv3"));
    }

    #[test]
    fn wrong_input_size_is_rejected() {
        let device = Default::default();
        let classifier = BurnClassifier::<CpuAutodiff>::init(&tiny(), &device).unwrap();
        let err = classifier.predict(&Array4::zeros((1, 8, 8, 3))).unwrap_err();
        assert!(matches!(err, GradCamError::Preprocess(_)));
    }

    #[test]
    fn load_reports_missing_record() {
        let device = Default::default();
        let result =
            BurnClassifier::<CpuAutodiff>::load(&tiny(), Path::new("missing/model.mpk"), &device);
        assert!(matches!(result, Err(GradCamError::Model(_))));
    }
}
