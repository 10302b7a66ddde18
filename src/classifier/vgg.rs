use burn::{
    nn::{
        Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::activation::softmax,
};
use serde::{Deserialize, Serialize};

use super::LayerInfo;
use crate::error::{GradCamError, Result};

/// VGG-style stack: `convs[b]` 3x3 convolutions with `channels[b]` filters per
/// block, each block closed by a 2x2 max pool, then flatten + dense + softmax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VggConfig {
    pub channels: Vec<usize>,
    pub convs: Vec<usize>,
    pub num_classes: usize,
    pub input_size: usize,
}

impl Default for VggConfig {
    fn default() -> Self {
        Self::vgg16()
    }
}

impl VggConfig {
    /// VGG16 feature extractor with a two-class head.
    pub fn vgg16() -> Self {
        Self {
            channels: vec![64, 128, 256, 512, 512],
            convs: vec![2, 2, 3, 3, 3],
            num_classes: 2,
            input_size: 224,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() != self.convs.len() {
            return Err(GradCamError::Model(format!(
                "architecture needs one conv count per block, got {} blocks and {} counts",
                self.channels.len(),
                self.convs.len()
            )));
        }
        if self.convs.contains(&0) || self.channels.contains(&0) || self.num_classes == 0 {
            return Err(GradCamError::Model("architecture has an empty layer".into()));
        }
        if self.feature_size() == 0 {
            return Err(GradCamError::Model(format!(
                "input size {} is too small for {} pooling stages",
                self.input_size,
                self.channels.len()
            )));
        }
        Ok(())
    }

    /// Spatial size after the last pool.
    pub fn feature_size(&self) -> usize {
        self.input_size >> self.channels.len()
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        for (block, &convs) in self.convs.iter().enumerate() {
            stages.extend((0..convs).map(|conv| Stage::Conv { block, conv }));
            stages.push(Stage::Pool { block });
        }
        stages
    }

    pub fn layers(&self) -> Vec<LayerInfo> {
        self.stages()
            .into_iter()
            .map(|stage| {
                let (size, channels) = match stage {
                    Stage::Conv { block, .. } => (self.input_size >> block, self.channels[block]),
                    Stage::Pool { block } => (self.input_size >> (block + 1), self.channels[block]),
                };
                LayerInfo {
                    name: stage.name(),
                    shape: Some([size, size, channels]),
                }
            })
            .collect()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VggNet<B> {
        let mut in_channels = 3;
        let blocks: Vec<VggBlock<B>> = self
            .channels
            .iter()
            .zip(&self.convs)
            .map(|(&out_channels, &convs)| {
                let block = VggBlock::new(in_channels, out_channels, convs, device);
                in_channels = out_channels;
                block
            })
            .collect();
        let features = in_channels * self.feature_size() * self.feature_size();
        VggNet {
            blocks,
            activation: Relu::new(),
            classifier: LinearConfig::new(features, self.num_classes).init(device),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conv { block: usize, conv: usize },
    Pool { block: usize },
}

impl Stage {
    /// Keras-style layer name, 1-based.
    pub fn name(&self) -> String {
        match self {
            Stage::Conv { block, conv } => format!("block{}_conv{}", block + 1, conv + 1),
            Stage::Pool { block } => format!("block{}_pool", block + 1),
        }
    }
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> VggBlock<B> {
    pub fn new(c1: usize, c2: usize, n: usize, device: &B::Device) -> Self {
        let convs = (0..n)
            .map(|i| {
                let c_in = if i == 0 { c1 } else { c2 };
                Conv2dConfig::new([c_in, c2], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device)
            })
            .collect();
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self { convs, pool }
    }
}

#[derive(Module, Debug)]
pub struct VggNet<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    activation: Relu,
    classifier: Linear<B>,
}

impl<B: Backend> VggNet<B> {
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        for (block, vgg_block) in self.blocks.iter().enumerate() {
            stages.extend((0..vgg_block.convs.len()).map(|conv| Stage::Conv { block, conv }));
            stages.push(Stage::Pool { block });
        }
        stages
    }

    pub fn stage_index(&self, layer: &str) -> Option<usize> {
        self.stages().iter().position(|stage| stage.name() == layer)
    }

    fn apply(&self, stage: Stage, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match stage {
            Stage::Conv { block, conv } => {
                self.activation.forward(self.blocks[block].convs[conv].forward(x))
            }
            Stage::Pool { block } => self.blocks[block].pool.forward(x),
        }
    }

    /// Runs stages `0..=last`.
    ///
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, channels, h, w]
    pub fn features(&self, images: Tensor<B, 4>, last: usize) -> Tensor<B, 4> {
        self.stages()
            .into_iter()
            .take(last + 1)
            .fold(images, |x, stage| self.apply(stage, x))
    }

    /// Continues from the output of stage `last` through the head.
    pub fn classify_from(&self, activations: Tensor<B, 4>, last: usize) -> Tensor<B, 2> {
        let x = self
            .stages()
            .into_iter()
            .skip(last + 1)
            .fold(activations, |x, stage| self.apply(stage, x));
        let x = x.flatten::<2>(1, 3);
        softmax(self.classifier.forward(x), 1)
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, class_prob]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let last = self.stages().len() - 1;
        let features = self.features(images, last);
        self.classify_from(features, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny() -> VggConfig {
        VggConfig {
            channels: vec![4, 8],
            convs: vec![1, 2],
            num_classes: 2,
            input_size: 16,
        }
    }

    #[test]
    fn vgg16_layer_names_match_keras() {
        let layers = VggConfig::vgg16().layers();
        assert_eq!(layers.len(), 18);
        assert_eq!(layers[0].name, "block1_conv1");
        assert_eq!(layers[2].name, "block1_pool");
        let last_conv = layers.iter().find(|l| l.name == "block5_conv3").unwrap();
        assert_eq!(last_conv.shape, Some([14, 14, 512]));
        assert_eq!(layers.last().unwrap().shape, Some([7, 7, 512]));
    }

    #[test]
    fn validate_rejects_mismatched_blocks() {
        let config = VggConfig {
            convs: vec![1],
            ..tiny()
        };
        assert!(config.validate().is_err());
        let config = VggConfig {
            input_size: 2,
            ..tiny()
        };
        assert!(config.validate().is_err());
        assert!(tiny().validate().is_ok());
    }

    #[test]
    fn forward_outputs_class_probabilities() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        let probs = model.forward(images);
        assert_eq!(probs.dims(), [1, 2]);
        let values = probs.into_data().to_vec::<f32>().unwrap();
        assert!((values.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn split_forward_matches_full_forward() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        let stage = model.stage_index("block2_conv1").unwrap();
        let features = model.features(images.clone(), stage);
        assert_eq!(features.dims(), [1, 8, 8, 8]);

        let split = model.classify_from(features, stage).into_data().to_vec::<f32>().unwrap();
        let full = model.forward(images).into_data().to_vec::<f32>().unwrap();
        for (a, b) in split.iter().zip(&full) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn model_and_config_agree_on_stages() {
        let device = Default::default();
        let config = tiny();
        let model = config.init::<TestBackend>(&device);
        assert_eq!(model.stages(), config.stages());
        assert_eq!(model.stage_index("block3_conv1"), None);
    }
}
