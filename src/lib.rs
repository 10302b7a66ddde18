pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod heatmap;
pub mod mapping;
pub mod overlay;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod saliency;
pub mod utils;

pub use crate::classifier::{Classifier, LayerCapture, LayerInfo, load_classifier};
pub use crate::config::AppConfig;
pub use crate::error::{GradCamError, Result};
pub use crate::heatmap::{Heatmap, channel_weights, foreground_mask, weighted_activation_sum};
pub use crate::mapping::{ClassMapping, load_class_mapping};
pub use crate::overlay::{BlendPolicy, blend, jet};
pub use crate::pipeline::{InferenceContext, PredictionReport, RequestId};
pub use crate::postprocess::Prediction;
pub use crate::preprocess::{PreprocessConfig, Processor};
pub use crate::saliency::{SaliencyConfig, SaliencyGenerator, SaliencyMap};
