use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::classifier::ModelConfig;
use crate::error::Result;
use crate::mapping::LabelsConfig;
use crate::preprocess::PreprocessConfig;
use crate::saliency::SaliencyConfig;

/// Prefix of environment overrides, e.g. `KIDNEY__SALIENCY__TARGET_LAYER`.
pub const ENV_PREFIX: &str = "KIDNEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub saliency: SaliencyConfig,
    pub labels: LabelsConfig,
    /// Directory receiving `gradcam_<request id>.jpg` composites.
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            preprocess: PreprocessConfig::default(),
            saliency: SaliencyConfig::default(),
            labels: LabelsConfig::default(),
            output_dir: PathBuf::from("static"),
        }
    }
}

impl AppConfig {
    /// Defaults, then `path` when given, then `KIDNEY__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::classifier::ModelFormat;
    use crate::error::GradCamError;
    use crate::preprocess::ResizeFilter;

    #[test]
    fn defaults_without_sources() {
        let config = AppConfig::default();
        assert_eq!(config.output_dir, PathBuf::from("static"));
        assert_eq!(config.saliency.target_layer, "block5_conv3");
        assert_eq!(config.preprocess.width, 224);
        assert_eq!(config.labels.positive_class, 1);
    }

    #[test]
    fn file_overrides_selected_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
output_dir = "out"

[model]
path = "models/kidney.onnx"

[preprocess]
filter = "bilinear"

[saliency]
target_layer = "block4_conv3"
abnormal_alpha = 0.5
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.model.resolved_format().unwrap(), ModelFormat::Onnx);
        assert_eq!(config.preprocess.filter, ResizeFilter::Bilinear);
        assert_eq!(config.saliency.target_layer, "block4_conv3");
        assert_eq!(config.saliency.blend.alpha(true), 0.5);
        // untouched keys keep their defaults
        assert_eq!(config.saliency.blend.alpha(false), 0.25);
        assert_eq!(config.saliency.foreground_cutoff, 10);
        assert_eq!(config.model.architecture.channels.len(), 5);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = AppConfig::load(Some(Path::new("does/not/exist.toml"))).unwrap_err();
        assert!(matches!(err, GradCamError::Config(_)));
    }
}
