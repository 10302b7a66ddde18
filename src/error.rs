use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GradCamError>;

#[derive(Error, Debug)]
pub enum GradCamError {
    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Layer `{0}` not found in model graph")]
    LayerNotFound(String),
    #[error("Gradients unavailable for layer `{layer}`: {reason}")]
    GradientUnavailable { layer: String, reason: String },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Model error: {0}")]
    Model(String),
    #[error("Preprocessing error: {0}")]
    Preprocess(String),
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl GradCamError {
    pub(crate) fn model(err: impl std::fmt::Display) -> Self {
        GradCamError::Model(err.to_string())
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GradCamError::Write {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_item() {
        let err = GradCamError::LayerNotFound("block9_conv1".into());
        assert_eq!(err.to_string(), "Layer `block9_conv1` not found in model graph");

        let err = GradCamError::GradientUnavailable {
            layer: "conv".into(),
            reason: "no gradient output".into(),
        };
        assert!(err.to_string().contains("no gradient output"));
    }

    #[test]
    fn write_error_keeps_io_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = GradCamError::write("static/out.jpg", io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("read-only"));
    }
}
