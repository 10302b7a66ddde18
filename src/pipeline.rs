use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::AppConfig;
use crate::error::{GradCamError, Result};
use crate::mapping::ClassMapping;
use crate::postprocess::Prediction;
use crate::preprocess::Processor;
use crate::saliency::SaliencyGenerator;

const MAX_REQUEST_ID_LEN: usize = 64;

/// Identifier keying one prediction's output files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Keeps `[A-Za-z0-9_-]` so the id is safe inside a file name. Falls back
    /// to a generated id when nothing usable remains.
    pub fn sanitized(raw: &str) -> Self {
        let id: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .take(MAX_REQUEST_ID_LEN)
            .collect();
        if id.is_empty() { Self::generate() } else { Self(id) }
    }

    /// `<id>_<index>`, shortening the base so the suffix always survives the
    /// length cap.
    pub fn with_index(&self, index: usize) -> Self {
        let suffix = format!("_{index}");
        let keep = MAX_REQUEST_ID_LEN.saturating_sub(suffix.len());
        let base: String = self.0.chars().take(keep).collect();
        Self(base + &suffix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub request_id: RequestId,
    pub prediction: String,
    pub confidence: f32,
    pub class_index: usize,
    pub probabilities: Vec<f32>,
    pub abnormal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradcam_path: Option<PathBuf>,
    pub original_image_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Everything a prediction needs, built once at start-up and borrowed by
/// every request.
pub struct InferenceContext {
    classifier: Box<dyn Classifier>,
    processor: Processor,
    generator: SaliencyGenerator,
    mapping: ClassMapping,
    output_dir: PathBuf,
}

impl InferenceContext {
    pub fn new(classifier: Box<dyn Classifier>, config: &AppConfig) -> Result<Self> {
        let mapping = ClassMapping::from_config(&config.labels).map_err(|e| {
            GradCamError::Config(::config::ConfigError::Message(format!(
                "cannot read labels file: {e}"
            )))
        })?;
        let processor = Processor::new(config.preprocess.clone());
        let generator = SaliencyGenerator::new(config.saliency.clone(), processor.clone());
        Ok(Self {
            classifier,
            processor,
            generator,
            mapping,
            output_dir: config.output_dir.clone(),
        })
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    pub fn gradcam_path(&self, request_id: &RequestId) -> PathBuf {
        self.output_dir.join(format!("gradcam_{request_id}.jpg"))
    }

    /// Classifies `image_path` and, when enabled, renders its saliency map
    /// to `output_dir/gradcam_<request id>.jpg`.
    pub fn predict(&self, image_path: &Path, request_id: &RequestId) -> Result<PredictionReport> {
        let (original, input) = self.processor.load_and_preprocess(image_path)?;
        let scores = self.classifier.predict(&input)?;
        let prediction = Prediction::from_scores(&scores, &self.mapping);
        info!(
            %request_id,
            image = %image_path.display(),
            label = %prediction.label,
            confidence = prediction.confidence,
            "classified image"
        );

        let saliency = self.generator.config();
        let gradcam_path = if saliency.enabled {
            fs::create_dir_all(&self.output_dir)
                .map_err(|e| GradCamError::write(&self.output_dir, e))?;
            let path = self.gradcam_path(request_id);
            let map = self.generator.render_input(
                self.classifier.as_ref(),
                &original,
                &input,
                &saliency.target_layer,
                prediction.abnormal,
                &path,
            )?;
            Some(map.path)
        } else {
            None
        };

        Ok(PredictionReport {
            request_id: request_id.clone(),
            prediction: prediction.label,
            confidence: prediction.confidence,
            class_index: prediction.class_index,
            probabilities: prediction.probabilities,
            abnormal: prediction.abnormal,
            gradcam_path,
            original_image_path: image_path.to_path_buf(),
            created_at: Utc::now(),
        })
    }
}
