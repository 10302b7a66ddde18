use ndarray::Array1;
use serde::Serialize;

use crate::mapping::ClassMapping;

/// Applies softmax to a 1D array (slice) and returns a new Array1<f32>.
pub fn softmax(slice: &Array1<f32>) -> Array1<f32> {
    let max_val = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Array1<f32> = slice.mapv(|x| (x - max_val).exp());
    let sum_exp: f32 = exp_vals.sum();
    exp_vals.mapv(|v| v / sum_exp)
}

/// Index and value of the largest score; the first index wins ties.
pub fn argmax_and_max(scores: &Array1<f32>) -> (usize, f32) {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(max_idx, max_val), (i, &val)| {
            if val > max_val { (i, val) } else { (max_idx, max_val) }
        })
}

/// Scores that already form a distribution are kept, logits go through softmax.
pub fn to_probabilities(scores: &Array1<f32>) -> Array1<f32> {
    let in_range = scores.iter().all(|v| (0.0..=1.0).contains(v));
    if in_range && (scores.sum() - 1.0).abs() < 1e-3 {
        scores.clone()
    } else {
        softmax(scores)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub abnormal: bool,
}

impl Prediction {
    pub fn from_scores(scores: &Array1<f32>, mapping: &ClassMapping) -> Self {
        let probabilities = to_probabilities(scores);
        let (class_index, confidence) = argmax_and_max(&probabilities);
        Self {
            class_index,
            label: mapping.label(class_index),
            confidence,
            probabilities: probabilities.to_vec(),
            abnormal: mapping.is_abnormal(class_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&array![1.0, 2.0, 3.0]);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax_and_max(&array![0.5, 0.5]), (0, 0.5));
        assert_eq!(argmax_and_max(&array![0.1, 0.7, 0.2]), (1, 0.7));
    }

    #[test]
    fn probabilities_pass_through() {
        let scores = array![0.2, 0.8];
        assert_eq!(to_probabilities(&scores), scores);
    }

    #[test]
    fn logits_are_softmaxed() {
        let p = to_probabilities(&array![-3.0, 4.0]);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[1] > 0.99);
    }

    #[test]
    fn prediction_maps_tumor_as_abnormal() {
        let prediction = Prediction::from_scores(&array![0.1, 0.9], &ClassMapping::default());
        assert_eq!(prediction.label, "Tumor");
        assert_eq!(prediction.class_index, 1);
        assert!(prediction.abnormal);
        assert!((prediction.confidence - 0.9).abs() < 1e-6);

        let prediction = Prediction::from_scores(&array![0.6, 0.4], &ClassMapping::default());
        assert_eq!(prediction.label, "Normal");
        assert!(!prediction.abnormal);
    }
}
