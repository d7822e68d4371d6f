//! Weighted ensemble over several classifiers
//!
//! Each member scores the frame independently; the scores are combined into
//! one probability with a consensus bonus when the members agree.

use image::DynamicImage;

use crate::classifier::{Classification, Classifier};
use crate::error::{FilterError, FilterResult};

/// One classifier's contribution to a frame's ensemble score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub classifier: String,
    /// In [0, 1].
    pub probability: f32,
    pub weight: f32,
    pub classification: Option<Classification>,
}

impl ScoreRecord {
    pub fn new(classifier: &str, probability: f32, weight: f32) -> Self {
        Self {
            classifier: classifier.to_string(),
            probability,
            weight,
            classification: None,
        }
    }
}

/// Final per-frame ensemble output.
#[derive(Debug)]
pub struct EnsembleResult {
    /// In [0, 1], rounded to two decimals.
    pub probability: f32,
    pub records: Vec<ScoreRecord>,
    /// Members whose inference failed for this frame.
    pub failures: Vec<FilterError>,
}

/// Combine per-classifier scalars into one probability.
///
/// Scores are whole percentages. The weighted average of the scores gets a
/// bonus of `clamp(1 + 10 / spread, 1, 2)`, where spread is the population
/// variance of the unweighted scores; no bonus when spread is zero. Weights
/// are renormalized over the given records. Returns `None` when there is
/// nothing to combine or a weight is negative or not finite.
pub fn combine(records: &[ScoreRecord]) -> Option<f32> {
    if records.iter().any(|r| !r.weight.is_finite() || r.weight < 0.0) {
        return None;
    }
    let total_weight: f64 = records.iter().map(|r| r.weight as f64).sum();
    if records.is_empty() || total_weight <= 0.0 || !total_weight.is_finite() {
        return None;
    }

    let scores: Vec<(f64, f64)> = records
        .iter()
        .map(|r| (percentage(r.probability), r.weight as f64 / total_weight))
        .collect();

    let mut weighted_average: f64 = scores.iter().map(|(score, weight)| score * weight).sum();
    let mean = scores.iter().map(|(score, _)| score).sum::<f64>() / scores.len() as f64;
    let spread = scores
        .iter()
        .map(|(score, _)| (score - mean).powi(2))
        .sum::<f64>()
        / scores.len() as f64;

    if spread != 0.0 {
        let bonus = (1.0 + 10.0 / spread).clamp(1.0, 2.0);
        weighted_average *= bonus;
    }

    let probability = (weighted_average / 100.0).clamp(0.0, 1.0);
    Some(((probability * 100.0).round() / 100.0) as f32)
}

/// `[0, 1]` scalar to a whole percentage in `[0, 100]`, truncated.
fn percentage(probability: f32) -> f64 {
    if probability.is_nan() {
        return 0.0;
    }
    (probability * 100.0).clamp(0.0, 100.0) as i32 as f64
}

/// Validated set of classifiers with weights normalized to sum to one.
#[derive(Debug, Clone)]
pub struct Ensemble {
    members: Vec<(Classifier, f32)>,
}

impl Ensemble {
    pub fn new(members: Vec<(Classifier, f32)>) -> FilterResult<Self> {
        if members.is_empty() {
            return Err(FilterError::Configuration("ensemble has no classifiers".into()));
        }
        for (classifier, weight) in &members {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(FilterError::Configuration(format!(
                    "{}: weight must be a non-negative number, got {}",
                    classifier.name(),
                    weight
                )));
            }
        }
        let total: f32 = members.iter().map(|(_, w)| w).sum();
        if total <= 0.0 || !total.is_finite() {
            return Err(FilterError::Configuration(format!(
                "ensemble weights must have a positive total, got {}",
                total
            )));
        }

        let members = members
            .into_iter()
            .map(|(classifier, weight)| (classifier, weight / total))
            .collect();
        Ok(Self { members })
    }

    pub fn members(&self) -> &[(Classifier, f32)] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Run every member on `image` and combine the results.
    ///
    /// Failing members are skipped and reported; the frame fails only when no
    /// member produced a usable score.
    pub fn score(&self, image: &DynamicImage) -> FilterResult<EnsembleResult> {
        let mut records = Vec::with_capacity(self.members.len());
        let mut failures = Vec::new();

        for (classifier, weight) in &self.members {
            match classifier.classify(image) {
                Ok(classification) => records.push(ScoreRecord {
                    classifier: classifier.name().to_string(),
                    probability: classification.probability,
                    weight: *weight,
                    classification: Some(classification),
                }),
                Err(e @ FilterError::InferenceUnavailable { .. }) => {
                    log::warn!("[nsfw] {} skipped: {}", classifier.name(), e);
                    failures.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        let probability = combine(&records).ok_or_else(|| {
            FilterError::inference(
                "ensemble",
                format!("no usable classifier output ({} failed)", failures.len()),
            )
        })?;

        Ok(EnsembleResult {
            probability,
            records,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticBackend;
    use crate::classifier::{ClassifierConfig, Interpretation, TensorLayout};
    use crate::preprocess::{Normalization, ResizeMode};
    use image::RgbImage;
    use std::sync::Arc;

    fn records(scores: &[(f32, f32)]) -> Vec<ScoreRecord> {
        scores
            .iter()
            .enumerate()
            .map(|(i, (p, w))| ScoreRecord::new(&format!("m{}", i), *p, *w))
            .collect()
    }

    fn scalar_classifier(name: &str, backend: StaticBackend) -> Classifier {
        let config = ClassifierConfig {
            name: name.into(),
            input_name: "in".into(),
            output_name: "out".into(),
            width: 4,
            height: 4,
            resize: ResizeMode::Stretch,
            normalization: Normalization::UnitRange,
            layout: TensorLayout::Nhwc,
            interpretation: Interpretation::SingleScalar { index: 0 },
        };
        Classifier::new(config, Arc::new(backend)).unwrap()
    }

    #[test]
    fn test_agreement_gets_no_bonus() {
        assert_eq!(combine(&records(&[(0.9, 0.5), (0.9, 0.5)])), Some(0.9));
    }

    #[test]
    fn test_disagreement_bonus() {
        // mean 50, spread 1600, bonus 1.00625 -> 50.31
        assert_eq!(combine(&records(&[(0.1, 0.5), (0.9, 0.5)])), Some(0.5));
    }

    #[test]
    fn test_small_spread_gets_large_bonus() {
        // scores 40 and 42: spread 1, bonus capped at 2
        assert_eq!(combine(&records(&[(0.4, 1.0), (0.42, 1.0)])), Some(0.82));
        // scores 30 and 40: spread 25, bonus 1.4, weighted average 35
        assert_eq!(combine(&records(&[(0.3, 1.0), (0.4, 1.0)])), Some(0.49));
    }

    #[test]
    fn test_percentages_truncate() {
        assert_eq!(combine(&records(&[(0.499, 1.0)])), Some(0.49));
        assert_eq!(combine(&records(&[(0.999, 1.0)])), Some(0.99));
        assert_eq!(combine(&records(&[(0.29, 1.0)])), Some(0.29));
        // 49 and 50 after truncation: spread 0.25, bonus capped at 2
        assert_eq!(combine(&records(&[(0.499, 1.0), (0.5, 1.0)])), Some(0.99));
    }

    #[test]
    fn test_result_clamped_to_one() {
        assert_eq!(combine(&records(&[(0.9, 1.0), (0.92, 1.0)])), Some(1.0));
    }

    #[test]
    fn test_single_classifier_passthrough() {
        for s in [0.0f32, 0.07, 0.33, 0.5, 0.99, 1.0] {
            assert_eq!(combine(&records(&[(s, 1.0)])), Some(s));
        }
        assert_eq!(combine(&records(&[(1.4, 1.0)])), Some(1.0));
        assert_eq!(combine(&records(&[(-0.2, 1.0)])), Some(0.0));
    }

    #[test]
    fn test_weight_scaling_invariance() {
        let small = combine(&records(&[(0.2, 0.3), (0.7, 0.5)]));
        let large = combine(&records(&[(0.2, 3.0), (0.7, 5.0)]));
        assert!(small.is_some());
        assert_eq!(small, large);
    }

    #[test]
    fn test_nothing_to_combine() {
        assert_eq!(combine(&[]), None);
        assert_eq!(combine(&records(&[(0.5, 0.0)])), None);
    }

    #[test]
    fn test_invalid_record_weights() {
        assert_eq!(combine(&records(&[(0.2, -1.0), (0.8, 2.0)])), None);
        assert_eq!(combine(&records(&[(0.2, f32::NAN), (0.8, 1.0)])), None);
        assert_eq!(combine(&records(&[(0.2, f32::INFINITY)])), None);
    }

    #[test]
    fn test_ensemble_normalizes_weights() {
        let ensemble = Ensemble::new(vec![
            (scalar_classifier("a", StaticBackend::vector(vec![0.1])), 3.0),
            (scalar_classifier("b", StaticBackend::vector(vec![0.1])), 5.0),
        ])
        .unwrap();
        let weights: Vec<f32> = ensemble.members().iter().map(|(_, w)| *w).collect();
        assert_eq!(weights, vec![0.375, 0.625]);
    }

    #[test]
    fn test_ensemble_rejects_bad_weights() {
        let build = |w: f32| {
            Ensemble::new(vec![(scalar_classifier("a", StaticBackend::vector(vec![0.1])), w)])
        };
        assert!(matches!(build(-1.0), Err(FilterError::Configuration(_))));
        assert!(matches!(build(0.0), Err(FilterError::Configuration(_))));
        assert!(matches!(build(f32::NAN), Err(FilterError::Configuration(_))));
        assert!(matches!(Ensemble::new(vec![]), Err(FilterError::Configuration(_))));
    }

    #[test]
    fn test_score_skips_failed_members() {
        let ensemble = Ensemble::new(vec![
            (scalar_classifier("ok", StaticBackend::vector(vec![0.8])), 0.3),
            (scalar_classifier("down", StaticBackend::unavailable()), 0.5),
        ])
        .unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let result = ensemble.score(&image).unwrap();
        assert_eq!(result.probability, 0.8);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.failures.len(), 1);
    }

    #[test]
    fn test_score_fails_when_all_members_fail() {
        let ensemble = Ensemble::new(vec![(
            scalar_classifier("down", StaticBackend::unavailable()),
            1.0,
        )])
        .unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        assert!(matches!(
            ensemble.score(&image),
            Err(FilterError::InferenceUnavailable { .. })
        ));
    }

    #[test]
    fn test_score_invalid_image_aborts_frame() {
        let ensemble = Ensemble::new(vec![(
            scalar_classifier("ok", StaticBackend::vector(vec![0.8])),
            1.0,
        )])
        .unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(ensemble.score(&image), Err(FilterError::InvalidImage(_))));
    }
}
