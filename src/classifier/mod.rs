use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{InferenceBackend, InputTensor, RawOutput};
use crate::error::{FilterError, FilterResult};
use crate::preprocess::{Normalization, PreprocessedImage, ResizeMode, preprocess};

mod detector;
mod presets;

pub use detector::{
    BoundingBox, CONFIDENCE_THRESHOLD, Detection, DetectionReduction, DetectorConfig,
    NMS_IOU_THRESHOLD, NMS_SCORE_THRESHOLD, decode as decode_detections, non_max_suppression,
};
pub use presets::{GANTMAN_LABELS, GANTMAN_UNSAFE, NUDENET_LABELS, NUDENET_UNSAFE, Preset};

/// Shape of the tensor handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, interleaved.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`, planar.
    Nchw,
    /// `[1, H * W * 3]`, interleaved.
    Flat,
}

/// Rule turning a raw output vector into one NSFW likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interpretation {
    /// The model emits the probability directly.
    SingleScalar { index: usize },
    /// Softmax over named categories; the unsafe ones are summed.
    LabelSubsetSum {
        labels: Vec<String>,
        unsafe_indices: Vec<usize>,
    },
    /// Boxes with class scores, reduced after NMS.
    Detector(DetectorConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub name: String,
    pub input_name: String,
    pub output_name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub resize: ResizeMode,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub layout: TensorLayout,
    pub interpretation: Interpretation,
}

impl ClassifierConfig {
    pub fn validate(&self) -> FilterResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FilterError::Configuration(format!(
                "{}: input size must be non-zero, got {}x{}",
                self.name, self.width, self.height
            )));
        }
        if let Normalization::MeanStd { std, .. } = &self.normalization {
            if std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err(FilterError::Configuration(format!(
                    "{}: normalization std must be finite and non-zero",
                    self.name
                )));
            }
        }
        match &self.interpretation {
            Interpretation::SingleScalar { .. } => Ok(()),
            Interpretation::LabelSubsetSum {
                labels,
                unsafe_indices,
            } => {
                if unsafe_indices.is_empty() {
                    return Err(FilterError::Configuration(format!(
                        "{}: no unsafe categories configured",
                        self.name
                    )));
                }
                if !labels.is_empty() {
                    if let Some(i) = unsafe_indices.iter().find(|&&i| i >= labels.len()) {
                        return Err(FilterError::Configuration(format!(
                            "{}: unsafe index {} out of range for {} labels",
                            self.name,
                            i,
                            labels.len()
                        )));
                    }
                }
                Ok(())
            }
            Interpretation::Detector(detector) => detector.validate(),
        }
    }

    fn input_tensor(&self, preprocessed: &PreprocessedImage) -> InputTensor {
        let (h, w) = (preprocessed.height as usize, preprocessed.width as usize);
        match self.layout {
            TensorLayout::Nhwc => InputTensor {
                shape: vec![1, h, w, 3],
                data: preprocessed.pixels.clone(),
            },
            TensorLayout::Nchw => InputTensor {
                shape: vec![1, 3, h, w],
                data: preprocessed.planar(),
            },
            TensorLayout::Flat => InputTensor {
                shape: vec![1, h * w * 3],
                data: preprocessed.pixels.clone(),
            },
        }
    }
}

/// One classifier's verdict on one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// In [0, 1], rounded to two decimals.
    pub probability: f32,
    /// Only filled by detector classifiers.
    pub detections: Vec<Detection>,
}

/// A model plus the rules for feeding it and reading its output.
#[derive(Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    backend: Arc<dyn InferenceBackend>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}

impl Classifier {
    pub fn new(config: ClassifierConfig, backend: Arc<dyn InferenceBackend>) -> FilterResult<Self> {
        config.validate()?;
        Ok(Self { config, backend })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn preprocess(&self, image: &DynamicImage) -> FilterResult<PreprocessedImage> {
        preprocess(
            image,
            self.config.width,
            self.config.height,
            self.config.resize,
            self.config.normalization,
        )
    }

    /// Preprocess, run the model, and interpret its output.
    pub fn classify(&self, image: &DynamicImage) -> FilterResult<Classification> {
        let preprocessed = self.preprocess(image)?;
        let input = self.config.input_tensor(&preprocessed);
        let output = self
            .backend
            .run(&input, &self.config.input_name, &self.config.output_name)
            .map_err(|e| match e {
                FilterError::InferenceUnavailable { reason, .. } => {
                    FilterError::inference(&self.config.name, reason)
                }
                other => other,
            })?;
        self.interpret(&preprocessed, &output)
    }

    pub fn interpret(
        &self,
        preprocessed: &PreprocessedImage,
        output: &RawOutput,
    ) -> FilterResult<Classification> {
        let values = &output.data;
        let (raw, detections) = match &self.config.interpretation {
            Interpretation::SingleScalar { index } => {
                let value = values.get(*index).copied().ok_or_else(|| {
                    FilterError::inference(
                        &self.config.name,
                        format!("output has {} values, expected index {}", values.len(), index),
                    )
                })?;
                (value, Vec::new())
            }
            Interpretation::LabelSubsetSum {
                labels,
                unsafe_indices,
            } => {
                if values.len() < labels.len() {
                    return Err(FilterError::inference(
                        &self.config.name,
                        format!("expected {} categories, got {}", labels.len(), values.len()),
                    ));
                }
                let mut sum = 0.0;
                for &i in unsafe_indices {
                    sum += values.get(i).copied().ok_or_else(|| {
                        FilterError::inference(
                            &self.config.name,
                            format!("output has {} values, expected index {}", values.len(), i),
                        )
                    })?;
                }
                (sum, Vec::new())
            }
            Interpretation::Detector(detector) => {
                let detections = detector::decode(output, preprocessed, detector).map_err(|e| match e {
                    FilterError::InferenceUnavailable { reason, .. } => {
                        FilterError::inference(&self.config.name, reason)
                    }
                    other => other,
                })?;
                (detector.reduce(&detections), detections)
            }
        };

        if !raw.is_finite() {
            return Err(FilterError::inference(&self.config.name, "model produced a non-finite score"));
        }

        Ok(Classification {
            probability: round2(raw.clamp(0.0, 1.0)),
            detections,
        })
    }
}

/// Round to two decimal places.
pub(crate) fn round2(value: f32) -> f32 {
    ((value as f64) * 100.0).round() as f32 / 100.0
}
