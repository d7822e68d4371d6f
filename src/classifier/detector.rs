//! Multi-box detector output decoding and non-maximum suppression

use serde::{Deserialize, Serialize};

use crate::backend::RawOutput;
use crate::error::{FilterError, FilterResult};
use crate::preprocess::PreprocessedImage;

pub const CONFIDENCE_THRESHOLD: f32 = 0.2;
pub const NMS_SCORE_THRESHOLD: f32 = 0.25;
pub const NMS_IOU_THRESHOLD: f32 = 0.45;

/// How a list of detections collapses into one NSFW scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionReduction {
    /// No reduction decided: always 0.0.
    Unsupported,
    /// Highest score among detections carrying an unsafe label.
    #[default]
    MaxUnsafeScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub labels: Vec<String>,
    pub unsafe_labels: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_score")]
    pub score_threshold: f32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
    #[serde(default)]
    pub reduction: DetectionReduction,
}

fn default_confidence() -> f32 {
    CONFIDENCE_THRESHOLD
}

fn default_score() -> f32 {
    NMS_SCORE_THRESHOLD
}

fn default_iou() -> f32 {
    NMS_IOU_THRESHOLD
}

impl DetectorConfig {
    pub fn new(labels: &[&str], unsafe_labels: &[&str]) -> Self {
        Self {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            unsafe_labels: unsafe_labels.iter().map(|s| s.to_string()).collect(),
            confidence_threshold: CONFIDENCE_THRESHOLD,
            score_threshold: NMS_SCORE_THRESHOLD,
            iou_threshold: NMS_IOU_THRESHOLD,
            reduction: DetectionReduction::MaxUnsafeScore,
        }
    }

    pub fn validate(&self) -> FilterResult<()> {
        if self.labels.is_empty() {
            return Err(FilterError::Configuration("detector needs at least one label".into()));
        }
        if let Some(label) = self.unsafe_labels.iter().find(|l| !self.labels.contains(l)) {
            return Err(FilterError::Configuration(format!(
                "unsafe label {} is not a detector label",
                label
            )));
        }
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("score_threshold", self.score_threshold),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FilterError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Collapse detections into one scalar according to `reduction`.
    pub fn reduce(&self, detections: &[Detection]) -> f32 {
        match self.reduction {
            DetectionReduction::Unsupported => 0.0,
            DetectionReduction::MaxUnsafeScore => detections
                .iter()
                .filter(|d| self.unsafe_labels.contains(&d.label))
                .map(|d| d.score)
                .fold(0.0, f32::max),
        }
    }
}

/// Axis-aligned box in source-image pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub class_id: usize,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Greedy NMS. Returns indices of kept boxes, highest score first.
pub fn non_max_suppression(
    boxes: &[BoundingBox],
    scores: &[f32],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| scores[i] >= score_threshold)
        .collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut kept: Vec<usize> = Vec::new();
    for candidate in order {
        if kept
            .iter()
            .all(|&k| boxes[k].iou(&boxes[candidate]) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Decode `[1, rows, cols]` detector output into source-space detections.
pub fn decode(
    output: &RawOutput,
    preprocessed: &PreprocessedImage,
    config: &DetectorConfig,
) -> FilterResult<Vec<Detection>> {
    if output.shape.len() != 3 || output.shape[0] != 1 {
        return Err(FilterError::inference(
            "detector",
            format!("output tensor must have shape [1, rows, cols], got {:?}", output.shape),
        ));
    }
    let (mut rows, mut cols) = (output.shape[1], output.shape[2]);
    if output.data.len() != rows * cols {
        return Err(FilterError::inference(
            "detector",
            format!("output has {} values, shape says {}", output.data.len(), rows * cols),
        ));
    }

    let expected_cols = 4 + config.labels.len();
    let transposed;
    let data: &[f32] = if rows == expected_cols && cols != expected_cols {
        // YOLO exports emit [1, 4 + classes, candidates]
        transposed = transpose(&output.data, rows, cols);
        std::mem::swap(&mut rows, &mut cols);
        &transposed
    } else {
        &output.data
    };
    if cols < 5 {
        return Err(FilterError::inference(
            "detector",
            format!("rows need 4 box values and at least one class score, got {}", cols),
        ));
    }

    let source_width = preprocessed.source_width as f32;
    let source_height = preprocessed.source_height as f32;

    let mut class_ids = Vec::new();
    let mut scores = Vec::new();
    let mut boxes = Vec::new();

    for row in data.chunks_exact(cols) {
        let Some((class_id, max_score)) = row[4..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        if max_score < config.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let (x, y) = preprocessed.to_source(cx - w / 2.0, cy - h / 2.0);
        let (w, h) = preprocessed.length_to_source(w, h);

        let x = x.clamp(0.0, source_width);
        let y = y.clamp(0.0, source_height);
        let w = w.min(source_width - x).max(0.0);
        let h = h.min(source_height - y).max(0.0);

        class_ids.push(class_id);
        scores.push(max_score);
        boxes.push(BoundingBox {
            x,
            y,
            width: w,
            height: h,
        });
    }

    let kept = non_max_suppression(&boxes, &scores, config.score_threshold, config.iou_threshold);
    Ok(kept
        .into_iter()
        .map(|i| Detection {
            label: config
                .labels
                .get(class_ids[i])
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class_ids[i])),
            class_id: class_ids[i],
            score: scores[i],
            bbox: boxes[i],
        })
        .collect())
}

fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0f32; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}
