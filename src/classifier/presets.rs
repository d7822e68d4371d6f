use serde::{Deserialize, Serialize};

use super::{ClassifierConfig, DetectorConfig, Interpretation, TensorLayout};
use crate::preprocess::{Normalization, ResizeMode};

// Class indices shared by the GantMan models and the ViT detector:
// 0: drawings (safe)
// 1: hentai (unsafe)
// 2: neutral (safe)
// 3: porn (unsafe)
// 4: sexy (unsafe)
pub const GANTMAN_LABELS: [&str; 5] = ["drawings", "hentai", "neutral", "porn", "sexy"];
pub const GANTMAN_UNSAFE: [usize; 3] = [1, 3, 4];

pub const NUDENET_LABELS: [&str; 18] = [
    "FEMALE_GENITALIA_COVERED",
    "FACE_FEMALE",
    "BUTTOCKS_EXPOSED",
    "FEMALE_BREAST_EXPOSED",
    "FEMALE_GENITALIA_EXPOSED",
    "MALE_BREAST_EXPOSED",
    "ANUS_EXPOSED",
    "FEET_EXPOSED",
    "BELLY_COVERED",
    "FEET_COVERED",
    "ARMPITS_COVERED",
    "ARMPITS_EXPOSED",
    "FACE_MALE",
    "BELLY_EXPOSED",
    "MALE_GENITALIA_EXPOSED",
    "ANUS_COVERED",
    "FEMALE_BREAST_COVERED",
    "BUTTOCKS_COVERED",
];
pub const NUDENET_UNSAFE: [&str; 5] = [
    "BUTTOCKS_EXPOSED",
    "FEMALE_BREAST_EXPOSED",
    "FEMALE_GENITALIA_EXPOSED",
    "ANUS_EXPOSED",
    "MALE_GENITALIA_EXPOSED",
];

/// Known models and how to drive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preset {
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,
    #[serde(rename = "inception_v3")]
    InceptionV3,
    #[serde(rename = "bumble")]
    Bumble,
    #[serde(rename = "nudenet")]
    NudeNet,
    #[serde(rename = "vit_nsfw")]
    VitNsfw,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::MobileNetV2,
        Preset::InceptionV3,
        Preset::Bumble,
        Preset::NudeNet,
        Preset::VitNsfw,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::MobileNetV2 => "mobilenet_v2",
            Preset::InceptionV3 => "inception_v3",
            Preset::Bumble => "bumble",
            Preset::NudeNet => "nudenet",
            Preset::VitNsfw => "vit_nsfw",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name.to_lowercase())
    }

    /// Model file relative to the models directory. `None` for hub-hosted models.
    pub fn model_file(&self) -> Option<&'static str> {
        match self {
            Preset::MobileNetV2 => Some("GantMan/MobileNet_v2/MobileNetV2.onnx"),
            Preset::InceptionV3 => Some("GantMan/Inception_V3/nsfw.299x299.onnx"),
            Preset::Bumble => Some("Bumble/bumble.onnx"),
            Preset::NudeNet => Some("NudeNet/640m.onnx"),
            Preset::VitNsfw => None,
        }
    }

    pub fn config(&self) -> ClassifierConfig {
        let gantman = || Interpretation::LabelSubsetSum {
            labels: GANTMAN_LABELS.iter().map(|s| s.to_string()).collect(),
            unsafe_indices: GANTMAN_UNSAFE.to_vec(),
        };
        let (input_name, output_name, size, resize, normalization, layout, interpretation) = match self {
            Preset::MobileNetV2 => (
                "self:0",
                "sequential/prediction/Softmax:0",
                224,
                ResizeMode::Stretch,
                Normalization::UnitRange,
                TensorLayout::Nhwc,
                gantman(),
            ),
            Preset::InceptionV3 => (
                "input_1:0",
                "dense_3/Softmax:0",
                299,
                ResizeMode::Stretch,
                Normalization::UnitRange,
                TensorLayout::Nhwc,
                gantman(),
            ),
            Preset::Bumble => (
                "x:0",
                "Identity:0",
                480,
                ResizeMode::Pad,
                Normalization::Symmetric,
                TensorLayout::Flat,
                Interpretation::SingleScalar { index: 0 },
            ),
            Preset::NudeNet => (
                "images",
                "output0",
                640,
                ResizeMode::Pad,
                Normalization::UnitRange,
                TensorLayout::Nchw,
                Interpretation::Detector(DetectorConfig::new(&NUDENET_LABELS, &NUDENET_UNSAFE)),
            ),
            Preset::VitNsfw => (
                "pixel_values",
                "logits",
                224,
                ResizeMode::Stretch,
                Normalization::MeanStd {
                    mean: [0.5; 3],
                    std: [0.5; 3],
                },
                TensorLayout::Nchw,
                gantman(),
            ),
        };

        ClassifierConfig {
            name: self.name().to_string(),
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            width: size,
            height: size,
            resize,
            normalization,
            layout,
            interpretation,
        }
    }
}
