//! Scan configuration
//!
//! Runtime knobs come from the environment; the ensemble itself can be
//! described in a JSON file.
//!
//! ## Environment Variables
//! - `NSFW_WORKERS` - frames scored in parallel (default: `1`, sequential)
//! - `FFMPEG_PATH` - decoder binary (default: `ffmpeg`)
//! - `FFMPEG_THREADS` - decoder threads (default: ffmpeg's choice)
//! - `NSFW_MODELS_DIR` - root for ONNX model files (default: `<data dir>/cleo/models`)
//! - `NSFW_ENSEMBLE` - path to an ensemble JSON file (default: built-in ensemble)

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{InferenceBackend, StaticBackend, VitBackend};
use crate::classifier::{Classifier, ClassifierConfig, Preset};
use crate::decoder::{DEFAULT_FFMPEG, FfmpegDecoder};
use crate::ensemble::Ensemble;

const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub workers: usize,
    pub ffmpeg: PathBuf,
    pub ffmpeg_threads: Option<usize>,
    pub models_dir: PathBuf,
    pub ensemble_file: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let positive = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
        };

        Self {
            workers: positive("NSFW_WORKERS").unwrap_or(DEFAULT_WORKERS),
            ffmpeg: lookup("FFMPEG_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
            ffmpeg_threads: positive("FFMPEG_THREADS"),
            models_dir: lookup("NSFW_MODELS_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_models_dir),
            ensemble_file: lookup("NSFW_ENSEMBLE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn decoder(&self) -> FfmpegDecoder {
        let decoder = FfmpegDecoder::new(&self.ffmpeg);
        match self.ffmpeg_threads {
            Some(threads) => decoder.with_threads(threads),
            None => decoder,
        }
    }

    /// Ensemble description from `NSFW_ENSEMBLE`, or the built-in one.
    pub fn ensemble_spec(&self) -> Result<EnsembleSpec> {
        match &self.ensemble_file {
            Some(path) => EnsembleSpec::load(path),
            None => Ok(EnsembleSpec::default()),
        }
    }

    /// Load every model and build the validated ensemble.
    pub fn build_ensemble(&self) -> Result<Ensemble> {
        self.ensemble_spec()?.build(&self.models_dir)
    }
}

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("cleo").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

/// Which inference engine runs a member.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    /// ONNX model file (chunked or whole) under the models directory.
    #[default]
    Onnx,
    /// ViT model fetched from the Hugging Face hub and run with candle.
    Vit,
    /// Fixed output, for dry runs.
    Static { output: Vec<f32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    #[serde(default)]
    pub preset: Option<Preset>,
    /// Inline classifier settings; overrides `preset`.
    #[serde(default)]
    pub classifier: Option<ClassifierConfig>,
    pub weight: f32,
    #[serde(default)]
    pub backend: BackendSpec,
    /// Model path, relative to the models directory unless absolute.
    #[serde(default)]
    pub model: Option<PathBuf>,
}

impl MemberSpec {
    pub fn preset(preset: Preset, weight: f32, backend: BackendSpec) -> Self {
        Self {
            preset: Some(preset),
            classifier: None,
            weight,
            backend,
            model: None,
        }
    }

    fn classifier_config(&self) -> Result<ClassifierConfig> {
        match (&self.classifier, self.preset) {
            (Some(config), _) => Ok(config.clone()),
            (None, Some(preset)) => Ok(preset.config()),
            (None, None) => bail!("ensemble member needs a preset or a classifier"),
        }
    }

    fn model_path(&self, models_dir: &Path) -> Result<PathBuf> {
        let relative = match (&self.model, self.preset.and_then(|p| p.model_file())) {
            (Some(model), _) => model.clone(),
            (None, Some(file)) => PathBuf::from(file),
            (None, None) => bail!("ensemble member has no model file"),
        };
        Ok(models_dir.join(relative))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSpec {
    pub members: Vec<MemberSpec>,
}

impl Default for EnsembleSpec {
    /// MobileNetV2 (0.3) and InceptionV3 (0.5) when built with ONNX support,
    /// otherwise the hub-hosted ViT model alone.
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            Self {
                members: vec![
                    MemberSpec::preset(Preset::MobileNetV2, 0.3, BackendSpec::Onnx),
                    MemberSpec::preset(Preset::InceptionV3, 0.5, BackendSpec::Onnx),
                ],
            }
        } else {
            Self {
                members: vec![MemberSpec::preset(Preset::VitNsfw, 1.0, BackendSpec::Vit)],
            }
        }
    }
}

impl EnsembleSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading ensemble file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing ensemble file {}", path.display()))
    }

    /// Create every backend once and wrap the members into an [`Ensemble`].
    pub fn build(&self, models_dir: &Path) -> Result<Ensemble> {
        let mut vit: Option<Arc<dyn InferenceBackend>> = None;
        let mut members = Vec::with_capacity(self.members.len());

        for member in &self.members {
            let config = member.classifier_config()?;
            let backend: Arc<dyn InferenceBackend> = match &member.backend {
                BackendSpec::Static { output } => Arc::new(StaticBackend::vector(output.clone())),
                BackendSpec::Vit => match &vit {
                    Some(backend) => backend.clone(),
                    None => {
                        let backend: Arc<dyn InferenceBackend> = Arc::new(VitBackend::new()?);
                        vit = Some(backend.clone());
                        backend
                    }
                },
                BackendSpec::Onnx => onnx_backend(&member.model_path(models_dir)?)?,
            };
            log::info!("[nsfw] {} ready (weight {})", config.name, member.weight);
            members.push((Classifier::new(config, backend)?, member.weight));
        }

        Ok(Ensemble::new(members)?)
    }
}

#[cfg(feature = "onnx")]
fn onnx_backend(path: &Path) -> Result<Arc<dyn InferenceBackend>> {
    Ok(Arc::new(crate::backend::OnnxBackend::load(path)?))
}

#[cfg(not(feature = "onnx"))]
fn onnx_backend(path: &Path) -> Result<Arc<dyn InferenceBackend>> {
    bail!(
        "{} needs ONNX support; rebuild with --features onnx",
        path.display()
    )
}
