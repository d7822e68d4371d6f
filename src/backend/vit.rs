use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::vit;
use hf_hub::{Repo, RepoType, api::sync::Api};
use std::sync::Mutex;

use super::{InferenceBackend, InputTensor, RawOutput};
use crate::error::{FilterError, FilterResult};

pub const MODEL_REPO: &str = "LukeJacob2023/nsfw-image-detector";
// drawings, hentai, neutral, porn, sexy
const NUM_CLASSES: usize = 5;

/// ViT NSFW classifier (LukeJacob2023/nsfw-image-detector) run through candle.
/// Returns softmax probabilities for the five GantMan classes.
pub struct VitBackend {
    model: Mutex<vit::Model>,
    device: Device,
}

impl VitBackend {
    pub fn new() -> Result<Self> {
        Self::from_repo(MODEL_REPO)
    }

    pub fn from_repo(model_repo: &str) -> Result<Self> {
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0).unwrap_or(Device::Cpu);
        #[cfg(not(feature = "metal"))]
        let device = Device::Cpu;

        log::info!("[nsfw] Loading ViT model {} on {:?}", model_repo, device);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_repo.to_string(), RepoType::Model));

        let model_path = repo.get("model.safetensors")?;
        let config_path = repo.get("config.json")?;

        let config: vit::Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], DType::F32, &device)? };
        let model = vit::Model::new(&config, NUM_CLASSES, vb)?;

        log::info!("[nsfw] ViT model loaded");

        Ok(Self {
            model: Mutex::new(model),
            device,
        })
    }

    fn forward(&self, input: &InputTensor) -> Result<RawOutput> {
        let tensor = Tensor::from_vec(input.data.clone(), input.shape.clone(), &self.device)?;
        let model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let logits = model.forward(&tensor)?;
        let probs = candle_nn::ops::softmax(&logits, 1)?;
        let shape = probs.dims().to_vec();
        let data: Vec<f32> = probs.flatten_all()?.to_vec1()?;
        Ok(RawOutput { shape, data })
    }
}

impl InferenceBackend for VitBackend {
    fn run(&self, input: &InputTensor, input_name: &str, _output_name: &str) -> FilterResult<RawOutput> {
        if input.shape.len() != 4 || input.shape[1] != 3 {
            return Err(FilterError::inference(
                input_name,
                format!("ViT expects a [1, 3, H, W] tensor, got {:?}", input.shape),
            ));
        }
        self.forward(input)
            .map_err(|e| FilterError::inference(input_name, e))
    }
}
