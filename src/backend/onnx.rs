use anyhow::{Context, Result};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::{InferenceBackend, InputTensor, RawOutput};
use crate::assets;
use crate::error::{FilterError, FilterResult};

/// ONNX Runtime session loaded from a (possibly chunked) model file.
pub struct OnnxBackend {
    session: Mutex<Session>,
    name: String,
}

impl OnnxBackend {
    /// Load `<path>.0`, `<path>.1`, ... (or `<path>` itself) into a session.
    pub fn load(model_path: &Path) -> Result<Self> {
        let bytes = assets::read_file_chunked(model_path)
            .with_context(|| format!("reading model {}", model_path.display()))?;
        log::info!(
            "[nsfw] Loading ONNX model {} ({} bytes)",
            model_path.display(),
            bytes.len()
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_memory(&bytes)?;

        Ok(Self {
            session: Mutex::new(session),
            name: model_path.display().to_string(),
        })
    }

    fn forward(&self, input: &InputTensor, input_name: &str, output_name: &str) -> Result<RawOutput> {
        let tensor = Tensor::from_array((input.shape.clone(), input.data.clone()))?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let outputs = session.run(ort::inputs![input_name => tensor])?;
        let value = outputs
            .get(output_name)
            .ok_or_else(|| anyhow::anyhow!("model has no output named {}", output_name))?;

        // Some exports emit half precision
        if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
            return Ok(RawOutput {
                shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                data: data.to_vec(),
            });
        }
        let (shape, data) = value.try_extract_tensor::<half::f16>()?;
        Ok(RawOutput {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.iter().map(|v| v.to_f32()).collect(),
        })
    }
}

impl InferenceBackend for OnnxBackend {
    fn run(&self, input: &InputTensor, input_name: &str, output_name: &str) -> FilterResult<RawOutput> {
        self.forward(input, input_name, output_name)
            .map_err(|e| FilterError::inference(&self.name, e))
    }
}
