use crate::error::FilterResult;

/// Dense f32 tensor handed to an inference backend.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Flattened model output plus the shape the model reported.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawOutput {
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![1, data.len()],
            data,
        }
    }
}

/// Pluggable inference engine. Created once and shared by every frame.
pub trait InferenceBackend: Send + Sync {
    /// Run one forward pass, feeding `input` as `input_name` and reading `output_name`.
    fn run(&self, input: &InputTensor, input_name: &str, output_name: &str) -> FilterResult<RawOutput>;
}

mod fixed;
#[cfg(feature = "onnx")]
mod onnx;
mod vit;

pub use fixed::StaticBackend;
#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
pub use vit::VitBackend;
