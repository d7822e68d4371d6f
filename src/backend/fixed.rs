use std::sync::atomic::{AtomicUsize, Ordering};

use super::{InferenceBackend, InputTensor, RawOutput};
use crate::error::{FilterError, FilterResult};

/// Backend that ignores its input and always answers with the same output -
/// for tests or opt-out runs
pub struct StaticBackend {
    output: Option<RawOutput>,
    calls: AtomicUsize,
}

impl StaticBackend {
    pub fn new(output: RawOutput) -> Self {
        Self {
            output: Some(output),
            calls: AtomicUsize::new(0),
        }
    }

    /// Single output vector of shape `[1, n]`.
    pub fn vector(values: Vec<f32>) -> Self {
        Self::new(RawOutput::vector(values))
    }

    /// Backend whose every call fails, standing in for an unreachable engine.
    pub fn unavailable() -> Self {
        Self {
            output: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of forward passes requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl InferenceBackend for StaticBackend {
    fn run(&self, _input: &InputTensor, input_name: &str, _output_name: &str) -> FilterResult<RawOutput> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.output
            .clone()
            .ok_or_else(|| FilterError::inference(input_name, "static backend has no output"))
    }
}
