//! Error kinds shared by the frame pipeline

use thiserror::Error;

pub type FilterResult<T> = Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    /// Zero-dimension, empty or undecodable frame. Local to one frame.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// The decoder byte stream failed. Fatal to the whole run.
    #[error("frame stream error: {0}")]
    Stream(String),
    /// A classifier inference call failed or returned unusable output.
    #[error("inference unavailable for {classifier}: {reason}")]
    InferenceUnavailable { classifier: String, reason: String },
    /// Malformed weights or classifier settings, raised before any frame is read.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("frame stream cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FilterError {
    pub fn inference(classifier: &str, reason: impl std::fmt::Display) -> Self {
        FilterError::InferenceUnavailable {
            classifier: classifier.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that only concern a single frame.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            FilterError::InvalidImage(_)
                | FilterError::Image(_)
                | FilterError::InferenceUnavailable { .. }
        )
    }
}
