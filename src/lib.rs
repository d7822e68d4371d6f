//! Cleo NSFW frame scanner
//!
//! Splits an ffmpeg `image2pipe` JPEG stream into frames, scores each frame
//! with an ensemble of image classifiers and reports one probability per frame.

pub mod assets;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod ensemble;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod preprocess;
pub mod splitter;

pub use classifier::{Classifier, ClassifierConfig, Interpretation, Preset};
pub use config::ScanConfig;
pub use ensemble::{Ensemble, EnsembleResult, ScoreRecord, combine};
pub use error::{FilterError, FilterResult};
pub use pipeline::{FrameOutcome, Pipeline, PipelineSummary, scan_video};
pub use splitter::{FrameBuffer, FrameSplitter, split_frames};
