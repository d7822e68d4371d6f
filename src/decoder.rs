//! ffmpeg as the external video decoder
//!
//! Every decoded frame is written to stdout as a maximum-quality MJPEG image
//! (`image2pipe`), with frame-rate sync disabled so no frame is dropped or
//! duplicated.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::{FilterError, FilterResult};

pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Spawns the decode process for one input video.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    binary: PathBuf,
    threads: Option<usize>,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_FFMPEG)
    }
}

impl FfmpegDecoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            threads: None,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads).filter(|t| *t > 0);
        self
    }

    /// Argument list passed to ffmpeg for `input`.
    pub fn args(&self, input: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(threads) = self.threads {
            args.push("-threads".into());
            args.push(threads.to_string());
        }
        args.push("-i".into());
        args.push(input.to_string_lossy().into_owned());
        for arg in ["-an", "-sn", "-f", "image2pipe", "-vcodec", "mjpeg", "-vsync", "0", "-q:v", "1", "pipe:1"] {
            args.push(arg.to_string());
        }
        args
    }

    /// Start decoding `input`. The child is killed if the handle is dropped early.
    pub fn spawn(&self, input: &Path) -> FilterResult<DecodeProcess> {
        if !input.is_file() {
            return Err(FilterError::Stream(format!(
                "input video not found: {}",
                input.display()
            )));
        }

        let mut child = Command::new(&self.binary)
            .args(self.args(input))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FilterError::Stream(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FilterError::Stream("decoder stdout not captured".into()))?;

        // stderr must be drained or ffmpeg stalls on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        log::info!("[frames] Decoding {} with {}", input.display(), self.binary.display());

        Ok(DecodeProcess {
            child,
            stdout: Some(stdout),
            stderr_task,
        })
    }
}

/// A running decoder. Its stdout is the frame byte stream.
pub struct DecodeProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<String>>,
}

impl DecodeProcess {
    /// Take the byte stream. Can only be taken once.
    pub fn take_stdout(&mut self) -> FilterResult<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| FilterError::Stream("decoder stdout already taken".into()))
    }

    /// Wait for the decoder to exit; a non-zero exit is a stream error.
    pub async fn wait(mut self) -> FilterResult<ExitStatus> {
        drop(self.stdout.take());
        let status = self.child.wait().await?;
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(FilterError::Stream(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            log::warn!("[frames] ffmpeg: {}", stderr.trim());
        }
        Ok(status)
    }

    /// Stop the decoder early.
    pub async fn kill(mut self) -> FilterResult<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_request_raw_jpeg_stream() {
        let decoder = FfmpegDecoder::default();
        let args = decoder.args(Path::new("/videos/in.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-i /videos/in.mp4"));
        assert!(joined.contains("-f image2pipe"));
        assert!(joined.contains("-vcodec mjpeg"));
        assert!(joined.contains("-vsync 0"));
        assert!(joined.contains("-q:v 1"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(!joined.contains("-threads"));
    }

    #[test]
    fn test_threads_flag() {
        let args = FfmpegDecoder::default().with_threads(2).args(Path::new("a.mkv"));
        let pos = args.iter().position(|a| a == "-threads").unwrap();
        assert_eq!(args[pos + 1], "2");
        let args = FfmpegDecoder::default().with_threads(0).args(Path::new("a.mkv"));
        assert!(!args.iter().any(|a| a == "-threads"));
    }

    #[tokio::test]
    async fn test_missing_input_is_stream_error() {
        let err = FfmpegDecoder::default()
            .spawn(Path::new("/definitely/not/here.mp4"))
            .err()
            .unwrap();
        assert!(matches!(err, FilterError::Stream(_)));
    }
}
