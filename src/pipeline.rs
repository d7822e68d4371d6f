//! Frame pipeline: split -> decode -> ensemble, one outcome per frame.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::ensemble::{Ensemble, EnsembleResult};
use crate::error::{FilterError, FilterResult};
use crate::splitter::{FrameBuffer, FrameReader, split_frames};

/// Result for one frame. `result` is an error when the frame could not be
/// scored; the run carries on with the next frame.
#[derive(Debug)]
pub struct FrameOutcome {
    /// Position in the stream, starting at 0.
    pub index: u64,
    pub frame: FrameBuffer,
    pub result: FilterResult<EnsembleResult>,
}

impl FrameOutcome {
    pub fn probability(&self) -> Option<f32> {
        self.result.as_ref().ok().map(|r| r.probability)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Frames delivered to the caller.
    pub frames: u64,
    pub scored: u64,
    pub failed: u64,
}

impl PipelineSummary {
    fn record(&mut self, outcome: &FrameOutcome) {
        self.frames += 1;
        if outcome.result.is_ok() {
            self.scored += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Scores decoded frames with a shared ensemble.
#[derive(Debug, Clone)]
pub struct Pipeline {
    ensemble: Arc<Ensemble>,
}

impl Pipeline {
    pub fn new(ensemble: Ensemble) -> Self {
        Self {
            ensemble: Arc::new(ensemble),
        }
    }

    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }

    /// Decode one encoded frame and score it. Failures stay inside the outcome.
    pub fn score_frame(&self, index: u64, frame: FrameBuffer) -> FrameOutcome {
        let result = self.score_bytes(&frame);
        if let Err(e) = &result {
            log::warn!("[nsfw] Frame {} not scored: {}", index, e);
        }
        FrameOutcome {
            index,
            frame,
            result,
        }
    }

    fn score_bytes(&self, frame: &[u8]) -> FilterResult<EnsembleResult> {
        if frame.is_empty() {
            return Err(FilterError::InvalidImage("empty frame".into()));
        }
        let image = image::load_from_memory(frame)
            .map_err(|e| FilterError::InvalidImage(format!("{} bytes undecodable: {}", frame.len(), e)))?;
        self.ensemble.score(&image)
    }

    /// Score frames one at a time, inside the splitter's callback.
    ///
    /// The empty buffer left at a clean end of stream is not a frame and is
    /// skipped; a non-empty truncated tail is scored like any other frame.
    pub async fn run<R, F>(
        &self,
        reader: R,
        cancel: &CancellationToken,
        mut on_outcome: F,
    ) -> FilterResult<PipelineSummary>
    where
        R: AsyncRead + Unpin,
        F: FnMut(FrameOutcome),
    {
        let mut summary = PipelineSummary::default();
        let mut index = 0u64;

        let split = split_frames(reader, cancel, |frame| {
            if frame.is_empty() {
                return;
            }
            let outcome = self.score_frame(index, frame);
            index += 1;
            summary.record(&outcome);
            on_outcome(outcome);
        })
        .await?;

        log::info!(
            "[frames] Stream complete: {} frames ({} scored, {} failed), {} bytes",
            summary.frames,
            summary.scored,
            summary.failed,
            split.bytes
        );
        Ok(summary)
    }

    /// Score up to `workers` frames in parallel on the blocking pool while
    /// still delivering outcomes in frame order. `workers <= 1` is [`run`](Self::run).
    ///
    /// A stream error still delivers every frame split off before it, then
    /// returns the error. Cancellation stops delivery at once.
    pub async fn run_concurrent<R, F>(
        &self,
        reader: R,
        cancel: &CancellationToken,
        workers: usize,
        mut on_outcome: F,
    ) -> FilterResult<PipelineSummary>
    where
        R: AsyncRead + Unpin,
        F: FnMut(FrameOutcome),
    {
        if workers <= 1 {
            return self.run(reader, cancel, on_outcome).await;
        }

        let mut frames = FrameReader::new(reader);
        let mut in_flight = InFlight::default();
        let mut summary = PipelineSummary::default();
        let mut next_index = 0u64;

        let ended = loop {
            let mut ready = Vec::new();
            let read = frames.read_into(cancel, |frame| ready.push(frame)).await;

            for frame in ready.into_iter().filter(|f| !f.is_empty()) {
                while in_flight.len() >= workers {
                    in_flight.join_one(cancel, &mut summary, &mut on_outcome).await?;
                }
                if cancel.is_cancelled() {
                    in_flight.abort_all();
                    return Err(FilterError::Cancelled);
                }
                in_flight.spawn(self.clone(), next_index, frame);
                next_index += 1;
            }

            match read {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(FilterError::Cancelled) => {
                    in_flight.abort_all();
                    return Err(FilterError::Cancelled);
                }
                Err(e) => break Err(e),
            }
        };

        while in_flight.join_one(cancel, &mut summary, &mut on_outcome).await? {}
        if cancel.is_cancelled() {
            return Err(FilterError::Cancelled);
        }
        ended?;

        log::info!(
            "[frames] Stream complete: {} frames ({} scored, {} failed) on {} workers",
            summary.frames,
            summary.scored,
            summary.failed,
            workers
        );
        Ok(summary)
    }
}

/// Frames being scored on the blocking pool.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<FrameOutcome>,
    frames: HashMap<task::Id, (u64, FrameBuffer)>,
    reorder: ReorderBuffer,
}

impl InFlight {
    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    fn spawn(&mut self, pipeline: Pipeline, index: u64, frame: FrameBuffer) {
        let task_frame = frame.clone();
        let handle = self
            .tasks
            .spawn_blocking(move || pipeline.score_frame(index, task_frame));
        self.frames.insert(handle.id(), (index, frame));
    }

    /// Wait for one task and deliver whatever is now in order. A worker that
    /// panicked becomes a failed outcome for its frame. Returns `false` once
    /// no task is left.
    async fn join_one<F>(
        &mut self,
        cancel: &CancellationToken,
        summary: &mut PipelineSummary,
        on_outcome: &mut F,
    ) -> FilterResult<bool>
    where
        F: FnMut(FrameOutcome),
    {
        let outcome = match self.tasks.join_next_with_id().await {
            None => return Ok(false),
            Some(Ok((id, outcome))) => {
                self.frames.remove(&id);
                outcome
            }
            Some(Err(e)) => {
                let Some((index, frame)) = self.frames.remove(&e.id()) else {
                    return Err(e.into());
                };
                log::warn!("[nsfw] Frame {} worker failed: {}", index, e);
                FrameOutcome {
                    index,
                    frame,
                    result: Err(FilterError::Join(e)),
                }
            }
        };

        self.reorder.insert(outcome);
        while !cancel.is_cancelled() {
            let Some(ready) = self.reorder.pop_next() else {
                break;
            };
            summary.record(&ready);
            on_outcome(ready);
        }
        Ok(true)
    }
}

/// Holds finished outcomes until every earlier frame has been delivered.
#[derive(Default)]
struct ReorderBuffer {
    next: u64,
    pending: BTreeMap<u64, FrameOutcome>,
}

impl ReorderBuffer {
    fn insert(&mut self, outcome: FrameOutcome) {
        self.pending.insert(outcome.index, outcome);
    }

    fn pop_next(&mut self) -> Option<FrameOutcome> {
        let outcome = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(outcome)
    }
}

/// Decode `input` with ffmpeg and score every frame.
///
/// The decoder is killed if the scan is cancelled or fails; a decoder that
/// exits non-zero after a clean stream is reported as a stream error.
pub async fn scan_video<F>(
    input: &Path,
    config: &ScanConfig,
    pipeline: &Pipeline,
    cancel: &CancellationToken,
    on_outcome: F,
) -> FilterResult<PipelineSummary>
where
    F: FnMut(FrameOutcome),
{
    let mut process = config.decoder().spawn(input)?;
    let stdout = process.take_stdout()?;

    match pipeline
        .run_concurrent(stdout, cancel, config.workers, on_outcome)
        .await
    {
        Ok(summary) => {
            process.wait().await?;
            Ok(summary)
        }
        Err(e) => {
            if let Err(kill_err) = process.kill().await {
                log::warn!("[frames] Failed to stop decoder: {}", kill_err);
            }
            Err(e)
        }
    }
}
