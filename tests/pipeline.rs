use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use cleo_nsfw::backend::StaticBackend;
use cleo_nsfw::classifier::{GANTMAN_LABELS, GANTMAN_UNSAFE, TensorLayout};
use cleo_nsfw::preprocess::{Normalization, ResizeMode};
use cleo_nsfw::{
    Classifier, ClassifierConfig, Ensemble, FilterError, FrameOutcome, Interpretation, Pipeline,
};
use image::{ImageFormat, Rgb, RgbImage};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

fn jpeg(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(24, 16, |x, y| Rgb([seed, (x * 10) as u8, (y * 10) as u8]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    let data = out.into_inner();
    // the stream is split on FF D9, so it must only appear as the trailer
    let markers = data.windows(2).filter(|w| w == &[0xFF, 0xD9]).count();
    assert_eq!(markers, 1);
    data
}

fn video_stream(frames: usize) -> Vec<u8> {
    (0..frames).flat_map(|i| jpeg(i as u8 * 20)).collect()
}

/// Hands out at most `step` bytes per read, then EOF or an error.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
    fail_at_end: bool,
}

impl Trickle {
    fn new(data: Vec<u8>, step: usize) -> Self {
        Self {
            data,
            pos: 0,
            step,
            fail_at_end: false,
        }
    }
}

impl AsyncRead for Trickle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            if self.fail_at_end {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed")));
            }
            return Poll::Ready(Ok(()));
        }
        let end = (self.pos + self.step).min(self.data.len()).min(self.pos + buf.remaining());
        let pos = self.pos;
        buf.put_slice(&self.data[pos..end]);
        self.pos = end;
        Poll::Ready(Ok(()))
    }
}

fn classifier(name: &str, interpretation: Interpretation, output: Vec<f32>) -> Classifier {
    let config = ClassifierConfig {
        name: name.into(),
        input_name: "input".into(),
        output_name: "output".into(),
        width: 32,
        height: 32,
        resize: ResizeMode::Stretch,
        normalization: Normalization::UnitRange,
        layout: TensorLayout::Nhwc,
        interpretation,
    };
    Classifier::new(config, Arc::new(StaticBackend::vector(output))).unwrap()
}

fn scalar(name: &str, p: f32) -> Classifier {
    classifier(name, Interpretation::SingleScalar { index: 0 }, vec![p])
}

fn pipeline(members: Vec<(Classifier, f32)>) -> Pipeline {
    Pipeline::new(Ensemble::new(members).unwrap())
}

async fn collect(p: &Pipeline, reader: Trickle, workers: usize) -> (Vec<FrameOutcome>, cleo_nsfw::PipelineSummary) {
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::new();
    let summary = p
        .run_concurrent(reader, &cancel, workers, |o| outcomes.push(o))
        .await
        .unwrap();
    (outcomes, summary)
}

#[tokio::test]
async fn test_every_frame_scored_in_order() {
    let p = pipeline(vec![(scalar("a", 0.9), 0.5), (scalar("b", 0.9), 0.5)]);
    let (outcomes, summary) = collect(&p, Trickle::new(video_stream(5), 8192), 1).await;

    assert_eq!(summary.frames, 5);
    assert_eq!(summary.scored, 5);
    assert_eq!(summary.failed, 0);
    let indices: Vec<u64> = outcomes.iter().map(|o| o.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    for outcome in &outcomes {
        assert_eq!(outcome.probability(), Some(0.9));
        assert!(outcome.frame.ends_with(&[0xFF, 0xD9]));
    }
}

#[tokio::test]
async fn test_tiny_reads_give_same_frames() {
    let p = pipeline(vec![(scalar("a", 0.3), 1.0)]);
    let (whole, _) = collect(&p, Trickle::new(video_stream(3), 1 << 20), 1).await;
    let (trickled, _) = collect(&p, Trickle::new(video_stream(3), 3), 1).await;
    let frames = |outcomes: &[FrameOutcome]| outcomes.iter().map(|o| o.frame.clone()).collect::<Vec<_>>();
    assert_eq!(frames(&whole), frames(&trickled));
    assert_eq!(whole.len(), 3);
}

#[tokio::test]
async fn test_concurrent_run_keeps_order() {
    let p = pipeline(vec![(scalar("a", 0.1), 0.5), (scalar("b", 0.9), 0.5)]);
    let (outcomes, summary) = collect(&p, Trickle::new(video_stream(9), 500), 4).await;

    assert_eq!(summary.frames, 9);
    let indices: Vec<u64> = outcomes.iter().map(|o| o.index).collect();
    assert_eq!(indices, (0..9).collect::<Vec<_>>());
    // 10 and 90 disagree: mean 50, small consensus bonus
    for outcome in &outcomes {
        assert_eq!(outcome.probability(), Some(0.5));
    }
}

#[tokio::test]
async fn test_corrupt_frame_does_not_stop_stream() {
    let mut data = jpeg(1);
    data.extend_from_slice(b"\xFF\xD8garbage\xFF\xD9");
    data.extend(jpeg(2));
    let p = pipeline(vec![(scalar("a", 0.6), 1.0)]);
    let (outcomes, summary) = collect(&p, Trickle::new(data, 64), 2).await;

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(outcomes[0].probability(), Some(0.6));
    assert!(matches!(outcomes[1].result, Err(FilterError::InvalidImage(_))));
    assert_eq!(outcomes[2].probability(), Some(0.6));
}

#[tokio::test]
async fn test_truncated_tail_reported() {
    let mut data = video_stream(2);
    let partial = jpeg(9);
    data.extend_from_slice(&partial[..20]);
    let p = pipeline(vec![(scalar("a", 0.2), 1.0)]);
    let (outcomes, summary) = collect(&p, Trickle::new(data, 4096), 1).await;

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.scored, 2);
    assert!(outcomes[2].result.is_err());
}

#[tokio::test]
async fn test_stream_error_is_not_clean_end() {
    let mut data = video_stream(2);
    data.extend_from_slice(b"\xFF\xD8half a frame");
    let mut reader = Trickle::new(data, 1024);
    reader.fail_at_end = true;

    let p = pipeline(vec![(scalar("a", 0.2), 1.0)]);
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::new();
    let err = p
        .run(reader, &cancel, |o| outcomes.push(o))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Stream(_)));
    assert_eq!(outcomes.len(), 2);
}

#[tokio::test]
async fn test_cancelled_run_stops_callbacks() {
    let p = pipeline(vec![(scalar("a", 0.2), 1.0)]);
    let cancel = CancellationToken::new();
    let mut seen = 0;
    let err = p
        .run(Trickle::new(video_stream(6), 1 << 20), &cancel, |_| {
            seen += 1;
            cancel.cancel();
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Cancelled));
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn test_failed_member_falls_back_to_rest() {
    let gantman = Interpretation::LabelSubsetSum {
        labels: GANTMAN_LABELS.iter().map(|s| s.to_string()).collect(),
        unsafe_indices: GANTMAN_UNSAFE.to_vec(),
    };
    let healthy = classifier("mobilenet_v2", gantman, vec![0.1, 0.1, 0.1, 0.6, 0.1]);
    let config = healthy.config().clone();
    let broken = Classifier::new(
        ClassifierConfig {
            name: "inception_v3".into(),
            ..config
        },
        Arc::new(StaticBackend::unavailable()),
    )
    .unwrap();

    let p = pipeline(vec![(healthy, 0.3), (broken, 0.5)]);
    let (outcomes, _) = collect(&p, Trickle::new(video_stream(1), 8192), 1).await;
    let result = outcomes[0].result.as_ref().unwrap();
    assert_eq!(result.probability, 0.8);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.failures.len(), 1);
}

#[tokio::test]
async fn test_concurrent_stream_error_delivers_complete_frames() {
    let mut data = video_stream(2);
    data.extend_from_slice(b"\xFF\xD8half a frame");
    let mut reader = Trickle::new(data, 1 << 20);
    reader.fail_at_end = true;

    let p = pipeline(vec![(scalar("a", 0.2), 1.0)]);
    let cancel = CancellationToken::new();
    let mut outcomes = Vec::new();
    let err = p
        .run_concurrent(reader, &cancel, 4, |o| outcomes.push(o))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Stream(_)));
    let indices: Vec<u64> = outcomes.iter().map(|o| o.index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(outcomes.iter().all(|o| o.probability() == Some(0.2)));
}

#[tokio::test]
async fn test_concurrent_cancel_stops_callbacks() {
    let p = pipeline(vec![(scalar("a", 0.2), 1.0)]);
    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let err = p
        .run_concurrent(Trickle::new(video_stream(8), 1 << 20), &cancel, 3, |o| {
            seen.push(o.index);
            cancel.cancel();
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Cancelled));
    assert_eq!(seen, vec![0]);
}
