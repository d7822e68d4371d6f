//! Frame stream splitter
//!
//! ffmpeg's `image2pipe` output is a bare concatenation of JPEG images with no
//! framing. Frames are cut at the JPEG End-Of-Image marker (`FF D9`): as soon
//! as the last two bytes of the current buffer are the marker, the buffer is
//! handed to the callback and a new frame starts. Whatever is left when the
//! stream closes is delivered once more as a final, possibly empty or
//! truncated, frame.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::{FilterError, FilterResult};

/// JPEG End-Of-Image marker.
pub const EOI_MARKER: [u8; 2] = [0xFF, 0xD9];

const READ_CHUNK_SIZE: usize = 8192;
const INITIAL_FRAME_CAPACITY: usize = 64 * 1024;

/// One complete encoded image, owned by whoever receives it.
pub type FrameBuffer = Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Accumulating,
    Terminal,
}

/// Byte-stream state machine cutting frames at the End-Of-Image marker.
#[derive(Debug)]
pub struct FrameSplitter {
    buffer: BytesMut,
    state: SplitState,
    emitted: u64,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_FRAME_CAPACITY),
            state: SplitState::Accumulating,
            emitted: 0,
        }
    }

    /// Frames emitted so far, including the final one after `finish`.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Bytes of the frame currently being accumulated.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state == SplitState::Terminal
    }

    /// Append a chunk, calling `on_frame` for every frame it completes, in
    /// order. Returns the number of frames emitted by this chunk.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_frame: F) -> usize
    where
        F: FnMut(FrameBuffer),
    {
        if self.state == SplitState::Terminal {
            log::warn!("[frames] Ignoring {} bytes pushed after end of stream", chunk.len());
            return 0;
        }

        let mut emitted = 0;
        let mut start = 0;
        for i in 0..chunk.len() {
            if chunk[i] != EOI_MARKER[1] {
                continue;
            }
            // The byte before this one, within the current frame only
            let previous = if i > start {
                Some(chunk[i - 1])
            } else {
                self.buffer.last().copied()
            };
            if previous == Some(EOI_MARKER[0]) {
                self.buffer.extend_from_slice(&chunk[start..=i]);
                start = i + 1;
                emitted += 1;
                self.emit(&mut on_frame);
            }
        }
        self.buffer.extend_from_slice(&chunk[start..]);
        emitted
    }

    /// End of stream: emit the remaining bytes as the final frame, even if empty.
    pub fn finish<F>(&mut self, mut on_frame: F)
    where
        F: FnMut(FrameBuffer),
    {
        if self.state == SplitState::Terminal {
            return;
        }
        self.emit(&mut on_frame);
        self.state = SplitState::Terminal;
    }

    fn emit<F>(&mut self, on_frame: &mut F)
    where
        F: FnMut(FrameBuffer),
    {
        let frame = self.buffer.split().freeze();
        self.emitted += 1;
        on_frame(frame);
    }
}

/// How a split run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSummary {
    /// Frames delivered, including the trailing one.
    pub frames: u64,
    /// Bytes read from the stream.
    pub bytes: u64,
    /// Whether the trailing frame ended with the marker.
    pub trailing_complete: bool,
}

/// Pull side of the splitter: reads chunks from `reader` and feeds them through
/// a [`FrameSplitter`].
pub struct FrameReader<R> {
    reader: R,
    splitter: FrameSplitter,
    chunk: Vec<u8>,
    bytes: u64,
    trailing_complete: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: FrameSplitter::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
            bytes: 0,
            trailing_complete: false,
        }
    }

    /// Read one chunk and deliver the frames it completes. At end of stream
    /// the trailing frame is delivered and `false` is returned.
    ///
    /// A read error returns [`FilterError::Stream`] without delivering the
    /// partial trailing frame. Cancellation returns [`FilterError::Cancelled`];
    /// no callback fires once it is observed.
    pub async fn read_into<F>(&mut self, cancel: &CancellationToken, mut on_frame: F) -> FilterResult<bool>
    where
        F: FnMut(FrameBuffer),
    {
        if self.splitter.is_finished() {
            return Ok(false);
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("[frames] Cancelled after {} frames", self.splitter.emitted());
                return Err(FilterError::Cancelled);
            }
            read = self.reader.read(&mut self.chunk) => read,
        };

        match read {
            Ok(0) => {
                let trailing_complete = &mut self.trailing_complete;
                self.splitter.finish(|frame| {
                    *trailing_complete = frame.ends_with(&EOI_MARKER);
                    on_frame(frame);
                });
                Ok(false)
            }
            Ok(n) => {
                self.bytes += n as u64;
                self.splitter.push(&self.chunk[..n], |frame| {
                    if !cancel.is_cancelled() {
                        on_frame(frame);
                    }
                });
                if cancel.is_cancelled() {
                    return Err(FilterError::Cancelled);
                }
                Ok(true)
            }
            Err(e) => {
                log::warn!(
                    "[frames] Stream failed after {} frames, dropping {} buffered bytes: {}",
                    self.splitter.emitted(),
                    self.splitter.pending(),
                    e
                );
                Err(FilterError::Stream(e.to_string()))
            }
        }
    }

    pub fn summary(&self) -> SplitSummary {
        SplitSummary {
            frames: self.splitter.emitted(),
            bytes: self.bytes,
            trailing_complete: self.trailing_complete,
        }
    }
}

/// Read `reader` to the end, delivering each frame to `on_frame` as it completes.
///
/// A clean end of stream delivers the trailing frame and returns a summary;
/// stream errors and cancellation end the run as described on
/// [`FrameReader::read_into`].
pub async fn split_frames<R, F>(
    reader: R,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> FilterResult<SplitSummary>
where
    R: AsyncRead + Unpin,
    F: FnMut(FrameBuffer),
{
    let mut frames = FrameReader::new(reader);
    while frames.read_into(cancel, &mut on_frame).await? {}
    Ok(frames.summary())
}
