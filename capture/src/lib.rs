//! Frame capture: asynchronous GPU readback on the emulation thread, flipping and
//! encoding on a dedicated worker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub mod encoder;
pub mod flip;
pub mod pipeline;
pub mod source;

mod errors;
pub use errors::CaptureError;

mod worker;

pub use encoder::{EncoderConfig, EncoderFactory, FfmpegEncoderFactory, RawVideoFactory, VideoCodec, VideoSink};
pub use pipeline::{CaptureMode, CapturePipeline, CaptureSummary};
pub use source::{FrameSource, TransferBuffer};

/// Progress notifications for whoever drives a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// A frame reached the encoder.
    Frame { current: u32, total: u32 },

    /// Capture is done and the audio is being muxed in; there's no frame count.
    Muxing,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Counts frames delivered to the encoder and reports each one.
#[derive(Clone)]
pub(crate) struct FrameCounter {
    frames: Arc<AtomicU32>,
    total: u32,
    progress: Option<ProgressFn>,
}

impl FrameCounter {
    pub(crate) fn new(total: u32, progress: Option<ProgressFn>) -> Self {
        Self {
            frames: Arc::new(AtomicU32::new(0)),
            total,
            progress,
        }
    }

    pub(crate) fn increment(&self) {
        let current = self.frames.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(progress) = &self.progress {
            progress(Progress::Frame {
                current,
                total: self.total,
            });
        }
    }

    pub(crate) fn get(&self) -> u32 {
        self.frames.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FrameCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCounter")
            .field("frames", &self.get())
            .field("total", &self.total)
            .finish()
    }
}

/// Flips one bottom-up frame and hands it to the sink.
pub(crate) fn encode_frame(
    sink: &mut dyn VideoSink,
    raw: &[u8],
    flipped: &mut Vec<u8>,
    width: u32,
    height: u32,
) -> Result<(), CaptureError> {
    let expected = flip::frame_len(width, height);

    if raw.len() < expected {
        return Err(CaptureError::FrameSize {
            expected,
            actual: raw.len(),
        });
    }

    flip::flip_vertical(raw, flipped, width, height);
    sink.write_frame(flipped)
}
