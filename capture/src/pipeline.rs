//! Turns "frame rendered" notifications into encoded frames.
//!
//! Two GPU transfer buffers alternate: each frame requests a readback into one slot
//! after collecting the other slot's readback from the previous frame, which has had a
//! whole frame to complete. Collected frames go to the encode worker. When the GPU
//! can't do asynchronous readback, frames are read, flipped and written inline.

use mupen_integrations::Log;

use crate::encoder::{EncoderConfig, EncoderFactory, VideoSink};
use crate::flip::frame_len;
use crate::source::{FrameSource, TransferBuffer};
use crate::worker::EncodeWorker;
use crate::{CaptureError, FrameCounter, ProgressFn, encode_frame};

/// How frames are being read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Nothing captured yet; the mode is picked on the first frame.
    Unbound,

    /// Double-buffered GPU readback with a background encode worker.
    Async,

    /// Fallback: blocking readback and encoding on the emulation thread.
    Synchronous,
}

/// What a finished capture produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CaptureSummary {
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    pub mode: CaptureMode,

    /// Frames dropped because the render size changed mid-session.
    pub skipped: u32,
}

#[derive(Debug)]
struct CaptureSlot {
    buffer: TransferBuffer,
    pending: bool,
}

#[derive(Debug)]
enum Readback {
    Async {
        slots: [CaptureSlot; 2],
        write_index: usize,
        worker: EncodeWorker,
    },

    Synchronous {
        sink: Box<dyn VideoSink>,
        raw: Vec<u8>,
        flipped: Vec<u8>,
    },
}

#[derive(Debug)]
struct Bound {
    width: u32,
    height: u32,
    readback: Readback,
}

pub struct CapturePipeline {
    source: Box<dyn FrameSource>,
    factory: Box<dyn EncoderFactory>,
    encoder: EncoderConfig,
    counter: FrameCounter,
    bound: Option<Bound>,
    mode: CaptureMode,
    skipped: u32,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("encoder", &self.encoder)
            .field("counter", &self.counter)
            .field("bound", &self.bound)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CapturePipeline {
    /// `encoder` carries the requested size; the encoder is actually opened at
    /// whatever size the first frame turns out to be.
    pub fn new(
        source: Box<dyn FrameSource>,
        factory: Box<dyn EncoderFactory>,
        encoder: EncoderConfig,
        total_frames: u32,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            source,
            factory,
            encoder,
            counter: FrameCounter::new(total_frames, progress),
            bound: None,
            mode: CaptureMode::Unbound,
            skipped: 0,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Frames written to the encoder so far.
    pub fn frames_captured(&self) -> u32 {
        self.counter.get()
    }

    /// Captures the frame that was just rendered.
    pub fn capture_frame(&mut self) -> Result<(), CaptureError> {
        let Some((width, height)) = self.source.frame_size().filter(|(w, h)| *w > 0 && *h > 0) else {
            tracing::warn!(target: Log::Capture, "No frame available to capture, skipping");
            return Ok(());
        };

        if self.bound.is_none() {
            self.bound = Some(self.bind(width, height)?);
        }

        let Self { source, bound, skipped, counter, .. } = self;
        let Some(bound) = bound.as_mut() else {
            return Ok(());
        };

        if (width, height) != (bound.width, bound.height) {
            *skipped += 1;

            tracing::warn!(
                target: Log::Capture,
                width,
                height,
                bound_width = bound.width,
                bound_height = bound.height,
                "Render size changed mid-session, skipping frame"
            );

            return Ok(());
        }

        match &mut bound.readback {
            Readback::Async {
                slots,
                write_index,
                worker,
            } => {
                let read_index = 1 - *write_index;

                let slot = &mut slots[read_index];
                if slot.pending {
                    slot.pending = false;
                    let buffer = slot.buffer;
                    worker.submit(width, height, |staging| source.retrieve_readback(buffer, staging))?;
                }

                let slot = &mut slots[*write_index];
                source.request_readback(slot.buffer, width, height)?;
                slot.pending = true;

                *write_index = read_index;
            },

            Readback::Synchronous { sink, raw, flipped } => {
                raw.resize(frame_len(width, height), 0);
                source.read_pixels(raw, width, height)?;
                encode_frame(sink.as_mut(), raw, flipped, width, height)?;
                counter.increment();
            },
        }

        Ok(())
    }

    fn bind(&mut self, width: u32, height: u32) -> Result<Bound, CaptureError> {
        if (width, height) != (self.encoder.width, self.encoder.height) {
            tracing::warn!(
                target: Log::Capture,
                requested_width = self.encoder.width,
                requested_height = self.encoder.height,
                width,
                height,
                "Render size differs from the requested size, encoding at the render size"
            );
        }

        self.encoder.width = width;
        self.encoder.height = height;

        let sink = self.factory.open(&self.encoder)?;

        let readback = match self.create_slots(frame_len(width, height)) {
            Ok(slots) => {
                let worker = match EncodeWorker::spawn(sink, self.counter.clone()) {
                    Ok(worker) => worker,

                    Err(error) => {
                        for slot in slots {
                            self.source.release_transfer_buffer(slot.buffer);
                        }

                        return Err(error);
                    },
                };

                tracing::info!(target: Log::Capture, width, height, "Capturing with asynchronous readback");

                Readback::Async {
                    slots,
                    write_index: 0,
                    worker,
                }
            },

            Err(error) => {
                tracing::warn!(
                    target: Log::Capture,
                    ?error,
                    width,
                    height,
                    "Asynchronous readback unavailable, falling back to synchronous capture"
                );

                Readback::Synchronous {
                    sink,
                    raw: Vec::new(),
                    flipped: Vec::new(),
                }
            },
        };

        self.mode = match readback {
            Readback::Async { .. } => CaptureMode::Async,
            Readback::Synchronous { .. } => CaptureMode::Synchronous,
        };

        Ok(Bound { width, height, readback })
    }

    fn create_slots(&mut self, size: usize) -> Result<[CaptureSlot; 2], CaptureError> {
        if !self.source.supports_async_readback() {
            return Err(CaptureError::ReadbackUnavailable);
        }

        let first = self.source.create_transfer_buffer(size)?;

        let second = match self.source.create_transfer_buffer(size) {
            Ok(buffer) => buffer,

            Err(error) => {
                self.source.release_transfer_buffer(first);
                return Err(error);
            },
        };

        Ok([
            CaptureSlot {
                buffer: first,
                pending: false,
            },
            CaptureSlot {
                buffer: second,
                pending: false,
            },
        ])
    }

    /// Drains any frame still on the GPU, waits for the encoder to catch up, stops the
    /// worker, releases GPU buffers and closes the encoder, in that order.
    ///
    /// Safe to call more than once; later calls just report the totals.
    pub fn finish(&mut self) -> Result<CaptureSummary, CaptureError> {
        let Some(bound) = self.bound.take() else {
            return Ok(self.summary(self.encoder.width, self.encoder.height));
        };

        let (width, height) = (bound.width, bound.height);

        let result = match bound.readback {
            Readback::Async {
                slots,
                write_index,
                worker,
            } => {
                let pending = &slots[1 - write_index];

                let drained = if pending.pending {
                    let buffer = pending.buffer;
                    let source = &mut self.source;
                    worker.submit(width, height, |staging| source.retrieve_readback(buffer, staging))
                } else {
                    Ok(())
                };

                let finished = worker.finish();

                for slot in slots {
                    self.source.release_transfer_buffer(slot.buffer);
                }

                let closed = finished.and_then(|sink| sink.finish());
                drained.and(closed)
            },

            Readback::Synchronous { sink, .. } => sink.finish(),
        };

        let summary = self.summary(width, height);

        match result {
            Ok(()) => {
                tracing::info!(
                    target: Log::Capture,
                    frames = summary.frames,
                    skipped = summary.skipped,
                    mode = ?summary.mode,
                    "Capture finished"
                );

                Ok(summary)
            },

            Err(error) => {
                tracing::error!(target: Log::Capture, ?error, "Capture did not finish cleanly");
                Err(error)
            },
        }
    }

    fn summary(&self, width: u32, height: u32) -> CaptureSummary {
        CaptureSummary {
            frames: self.counter.get(),
            width,
            height,
            mode: self.mode,
            skipped: self.skipped,
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.bound.is_some() {
            if let Err(error) = self.finish() {
                tracing::error!(target: Log::Capture, ?error, "Failed to finish capture on drop");
            }
        }
    }
}
