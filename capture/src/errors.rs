use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to start encoder {program:?}: {source}")]
    EncoderSpawn { program: PathBuf, source: std::io::Error },

    #[error("Encoder did not expose an input stream")]
    EncoderStdinUnavailable,

    #[error("Failed to write a frame to the encoder: {0}")]
    EncoderWrite(std::io::Error),

    #[error("Encoder exited unsuccessfully ({0})")]
    EncoderExit(ExitStatus),

    #[error("Failed to wait on the encoder: {0}")]
    EncoderWait(std::io::Error),

    #[error("Unable to open raw video output {path:?}: {source}")]
    RawOutput { path: PathBuf, source: std::io::Error },

    #[error("Failed to spawn the encode worker thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("The encode worker thread panicked")]
    WorkerPanicked,

    #[error("Asynchronous pixel readback is not available")]
    ReadbackUnavailable,

    #[error("Pixel readback failed: {0}")]
    Readback(String),

    #[error("Frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}
