use std::path::PathBuf;

use thiserror::Error;

use krec_capture::CaptureError;
use krec_config::ConfigError;
use krec_playback::errors::ReplayError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Emulation core failed: {0}")]
    Core(String),

    #[error("Replay {0:?} contains no input frames")]
    NoInputFrames(PathBuf),

    #[error("No frames were captured")]
    NoFramesCaptured,

    #[error("Conversion was cancelled before any frame was captured")]
    Cancelled,

    #[error("Session has already been run")]
    AlreadyRun,

    #[error("Muxing audio into {output:?} failed: {reason}")]
    Mux { output: PathBuf, reason: String },

    #[error("File operation on {path:?} failed: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("Unable to read replay directory {path:?}: {source}")]
    ReadDir { path: PathBuf, source: std::io::Error },
}
