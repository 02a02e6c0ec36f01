use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay io error for {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("replay file too short ({len} bytes, header needs {expected})")]
    TooShort { len: usize, expected: usize },

    #[error("invalid replay magic {0:?} (expected KRC0 or KRC1)")]
    BadMagic([u8; 4]),
}
