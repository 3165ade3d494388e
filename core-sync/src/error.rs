use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Dataset(#[from] core_dataset::DatasetError),

    #[error("Transport error: {0}")]
    Transport(#[from] provider_webdav::TransportError),

    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid move request: {0}")]
    InvalidMove(String),

    #[error("Operation state file {path} cannot be used: {message}")]
    State { path: PathBuf, message: String },

    #[error("Download failed after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
