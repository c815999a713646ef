use std::io;

use thiserror::Error;

use crate::event::CardState;
use crate::media::MediaKind;

#[derive(Debug, Error)]
pub enum CardScanError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("metadata parse error: {0}")]
    Parse(String),
    #[error("scanner unavailable: {0}")]
    Unavailable(CardState),
    #[error("unknown file: {0}")]
    UnknownFile(String),
    #[error("unknown media kind: {0}")]
    UnknownKind(MediaKind),
    #[error("reconciliation invariant violated: {0}")]
    Invariant(String),
}

impl CardScanError {
    /// True when the storage reported the file as absent, as opposed to a
    /// failure to reach it.
    pub fn is_not_found(&self) -> bool {
        match self {
            CardScanError::NotFound(_) => true,
            CardScanError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T, E = CardScanError> = std::result::Result<T, E>;
