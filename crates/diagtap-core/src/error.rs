//! Core error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised outside the decode path (decoders report outcomes instead)
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Failed to read filter file {path}: {source}")]
    FilterIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse filter file {path}: {message}")]
    FilterParse { path: PathBuf, message: String },

    #[error("Invalid CAN ID '{0}'")]
    InvalidCanId(String),
}
