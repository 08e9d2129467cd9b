//! Error types for progvis-core

use thiserror::Error;

use crate::types::SessionState;

/// Main error type for the progvis-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request body could not be encoded
    #[error("encode error: {0}")]
    Encode(String),

    /// HTTP/network error talking to the collector
    #[error("HTTP error: {0}")]
    Http(String),

    /// Mutation attempted after the session reached a terminal state
    #[error("progress \"{name}\" is already in \"{state}\" state")]
    Terminal { name: String, state: SessionState },

    /// Step deltas must be strictly positive
    #[error("step delta must be positive, got {0}")]
    InvalidDelta(i64),

    /// Step would push the running total past `i64::MAX`
    #[error("step delta {delta} overflows current total {total}")]
    TotalOverflow { total: i64, delta: i64 },
}

/// Result type alias for progvis-core
pub type Result<T> = std::result::Result<T, Error>;
