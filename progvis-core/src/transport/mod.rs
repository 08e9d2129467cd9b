//! Progress collector transport
//!
//! A [`Transport`] turns one [`Snapshot`] into one network exchange and
//! reports exactly one [`Exchange`] outcome.
//!
//! ## Wire format
//!
//! ```text
//! POST <server_url>?token=<token>
//! Content-Type: application/json
//! Content-Encoding: gzip
//!
//! gzip({"uuid": .., "name": .., "argv": .., "host": .., "state": ..,
//!       "start": .., "end_ts": .., "expected": .., "curr": ..,
//!       "steps": [{"s","t","p"}], "msgs": [{"s","t","m"}], "client_ms": ..})
//! ```
//!
//! 200 is success, 401 revokes the token, everything else is retryable.

mod http;

use std::io::Write;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::session::Snapshot;

pub use http::HttpTransport;

/// Why a delivery attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// Collector answered 401
    #[error("collector rejected the token (401)")]
    Unauthorized,

    /// Any other non-200 status
    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },

    /// No answer within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Connection, DNS, TLS or body read failure
    #[error("request failed: {0}")]
    Network(String),

    /// Snapshot could not be serialized or compressed
    #[error("encode failed: {0}")]
    Encode(String),
}

impl DeliveryFailure {
    /// 401 is the only failure that is never retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryFailure::Unauthorized)
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Collector acknowledged receipt
    Success { status: u16, body: String },
    Failure(DeliveryFailure),
}

impl Exchange {
    /// Classify a fully read HTTP response
    pub fn from_response(status: u16, body: String) -> Self {
        match status {
            200 => Exchange::Success { status, body },
            401 => Exchange::Failure(DeliveryFailure::Unauthorized),
            _ => Exchange::Failure(DeliveryFailure::Status { status, body }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exchange::Success { .. })
    }
}

/// Delivers session snapshots to a collector
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one snapshot, authenticated with `token`.
    ///
    /// Must read the whole response before returning.
    async fn deliver(&self, snapshot: &Snapshot, token: &str) -> Exchange;
}

/// Serialize a snapshot to JSON and gzip it
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(snapshot)?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| Error::Encode(format!("gzip write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Encode(format!("gzip finish failed: {}", e)))
}
