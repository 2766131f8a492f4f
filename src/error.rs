//! Error taxonomy for the ingestion and signal pipeline.
//!
//! Upstream failures split into three families: credential problems
//! (`Auth`, never retried), transient transport/server trouble
//! (`TransientFetch`, retried up to the ceiling before surfacing), and
//! malformed requests (`InvalidRequest`, retrying cannot help). Ledger
//! contract violations surface as `DuplicateKey`/`NotFound` and are never
//! swallowed. `InsufficientData` is an expected analysis outcome that
//! callers record rather than propagate.

use crate::types::Platform;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkinflowError>;

#[derive(Error, Debug)]
pub enum SkinflowError {
    /// Upstream rejected the credentials (401/403). Halts the call chain
    /// immediately; retrying with the same token cannot succeed.
    #[error("upstream rejected credentials (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Network failure, 5xx, or 429 that survived the whole retry ceiling.
    #[error("transient fetch failure for {endpoint} after {attempts} attempts: {message}")]
    TransientFetch {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// A request the upstream (or a local contract) cannot ever accept:
    /// HTTP 422, other non-auth 4xx, or a business-code rejection carried
    /// inside a 200 envelope.
    #[error("invalid request to {endpoint}: {detail}")]
    InvalidRequest { endpoint: String, detail: String },

    /// Not enough stored history to score an item. Recorded under
    /// `insufficient_series`, not an error path.
    #[error("insufficient series for item {item_id} on {platform}: have {hours}h, need {minimum}h")]
    InsufficientData {
        item_id: i64,
        platform: Platform,
        hours: usize,
        minimum: usize,
    },

    /// A position that violates the book's invariants before it is even
    /// keyed (zero quantity, non-positive buy price).
    #[error("invalid position: {detail}")]
    InvalidPosition { detail: String },

    /// An identical open position (item, platform, buy_time) already exists.
    #[error("position already open for item {item_id} on {platform} bought at {buy_time}")]
    DuplicateKey {
        item_id: i64,
        platform: Platform,
        buy_time: i64,
    },

    /// No open position under the given key.
    #[error("no open position for item {item_id} on {platform} bought at {buy_time}")]
    NotFound {
        item_id: i64,
        platform: Platform,
        buy_time: i64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SkinflowError {
    /// True for failures worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, SkinflowError::TransientFetch { .. } | SkinflowError::Http(_))
    }
}
