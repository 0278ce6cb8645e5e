//! Error taxonomy of the ingestion core
//!
//! Fetch failures never escape the fetcher (they degrade to "no data this
//! cycle"), shaping failures skip one symbol for one cycle, and persistence
//! failures are handed back to the scheduler so it can decide what to retry.

use crate::models::{ObservationKey, TotalsSummary};
use std::collections::HashSet;

/// Failure to obtain a snapshot from the provider.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Connection refused, DNS failure, reset, ...
    Transport(String),
    /// Connect or read timeout elapsed
    Timeout,
    /// Non-success HTTP status after retries were exhausted
    Status(u16),
    /// Body was not the expected JSON envelope
    Malformed(String),
    /// Envelope parsed but the provider reported a failure
    Rejected { result: i64, message: String },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Timeout => write!(f, "request timed out"),
            Self::Status(code) => write!(f, "provider returned HTTP {}", code),
            Self::Malformed(msg) => write!(f, "malformed payload: {}", msg),
            Self::Rejected { result, message } => {
                write!(f, "provider rejected request (result={}, message={:?})", result, message)
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// Raw snapshot is missing fields the record mapping needs.
#[derive(Debug)]
pub enum ShapeError {
    Record {
        index: usize,
        source: serde_json::Error,
    },
    Totals(serde_json::Error),
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record { index, source } => {
                write!(f, "strike record #{} is malformed: {}", index, source)
            }
            Self::Totals(source) => write!(f, "totals block is malformed: {}", source),
        }
    }
}

impl std::error::Error for ShapeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Record { source, .. } => Some(source),
            Self::Totals(source) => Some(source),
        }
    }
}

/// Storage could not take a write.
#[derive(Debug)]
pub enum PersistenceError {
    /// Store is unreachable or already closed
    Unavailable(String),
    /// The observation batch was rejected; nothing from it is durable
    Rejected(String),
    /// Observations committed but the paired summary did not.
    ///
    /// `committed` holds the keys that are durable despite the error and
    /// `summary` is handed back so the caller can retry just that row.
    SummaryWrite {
        committed: HashSet<ObservationKey>,
        summary: TotalsSummary,
        reason: String,
    },
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
            Self::Rejected(msg) => write!(f, "observation batch rejected: {}", msg),
            Self::SummaryWrite {
                committed, reason, ..
            } => write!(
                f,
                "{} observations committed but summary write failed: {}",
                committed.len(),
                reason
            ),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Rejected(e.to_string())
    }
}
