//! Persistence boundary
//!
//! The scheduler only talks to `PersistenceGateway`; `DbObservationStore` is
//! the SQLite implementation used by the binaries.

pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::PersistenceError;
use crate::models::{Observation, ObservationKey, TotalsSummary};

pub use sqlite::DbObservationStore;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Every identity key currently in storage
    async fn load_known_keys(&self) -> Result<HashSet<ObservationKey>, PersistenceError>;

    /// Write a non-empty observation batch (all-or-nothing) and then its
    /// summary. Returns the keys that were newly written.
    ///
    /// If the batch commits but the summary does not, the error is
    /// `PersistenceError::SummaryWrite` carrying the committed keys.
    async fn append(
        &self,
        observations: &[Observation],
        summary: &TotalsSummary,
    ) -> Result<HashSet<ObservationKey>, PersistenceError>;

    /// Write a summary on its own (retry path after `SummaryWrite`)
    async fn append_summary(&self, summary: &TotalsSummary) -> Result<(), PersistenceError>;

    /// Release the underlying connection. Later calls fail with `Unavailable`.
    async fn close(&self) -> Result<(), PersistenceError>;
}
