//! Option-chain recorder library
//!
//! Polls an option-chain provider during exchange hours, keeps the strikes
//! around the money, and appends new observations to SQLite. Shared by the
//! recorder binary, `chain-query`, and the integration tests.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod schedule;
pub mod scrapers;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, SymbolConfig, SymbolRegistry};
pub use error::{FetchError, PersistenceError, ShapeError};
pub use ingest::{IngestionScheduler, SchedulerState};
pub use schedule::MarketSchedule;
pub use scrapers::{OptionChainClient, SnapshotFetcher};
pub use storage::{DbObservationStore, PersistenceGateway};
