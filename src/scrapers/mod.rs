pub mod option_chain; // NiftyTrader option-chain REST client

use async_trait::async_trait;

use crate::config::SymbolConfig;
use crate::models::RawSnapshot;

pub use option_chain::OptionChainClient;

/// Fetch boundary: one latest snapshot per call.
///
/// Expected failures are logged by the implementation and come back as
/// `None`, meaning "no data for this symbol this cycle".
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, symbol: &SymbolConfig) -> Option<RawSnapshot>;
}
