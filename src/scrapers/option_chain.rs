//! Option-chain REST client
//!
//! One GET per symbol with a short connect timeout and a longer read timeout.
//! Server-side failures (500/502/503/504) and transport errors are retried a
//! bounded number of times with exponential backoff; everything else fails
//! fast.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::SnapshotFetcher;
use crate::config::{FetchConfig, SymbolConfig};
use crate::error::FetchError;
use crate::models::RawSnapshot;

const MAX_BACKOFF_MS: u64 = 30_000;

/// `{"result": 1, "resultMessage": "Success", "resultData": {...}}`
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    result: i64,
    #[serde(rename = "resultMessage", default)]
    result_message: String,
    #[serde(rename = "resultData", default)]
    result_data: Option<RawSnapshot>,
}

pub struct OptionChainClient {
    client: Client,
    config: FetchConfig,
}

impl OptionChainClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
            )
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    /// Strikes either side of ATM to request; `0` asks for the full chain.
    fn range_hint(&self, symbol: &SymbolConfig) -> usize {
        if self.config.narrow_range {
            symbol.window.div_ceil(2)
        } else {
            0
        }
    }

    fn query(&self, symbol: &SymbolConfig) -> Vec<(&'static str, String)> {
        let hint = self.range_hint(symbol).to_string();
        vec![
            ("symbol", symbol.symbol.clone()),
            ("exchange", self.config.exchange.clone()),
            ("expiryDate", symbol.expiry.clone()),
            ("atmBelow", hint.clone()),
            ("atmAbove", hint),
        ]
    }

    /// Fetch one snapshot, surfacing the failure kind
    pub async fn try_fetch(&self, symbol: &SymbolConfig) -> Result<RawSnapshot, FetchError> {
        let body = self.execute_with_retry(symbol).await?;

        let envelope: ApiEnvelope =
            serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if envelope.result != 1 || envelope.result_message != "Success" {
            return Err(FetchError::Rejected {
                result: envelope.result,
                message: envelope.result_message,
            });
        }

        envelope
            .result_data
            .ok_or_else(|| FetchError::Malformed("resultData missing".into()))
    }

    async fn execute_with_retry(&self, symbol: &SymbolConfig) -> Result<String, FetchError> {
        let params = self.query(symbol);
        let attempts = self.config.max_retries + 1;
        let mut backoff = self.config.backoff_ms;
        let mut last_err = FetchError::Transport("no attempt made".into());

        for attempt in 0..attempts {
            let request = self.client.get(&self.config.base_url).query(&params);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(classify);
                    }
                    if !is_retryable(status) {
                        return Err(FetchError::Status(status.as_u16()));
                    }
                    warn!(
                        symbol = %symbol.symbol,
                        status = status.as_u16(),
                        "Provider error on attempt {}",
                        attempt + 1
                    );
                    last_err = FetchError::Status(status.as_u16());
                }
                Err(e) => {
                    warn!(symbol = %symbol.symbol, "Request failed (attempt {}): {}", attempt + 1, e);
                    last_err = classify(e);
                }
            }

            if attempt + 1 < attempts {
                debug!("Retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(last_err)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait]
impl SnapshotFetcher for OptionChainClient {
    async fn fetch(&self, symbol: &SymbolConfig) -> Option<RawSnapshot> {
        let start = Instant::now();
        match self.try_fetch(symbol).await {
            Ok(snapshot) => {
                debug!(
                    symbol = %symbol.symbol,
                    strikes = snapshot.records.len(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Fetched option chain"
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!(symbol = %symbol.symbol, "⚠️ Option chain fetch failed: {}", e);
                None
            }
        }
    }
}
