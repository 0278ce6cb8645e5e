//! Option-chain domain types
//!
//! `Observation` is one strike row at one sampled exchange time and the atomic
//! unit of persistence. `TotalsSummary` carries the aggregate ITM/OTM block of
//! the same snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of an observation in storage: `(strike_price, time_label)`.
///
/// The time label is the exchange-reported sample time, not ingestion time.
/// `Decimal` equality and hashing ignore trailing zeros, so `24000` and
/// `24000.00` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationKey {
    pub strike_price: Decimal,
    pub time_label: String,
}

impl ObservationKey {
    pub fn new(strike_price: Decimal, time_label: impl Into<String>) -> Self {
        Self {
            strike_price,
            time_label: time_label.into(),
        }
    }

    /// Canonical text form of the strike used as the storage column value.
    pub fn strike_text(&self) -> String {
        strike_to_text(self.strike_price)
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.strike_text(), self.time_label)
    }
}

pub fn strike_to_text(strike: Decimal) -> String {
    strike.normalize().to_string()
}

/// Option greeks for one side of a strike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
}

/// Call-side or put-side metrics at one strike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideMetrics {
    pub open_interest: f64,
    pub change_in_oi: f64,
    pub volume: f64,
    pub implied_volatility: Option<f64>,
    pub last_price: Option<f64>,
    pub net_change: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub oi_value: Option<f64>,
    pub change_oi_value: Option<f64>,
    pub average_price: Option<f64>,
    pub buildup: Option<String>,
    pub intrinsic: Option<f64>,
    pub time_value: Option<f64>,
    pub greeks: Greeks,
}

/// One strike-price row at one sampled moment. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ingested_at: DateTime<Utc>,
    pub strike_price: Decimal,
    pub expiry: String,
    pub pcr: Option<f64>,
    pub symbol: String,
    pub index_close: Option<f64>,
    pub time_label: String,
    pub calls: SideMetrics,
    pub puts: SideMetrics,
}

impl Observation {
    #[inline]
    pub fn key(&self) -> ObservationKey {
        ObservationKey::new(self.strike_price, self.time_label.clone())
    }
}

/// OI / change-in-OI / volume for one ITM or OTM bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketTotals {
    pub open_interest: f64,
    pub change_in_oi: f64,
    pub volume: f64,
}

/// Combined call and put totals across the chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedTotals {
    pub calls_oi: f64,
    pub calls_change_in_oi: f64,
    pub calls_volume: f64,
    pub puts_oi: f64,
    pub puts_change_in_oi: f64,
    pub puts_volume: f64,
}

/// Aggregate in/out-of-the-money totals for one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalsSummary {
    pub ingested_at: DateTime<Utc>,
    pub symbol: String,
    pub itm_calls: BucketTotals,
    pub itm_puts: BucketTotals,
    pub otm_calls: BucketTotals,
    pub otm_puts: BucketTotals,
    pub total: CombinedTotals,
}

/// Raw option-chain snapshot as returned by the provider.
///
/// Records and totals stay as JSON values until shaping so that a malformed
/// strike surfaces as a shaping error instead of a failed fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(rename = "opDatas")]
    pub records: Vec<Value>,
    #[serde(rename = "opTotals")]
    pub totals: Value,
}

impl RawSnapshot {
    /// Stable string form used for change detection.
    ///
    /// `serde_json::Value` objects keep keys sorted, so two payloads with the
    /// same content produce the same string regardless of field order.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Aggregates for a single strike over a time window (reporting only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeStats {
    pub strike_price: Decimal,
    pub avg_pcr: f64,
    pub max_calls_oi: f64,
    pub max_puts_oi: f64,
    pub avg_calls_volume: f64,
    pub avg_puts_volume: f64,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub count: u64,
}
