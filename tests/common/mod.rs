//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use optchain_recorder::{
    models::{Observation, ObservationKey, RawSnapshot, TotalsSummary},
    Clock, ManualClock, PersistenceError, PersistenceGateway, SnapshotFetcher, SymbolConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// IST wall time on the given June 2024 day (5th is a Wednesday)
pub fn ist(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2024, 6, day, h, m, s)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn strike_record(strike: i64, time: &str) -> Value {
    let mut rec = json!({
        "strike_price": strike,
        "expiry_date": "2024-06-27",
        "pcr": 1.05,
        "symbol_name": "NIFTY",
        "index_close": 23_264.85,
        "time": time,
        "calls_builtup": "SB",
        "puts_builtup": null,
    });
    let obj = rec.as_object_mut().unwrap();
    for side in ["calls", "puts"] {
        for field in [
            "oi", "change_oi", "volume", "iv", "ltp", "net_change", "bid_price", "ask_price",
            "open", "high", "low", "oi_value", "change_oi_value", "average_price", "intrisic",
            "time_value",
        ] {
            obj.insert(format!("{}_{}", side, field), json!(12.5));
        }
    }
    for side in ["call", "put"] {
        for greek in ["delta", "gamma", "theta", "vega", "rho"] {
            obj.insert(format!("{}_{}", side, greek), json!(0.25));
        }
    }
    rec
}

pub fn totals() -> Value {
    let bucket = |prefix: &str| {
        json!({
            format!("{}_oi", prefix): 100,
            format!("{}_change_oi", prefix): 5,
            format!("{}_volume", prefix): 900,
        })
    };
    json!({
        "itm_total_calls": bucket("itm_total_calls"),
        "itm_total_puts": bucket("itm_total_puts"),
        "otm_total_calls": bucket("otm_total_calls"),
        "otm_total_puts": bucket("otm_total_puts"),
        "total_calls_puts": {
            "total_calls_oi": 400,
            "total_calls_change_oi": 20,
            "total_calls_volume": 3600,
            "total_puts_oi": 380,
            "total_puts_change_oi": -4,
            "total_puts_volume": 3000,
        },
    })
}

pub fn snapshot(strikes: &[i64], time: &str) -> RawSnapshot {
    RawSnapshot {
        records: strikes.iter().map(|s| strike_record(*s, time)).collect(),
        totals: totals(),
    }
}

/// Serves the last snapshot `set` per symbol and counts calls
#[derive(Default)]
pub struct ScriptedFetcher {
    snapshots: Mutex<HashMap<String, RawSnapshot>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn set(&self, symbol: &str, snapshot: RawSnapshot) {
        self.snapshots.lock().insert(symbol.to_string(), snapshot);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for ScriptedFetcher {
    async fn fetch(&self, symbol: &SymbolConfig) -> Option<RawSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.snapshots.lock().get(&symbol.symbol).cloned()
    }
}

/// Labels each snapshot with the clock's date and time so every fetch
/// carries new data, and records when each fetch happened.
pub struct ClockedFetcher {
    pub clock: ManualClock,
    pub fetched_at: Mutex<Vec<DateTime<Utc>>>,
    /// Invoked after every fetch with the fetch instant
    pub on_fetch: Box<dyn Fn(DateTime<Utc>) + Send + Sync>,
}

#[async_trait]
impl SnapshotFetcher for ClockedFetcher {
    async fn fetch(&self, _symbol: &SymbolConfig) -> Option<RawSnapshot> {
        let now = self.clock.now();
        self.fetched_at.lock().push(now);
        (self.on_fetch)(now);

        let label = now
            .with_timezone(&chrono_tz::Asia::Kolkata)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        Some(snapshot(&[23_900, 24_000, 24_100], &label))
    }
}

/// Wraps a real store and fails the next `fail_appends` batch writes
pub struct FlakyStore<S> {
    pub inner: Arc<S>,
    pub fail_appends: AtomicUsize,
    pub append_attempts: AtomicUsize,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_appends: AtomicUsize::new(0),
            append_attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: PersistenceGateway> PersistenceGateway for FlakyStore<S> {
    async fn load_known_keys(&self) -> Result<HashSet<ObservationKey>, PersistenceError> {
        self.inner.load_known_keys().await
    }

    async fn append(
        &self,
        observations: &[Observation],
        summary: &TotalsSummary,
    ) -> Result<HashSet<ObservationKey>, PersistenceError> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PersistenceError::Unavailable("connection lost".into()));
        }
        self.inner.append(observations, summary).await
    }

    async fn append_summary(&self, summary: &TotalsSummary) -> Result<(), PersistenceError> {
        self.inner.append_summary(summary).await
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        self.inner.close().await
    }
}
