//! Raw provider records -> `Observation` / `TotalsSummary`
//!
//! Field mapping is total over well-formed input. A missing or ill-typed key
//! is a `ShapeError`, never a zero. Quote fields the provider reports as
//! `null` come through as `None`; open interest and volume may not be null.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::config::SymbolConfig;
use crate::error::ShapeError;
use crate::models::{
    BucketTotals, CombinedTotals, Greeks, Observation, RawSnapshot, SideMetrics, TotalsSummary,
};

/// Observations and totals built from one accepted snapshot
#[derive(Debug, Clone)]
pub struct ShapedSnapshot {
    pub observations: Vec<Observation>,
    pub totals: TotalsSummary,
}

/// Contiguous slice of `size` items centered on the positional middle of
/// `items`. Lists no longer than `size` come back whole.
pub fn middle_window<T>(items: &[T], size: usize) -> &[T] {
    if items.len() <= size {
        return items;
    }
    let start = (items.len() - size) / 2;
    &items[start..start + size]
}

pub fn shape_snapshot(
    raw: &RawSnapshot,
    symbol: &SymbolConfig,
    ingested_at: DateTime<Utc>,
) -> Result<ShapedSnapshot, ShapeError> {
    let observations = middle_window(&raw.records, symbol.window)
        .iter()
        .enumerate()
        .map(|(index, value)| {
            RawStrikeRecord::deserialize(value)
                .map(|rec| rec.into_observation(ingested_at))
                .map_err(|source| ShapeError::Record { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let totals = RawTotals::deserialize(&raw.totals)
        .map_err(ShapeError::Totals)?
        .into_summary(&symbol.symbol, ingested_at);

    Ok(ShapedSnapshot {
        observations,
        totals,
    })
}

/// One element of `opDatas`
#[derive(Debug, Deserialize)]
struct RawStrikeRecord {
    strike_price: Decimal,
    expiry_date: String,
    #[serde(deserialize_with = "nullable")]
    pcr: Option<f64>,
    symbol_name: String,
    #[serde(deserialize_with = "nullable")]
    index_close: Option<f64>,
    time: String,

    calls_oi: f64,
    calls_change_oi: f64,
    calls_volume: f64,
    #[serde(deserialize_with = "nullable")]
    calls_iv: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_ltp: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_net_change: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_bid_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_ask_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_open: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_high: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_low: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_oi_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_change_oi_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_average_price: Option<f64>,
    calls_builtup: Option<String>,
    // provider spelling
    #[serde(deserialize_with = "nullable")]
    calls_intrisic: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    calls_time_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    call_delta: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    call_gamma: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    call_theta: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    call_vega: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    call_rho: Option<f64>,

    puts_oi: f64,
    puts_change_oi: f64,
    puts_volume: f64,
    #[serde(deserialize_with = "nullable")]
    puts_iv: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_ltp: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_net_change: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_bid_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_ask_price: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_open: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_high: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_low: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_oi_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_change_oi_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_average_price: Option<f64>,
    puts_builtup: Option<String>,
    #[serde(deserialize_with = "nullable")]
    puts_intrisic: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    puts_time_value: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    put_delta: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    put_gamma: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    put_theta: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    put_vega: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    put_rho: Option<f64>,
}

impl RawStrikeRecord {
    fn into_observation(self, ingested_at: DateTime<Utc>) -> Observation {
        let calls = SideMetrics {
            open_interest: self.calls_oi,
            change_in_oi: self.calls_change_oi,
            volume: self.calls_volume,
            implied_volatility: self.calls_iv,
            last_price: self.calls_ltp,
            net_change: self.calls_net_change,
            bid_price: self.calls_bid_price,
            ask_price: self.calls_ask_price,
            open: self.calls_open,
            high: self.calls_high,
            low: self.calls_low,
            oi_value: self.calls_oi_value,
            change_oi_value: self.calls_change_oi_value,
            average_price: self.calls_average_price,
            buildup: self.calls_builtup,
            intrinsic: self.calls_intrisic,
            time_value: self.calls_time_value,
            greeks: Greeks {
                delta: self.call_delta,
                gamma: self.call_gamma,
                theta: self.call_theta,
                vega: self.call_vega,
                rho: self.call_rho,
            },
        };
        let puts = SideMetrics {
            open_interest: self.puts_oi,
            change_in_oi: self.puts_change_oi,
            volume: self.puts_volume,
            implied_volatility: self.puts_iv,
            last_price: self.puts_ltp,
            net_change: self.puts_net_change,
            bid_price: self.puts_bid_price,
            ask_price: self.puts_ask_price,
            open: self.puts_open,
            high: self.puts_high,
            low: self.puts_low,
            oi_value: self.puts_oi_value,
            change_oi_value: self.puts_change_oi_value,
            average_price: self.puts_average_price,
            buildup: self.puts_builtup,
            intrinsic: self.puts_intrisic,
            time_value: self.puts_time_value,
            greeks: Greeks {
                delta: self.put_delta,
                gamma: self.put_gamma,
                theta: self.put_theta,
                vega: self.put_vega,
                rho: self.put_rho,
            },
        };

        Observation {
            ingested_at,
            strike_price: self.strike_price,
            expiry: self.expiry_date,
            pcr: self.pcr,
            symbol: self.symbol_name,
            index_close: self.index_close,
            time_label: self.time,
            calls,
            puts,
        }
    }
}

/// Key must be present, value may be null
fn nullable<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Option::<f64>::deserialize(d)
}

/// `opTotals`
#[derive(Debug, Deserialize)]
struct RawTotals {
    itm_total_calls: RawBucket,
    itm_total_puts: RawBucket,
    otm_total_calls: RawBucket,
    otm_total_puts: RawBucket,
    total_calls_puts: RawCombined,
}

/// Bucket fields carry the bucket name as a prefix (`itm_total_calls_oi`, ...)
#[derive(Debug, Deserialize)]
struct RawBucket {
    #[serde(
        alias = "itm_total_calls_oi",
        alias = "itm_total_puts_oi",
        alias = "otm_total_calls_oi",
        alias = "otm_total_puts_oi"
    )]
    oi: f64,
    #[serde(
        alias = "itm_total_calls_change_oi",
        alias = "itm_total_puts_change_oi",
        alias = "otm_total_calls_change_oi",
        alias = "otm_total_puts_change_oi"
    )]
    change_oi: f64,
    #[serde(
        alias = "itm_total_calls_volume",
        alias = "itm_total_puts_volume",
        alias = "otm_total_calls_volume",
        alias = "otm_total_puts_volume"
    )]
    volume: f64,
}

impl From<RawBucket> for BucketTotals {
    fn from(b: RawBucket) -> Self {
        Self {
            open_interest: b.oi,
            change_in_oi: b.change_oi,
            volume: b.volume,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCombined {
    total_calls_oi: f64,
    total_calls_change_oi: f64,
    total_calls_volume: f64,
    total_puts_oi: f64,
    total_puts_change_oi: f64,
    total_puts_volume: f64,
}

impl RawTotals {
    fn into_summary(self, symbol: &str, ingested_at: DateTime<Utc>) -> TotalsSummary {
        TotalsSummary {
            ingested_at,
            symbol: symbol.to_string(),
            itm_calls: self.itm_total_calls.into(),
            itm_puts: self.itm_total_puts.into(),
            otm_calls: self.otm_total_calls.into(),
            otm_puts: self.otm_total_puts.into(),
            total: CombinedTotals {
                calls_oi: self.total_calls_puts.total_calls_oi,
                calls_change_in_oi: self.total_calls_puts.total_calls_change_oi,
                calls_volume: self.total_calls_puts.total_calls_volume,
                puts_oi: self.total_calls_puts.total_puts_oi,
                puts_change_in_oi: self.total_calls_puts.total_puts_change_oi,
                puts_volume: self.total_calls_puts.total_puts_volume,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    pub(crate) fn raw_record(strike: i64, time: &str) -> Value {
        let mut rec = json!({
            "strike_price": strike,
            "expiry_date": "2024-06-27",
            "pcr": 0.92,
            "symbol_name": "NIFTY",
            "index_close": 23_264.85,
            "time": time,
            "calls_builtup": "LB",
            "puts_builtup": "SC",
        });
        let obj = rec.as_object_mut().unwrap();
        for side in ["calls", "puts"] {
            for field in [
                "oi", "change_oi", "volume", "iv", "ltp", "net_change", "bid_price",
                "ask_price", "open", "high", "low", "oi_value", "change_oi_value",
                "average_price", "intrisic", "time_value",
            ] {
                obj.insert(format!("{}_{}", side, field), json!(strike as f64 / 100.0));
            }
        }
        for side in ["call", "put"] {
            for greek in ["delta", "gamma", "theta", "vega", "rho"] {
                obj.insert(format!("{}_{}", side, greek), json!(0.5));
            }
        }
        rec
    }

    pub(crate) fn raw_totals() -> Value {
        let bucket = |prefix: &str| {
            json!({
                format!("{}_oi", prefix): 1000,
                format!("{}_change_oi", prefix): -25,
                format!("{}_volume", prefix): 5000,
            })
        };
        json!({
            "itm_total_calls": bucket("itm_total_calls"),
            "itm_total_puts": bucket("itm_total_puts"),
            "otm_total_calls": bucket("otm_total_calls"),
            "otm_total_puts": bucket("otm_total_puts"),
            "total_calls_puts": {
                "total_calls_oi": 4000,
                "total_calls_change_oi": 10,
                "total_calls_volume": 9000,
                "total_puts_oi": 3500,
                "total_puts_change_oi": -5,
                "total_puts_volume": 8000,
            },
        })
    }

    pub(crate) fn sample_observation(strike: i64, time: &str) -> Observation {
        RawStrikeRecord::deserialize(&raw_record(strike, time))
            .unwrap()
            .into_observation(Utc.with_ymd_and_hms(2024, 6, 5, 4, 30, 0).unwrap())
    }

    fn snapshot(strikes: usize) -> RawSnapshot {
        RawSnapshot {
            records: (0..strikes as i64)
                .map(|i| raw_record(22_000 + i * 50, "10:00:00"))
                .collect(),
            totals: raw_totals(),
        }
    }

    #[test]
    fn test_middle_window_centers_on_position() {
        let items: Vec<usize> = (0..50).collect();
        let window = middle_window(&items, 20);
        assert_eq!(window.len(), 20);
        assert_eq!(window[0], 15);
        assert_eq!(window[19], 34);
    }

    #[test]
    fn test_middle_window_odd_remainder_floors() {
        let items: Vec<usize> = (0..25).collect();
        let window = middle_window(&items, 20);
        assert_eq!(window[0], 2);
    }

    #[test]
    fn test_middle_window_short_list_is_unchanged() {
        let items: Vec<usize> = (0..10).collect();
        assert_eq!(middle_window(&items, 20), &items[..]);
        assert_eq!(middle_window(&items, 10), &items[..]);
    }

    #[test]
    fn test_shape_snapshot_maps_fields() {
        let at = Utc.with_ymd_and_hms(2024, 6, 5, 4, 30, 0).unwrap();
        let shaped = shape_snapshot(&snapshot(50), &SymbolConfig::new("nifty"), at).unwrap();

        assert_eq!(shaped.observations.len(), 20);
        let first = &shaped.observations[0];
        assert_eq!(first.strike_price, Decimal::from(22_000 + 15 * 50));
        assert_eq!(first.time_label, "10:00:00");
        assert_eq!(first.symbol, "NIFTY");
        assert_eq!(first.expiry, "2024-06-27");
        assert_eq!(first.ingested_at, at);
        assert_eq!(first.calls.open_interest, 227.5);
        assert_eq!(first.puts.buildup.as_deref(), Some("SC"));
        assert_eq!(first.calls.greeks.delta, Some(0.5));

        assert_eq!(shaped.totals.symbol, "nifty");
        assert_eq!(shaped.totals.itm_calls.open_interest, 1000.0);
        assert_eq!(shaped.totals.otm_puts.change_in_oi, -25.0);
        assert_eq!(shaped.totals.total.puts_volume, 8000.0);
    }

    #[test]
    fn test_window_size_follows_symbol_config() {
        let at = Utc::now();
        let cfg = SymbolConfig::new("nifty").with_window(5);
        let shaped = shape_snapshot(&snapshot(12), &cfg, at).unwrap();
        assert_eq!(shaped.observations.len(), 5);
        assert_eq!(shaped.observations[0].strike_price, Decimal::from(22_000 + 3 * 50));
    }

    #[test]
    fn test_missing_record_field_is_an_error() {
        let mut raw = snapshot(3);
        raw.records[1].as_object_mut().unwrap().remove("puts_oi");

        let err = shape_snapshot(&raw, &SymbolConfig::new("nifty"), Utc::now()).unwrap_err();
        match err {
            ShapeError::Record { index, source } => {
                assert_eq!(index, 1);
                assert!(source.to_string().contains("puts_oi"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_null_quote_field_shapes_as_none() {
        let mut raw = snapshot(2);
        raw.records[0]["call_delta"] = Value::Null;
        raw.records[0]["puts_ltp"] = Value::Null;
        raw.records[0]["pcr"] = Value::Null;

        let shaped = shape_snapshot(&raw, &SymbolConfig::new("nifty"), Utc::now()).unwrap();

        assert_eq!(shaped.observations.len(), 2);
        let first = &shaped.observations[0];
        assert_eq!(first.calls.greeks.delta, None);
        assert_eq!(first.calls.greeks.gamma, Some(0.5));
        assert_eq!(first.puts.last_price, None);
        assert_eq!(first.pcr, None);
        assert_eq!(shaped.observations[1].calls.greeks.delta, Some(0.5));
    }

    #[test]
    fn test_null_open_interest_is_an_error() {
        let mut raw = snapshot(2);
        raw.records[1]["calls_oi"] = Value::Null;

        let err = shape_snapshot(&raw, &SymbolConfig::new("nifty"), Utc::now()).unwrap_err();
        assert!(matches!(err, ShapeError::Record { index: 1, .. }));
    }

    #[test]
    fn test_records_outside_window_are_not_validated() {
        let mut raw = snapshot(30);
        raw.records[0].as_object_mut().unwrap().remove("time");
        let shaped = shape_snapshot(&raw, &SymbolConfig::new("nifty"), Utc::now()).unwrap();
        assert_eq!(shaped.observations.len(), 20);
    }

    #[test]
    fn test_missing_totals_bucket_is_an_error() {
        let mut raw = snapshot(3);
        raw.totals.as_object_mut().unwrap().remove("otm_total_calls");
        let err = shape_snapshot(&raw, &SymbolConfig::new("nifty"), Utc::now()).unwrap_err();
        assert!(matches!(err, ShapeError::Totals(_)));
    }
}
