//! SQLite-backed observation store
//!
//! - WAL mode so reporting reads don't block the recorder
//! - `(strike_price, time_label)` primary key makes duplicate rows impossible
//! - Observation batches go through one IMMEDIATE transaction
//! - Summaries are written after the batch commits (see `append`)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::PersistenceGateway;
use crate::error::PersistenceError;
use crate::models::{
    strike_to_text, Observation, ObservationKey, SideMetrics, StrikeStats, TotalsSummary,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS observations (
    strike_price TEXT NOT NULL,
    time_label TEXT NOT NULL,
    symbol TEXT NOT NULL,
    expiry TEXT NOT NULL,
    pcr REAL,
    index_close REAL,
    calls_oi REAL NOT NULL,
    puts_oi REAL NOT NULL,
    calls_volume REAL NOT NULL,
    puts_volume REAL NOT NULL,
    calls_json TEXT NOT NULL,
    puts_json TEXT NOT NULL,
    ingested_at INTEGER NOT NULL,   -- unix millis
    PRIMARY KEY (strike_price, time_label)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_observations_ingested_at
    ON observations(ingested_at);

CREATE INDEX IF NOT EXISTS idx_observations_strike_ts
    ON observations(strike_price, ingested_at);

CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    totals_json TEXT NOT NULL,
    ingested_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_ingested_at
    ON summaries(ingested_at);
"#;

const OBSERVATION_COLUMNS: &str = "strike_price, time_label, symbol, expiry, pcr, index_close, \
     calls_json, puts_json, ingested_at";

pub struct DbObservationStore {
    conn: Mutex<Option<Connection>>,
}

impl DbObservationStore {
    /// Open (or create) the database at `db_path`. `":memory:"` works for tests.
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Observation store opened at {} ({} rows)", db_path, count);

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an existing database for queries only. Never creates the file
    /// or touches the schema; any write through this handle fails.
    pub fn open_read_only(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {} read-only", db_path))?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .with_context(|| format!("{} is not a recorder database", db_path))?;
        debug!("Opened {} read-only ({} rows)", db_path, count);

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| PersistenceError::Unavailable("store is closed".into()))?;
        f(conn)
    }

    fn insert_summary(conn: &Connection, summary: &TotalsSummary) -> Result<(), PersistenceError> {
        let totals_json = serde_json::to_string(summary)
            .map_err(|e| PersistenceError::Rejected(e.to_string()))?;
        conn.execute(
            "INSERT INTO summaries (symbol, totals_json, ingested_at) VALUES (?1, ?2, ?3)",
            params![
                &summary.symbol,
                totals_json,
                summary.ingested_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn observation_count(&self) -> Result<u64> {
        let n: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?)
        })?;
        Ok(n as u64)
    }

    pub fn summary_count(&self) -> Result<u64> {
        let n: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM summaries", [], |row| row.get(0))?)
        })?;
        Ok(n as u64)
    }

    /// Most recent summaries, newest first
    pub fn recent_summaries(&self, limit: usize) -> Result<Vec<TotalsSummary>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT totals_json FROM summaries ORDER BY ingested_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.iter()
            .map(|json| serde_json::from_str(json).context("Corrupt summary row"))
            .collect()
    }

    /// All rows for one strike, oldest first, optionally bounded by ingestion time
    pub fn query_strike(
        &self,
        strike: Decimal,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>> {
        self.batch_query_strikes(&[strike], from, to, 1)
    }

    /// Same as `query_strike` for many strikes, issuing one `IN` query per
    /// `batch_size` strikes to bound statement size.
    pub fn batch_query_strikes(
        &self,
        strikes: &[Decimal],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<Vec<Observation>> {
        let (lo, hi) = millis_bounds(from, to);
        let mut out = Vec::new();

        for chunk in strikes.chunks(batch_size.max(1)) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM observations
                 WHERE strike_price IN ({}) AND ingested_at >= ? AND ingested_at <= ?
                 ORDER BY ingested_at, strike_price, time_label",
                OBSERVATION_COLUMNS, placeholders
            );

            let mut values: Vec<SqlValue> = chunk
                .iter()
                .map(|s| SqlValue::Text(strike_to_text(*s)))
                .collect();
            values.push(SqlValue::Integer(lo));
            values.push(SqlValue::Integer(hi));

            let rows = self.with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), Self::row_to_observation)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;
            out.extend(rows);
        }

        Ok(out)
    }

    /// Aggregates over one strike; `None` when no rows match
    pub fn strike_stats(
        &self,
        strike: Decimal,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<StrikeStats>> {
        let (lo, hi) = millis_bounds(from, to);
        let strike_text = strike_to_text(strike);

        type StatsRow = (Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<i64>, Option<i64>, i64);
        let row: StatsRow = self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT AVG(pcr), MAX(calls_oi), MAX(puts_oi), AVG(calls_volume), AVG(puts_volume),
                        MIN(ingested_at), MAX(ingested_at), COUNT(*)
                 FROM observations
                 WHERE strike_price = ?1 AND ingested_at >= ?2 AND ingested_at <= ?3",
                params![strike_text, lo, hi],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )?)
        })?;

        let (avg_pcr, max_c, max_p, avg_cv, avg_pv, first, last, count) = row;
        if count == 0 {
            return Ok(None);
        }

        Ok(Some(StrikeStats {
            strike_price: strike,
            avg_pcr: avg_pcr.unwrap_or_default(),
            max_calls_oi: max_c.unwrap_or_default(),
            max_puts_oi: max_p.unwrap_or_default(),
            avg_calls_volume: avg_cv.unwrap_or_default(),
            avg_puts_volume: avg_pv.unwrap_or_default(),
            first_timestamp: millis_to_utc(first.unwrap_or_default()),
            last_timestamp: millis_to_utc(last.unwrap_or_default()),
            count: count as u64,
        }))
    }

    fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
        let strike_text: String = row.get(0)?;
        let strike_price = Decimal::from_str(&strike_text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
        let calls_json: String = row.get(6)?;
        let puts_json: String = row.get(7)?;

        Ok(Observation {
            strike_price,
            time_label: row.get(1)?,
            symbol: row.get(2)?,
            expiry: row.get(3)?,
            pcr: row.get(4)?,
            index_close: row.get(5)?,
            calls: parse_side(6, &calls_json)?,
            puts: parse_side(7, &puts_json)?,
            ingested_at: millis_to_utc(row.get(8)?),
        })
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?)).unwrap();
    }
}

fn parse_side(idx: usize, json: &str) -> rusqlite::Result<SideMetrics> {
    serde_json::from_str(json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_bounds(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> (i64, i64) {
    (
        from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN),
        to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX),
    )
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl PersistenceGateway for DbObservationStore {
    async fn load_known_keys(&self) -> Result<HashSet<ObservationKey>, PersistenceError> {
        let keys = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT strike_price, time_label FROM observations")?;
            let rows = stmt
                .query_map([], |row| {
                    let strike: String = row.get(0)?;
                    let time_label: String = row.get(1)?;
                    Ok((strike, time_label))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut known = HashSet::with_capacity(keys.len());
        for (strike, time_label) in keys {
            match Decimal::from_str(&strike) {
                Ok(strike_price) => {
                    known.insert(ObservationKey::new(strike_price, time_label));
                }
                Err(e) => warn!("Skipping unparsable strike {:?} in storage: {}", strike, e),
            }
        }

        info!("📦 Loaded {} existing records from database", known.len());
        Ok(known)
    }

    async fn append(
        &self,
        observations: &[Observation],
        summary: &TotalsSummary,
    ) -> Result<HashSet<ObservationKey>, PersistenceError> {
        if observations.is_empty() {
            return Err(PersistenceError::Rejected(
                "refusing to write an empty observation batch".into(),
            ));
        }

        // Pre-serialize outside the lock
        let serialized = observations
            .iter()
            .map(|o| {
                let calls = serde_json::to_string(&o.calls)?;
                let puts = serde_json::to_string(&o.puts)?;
                Ok((o, calls, puts))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .map_err(|e| PersistenceError::Rejected(e.to_string()))?;

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut committed = HashSet::with_capacity(serialized.len());
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO observations
                     (strike_price, time_label, symbol, expiry, pcr, index_close,
                      calls_oi, puts_oi, calls_volume, puts_volume,
                      calls_json, puts_json, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )?;
                for (obs, calls_json, puts_json) in &serialized {
                    let changes = stmt.execute(params![
                        strike_to_text(obs.strike_price),
                        &obs.time_label,
                        &obs.symbol,
                        &obs.expiry,
                        obs.pcr,
                        obs.index_close,
                        obs.calls.open_interest,
                        obs.puts.open_interest,
                        obs.calls.volume,
                        obs.puts.volume,
                        calls_json,
                        puts_json,
                        obs.ingested_at.timestamp_millis(),
                    ])?;
                    if changes > 0 {
                        committed.insert(obs.key());
                    }
                }
            }
            tx.commit()?;

            debug!("📦 Batch inserted {} observations", committed.len());

            // Every key was already stored: nothing new, so no summary either
            if committed.is_empty() {
                return Ok(committed);
            }

            match Self::insert_summary(conn, summary) {
                Ok(()) => Ok(committed),
                Err(e) => Err(PersistenceError::SummaryWrite {
                    committed,
                    summary: summary.clone(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    async fn append_summary(&self, summary: &TotalsSummary) -> Result<(), PersistenceError> {
        self.with_conn(|conn| Self::insert_summary(conn, summary))
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().take();
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| PersistenceError::Unavailable(e.to_string())),
            None => Ok(()),
        }
    }
}
