//! Recorder configuration
//!
//! Loaded once at startup from an optional TOML file; CLI flags and
//! environment variables are applied on top by `main`. The symbol list lives
//! in a `SymbolRegistry` afterwards so it can change at runtime.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::schedule::MarketSchedule;

pub const DEFAULT_WINDOW: usize = 20;

/// One tracked instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    /// Expiry label passed to the provider; empty means nearest expiry
    #[serde(default)]
    pub expiry: String,
    /// Number of strikes kept around the middle of the chain
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

impl SymbolConfig {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            expiry: String::new(),
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_expiry(mut self, expiry: impl Into<String>) -> Self {
        self.expiry = expiry.into();
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    fn normalized(mut self) -> Self {
        self.symbol = normalize_symbol(&self.symbol);
        self.expiry = self.expiry.trim().to_string();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("symbol name must not be empty");
        }
        if self.window == 0 {
            bail!("window for {} must be at least 1", self.symbol);
        }
        Ok(())
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

/// Parse `nifty,banknifty:2024-06-27:30` style lists (symbol[:expiry[:window]])
pub fn parse_symbol_list(raw: &str) -> Result<Vec<SymbolConfig>> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let mut cfg = SymbolConfig::new(parts.next().unwrap_or_default());
        if let Some(expiry) = parts.next() {
            cfg.expiry = expiry.trim().to_string();
        }
        if let Some(window) = parts.next() {
            cfg.window = window
                .trim()
                .parse()
                .with_context(|| format!("Invalid window in symbol entry {:?}", entry))?;
        }
        cfg.validate()?;
        out.push(cfg);
    }
    Ok(out)
}

/// Provider endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub exchange: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Ask the provider for `window / 2` strikes either side of ATM instead
    /// of the full chain
    pub narrow_range: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://webapi.niftytrader.in/webapi/option/option-chain-data".into(),
            exchange: "nse".into(),
            connect_timeout_secs: 5,
            read_timeout_secs: 15,
            max_retries: 3,
            backoff_ms: 500,
            narrow_range: false,
        }
    }
}

/// Session hours in the exchange timezone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHoursConfig {
    pub timezone: String,
    pub open: String,
    pub close: String,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".into(),
            open: "09:15:00".into(),
            close: "15:30:00".into(),
        }
    }
}

impl MarketHoursConfig {
    pub fn to_schedule(&self) -> Result<MarketSchedule> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Unknown timezone {:?}: {}", self.timezone, e))?;
        let open = parse_time(&self.open)?;
        let close = parse_time(&self.close)?;
        if open >= close {
            bail!("market open {} must be before close {}", self.open, self.close);
        }
        Ok(MarketSchedule::new(tz, open, close))
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .with_context(|| format!("Invalid time of day {:?}", raw))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub symbols: Vec<SymbolConfig>,
    pub poll_interval_secs: u64,
    pub db_path: String,
    pub health_addr: String,
    pub market: MarketHoursConfig,
    pub fetch: FetchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: vec![SymbolConfig::new("nifty")],
            poll_interval_secs: 2,
            db_path: "optchain.db".into(),
            health_addr: "0.0.0.0:8000".into(),
            market: MarketHoursConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(raw).context("Failed to parse config TOML")?;
        cfg.finish()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Normalize symbols and reject unusable settings
    pub fn finish(mut self) -> Result<Self> {
        self.symbols = self.symbols.into_iter().map(SymbolConfig::normalized).collect();
        for s in &self.symbols {
            s.validate()?;
        }
        if self.symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        self.market.to_schedule()?;
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Shared, runtime-mutable ordered list of tracked symbols.
///
/// The scheduler takes a snapshot at the start of each cycle, so changes are
/// picked up on the next cycle.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    inner: Arc<RwLock<Vec<SymbolConfig>>>,
}

impl SymbolRegistry {
    pub fn new(symbols: Vec<SymbolConfig>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(symbols)),
        }
    }

    pub fn snapshot(&self) -> Vec<SymbolConfig> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolConfig> {
        let key = normalize_symbol(symbol);
        self.inner.read().iter().find(|s| s.symbol == key).cloned()
    }

    /// Append a symbol. Fails if it is already tracked.
    pub fn add(&self, config: SymbolConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;
        let mut symbols = self.inner.write();
        if symbols.iter().any(|s| s.symbol == config.symbol) {
            bail!("symbol {} is already tracked", config.symbol);
        }
        symbols.push(config);
        Ok(())
    }

    /// Remove a symbol, returning its config if it was tracked
    pub fn remove(&self, symbol: &str) -> Option<SymbolConfig> {
        let key = normalize_symbol(symbol);
        let mut symbols = self.inner.write();
        let idx = symbols.iter().position(|s| s.symbol == key)?;
        Some(symbols.remove(idx))
    }

    /// Replace the settings of a tracked symbol in place (order is kept).
    pub fn update(&self, config: SymbolConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;
        let mut symbols = self.inner.write();
        match symbols.iter_mut().find(|s| s.symbol == config.symbol) {
            Some(slot) => {
                *slot = config;
                Ok(())
            }
            None => bail!("symbol {} is not tracked", config.symbol),
        }
    }

    /// Insert or replace
    pub fn upsert(&self, config: SymbolConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;
        let mut symbols = self.inner.write();
        match symbols.iter_mut().find(|s| s.symbol == config.symbol) {
            Some(slot) => *slot = config,
            None => symbols.push(config),
        }
        Ok(())
    }
}
