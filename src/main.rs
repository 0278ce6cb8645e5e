//! optchain-recorder
//!
//! Records option-chain snapshots for the configured symbols while the
//! exchange is open. Ctrl-C stops the scheduler between cycles, closes the
//! store and shuts the health server down.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use optchain_recorder::{
    api::{self, ApiState},
    config::parse_symbol_list,
    AppConfig, DbObservationStore, IngestionScheduler, OptionChainClient, SymbolRegistry,
    SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "optchain-recorder")]
#[command(about = "Record NSE option-chain snapshots during market hours")]
struct Args {
    /// TOML config file; defaults are used when absent
    #[arg(long, env = "OPTCHAIN_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,

    /// Seconds between cycle starts
    #[arg(long, env = "POLL_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Bind address for /health and /symbols
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Comma-separated `symbol[:expiry[:window]]` list, replaces the file's symbols
    #[arg(long, env = "SYMBOLS")]
    symbols: Option<String>,
}

impl Args {
    /// File (or defaults) first, then CLI/env overrides
    fn into_config(self) -> Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        if let Some(db_path) = self.db_path {
            cfg.db_path = db_path;
        }
        if let Some(secs) = self.interval_secs {
            cfg.poll_interval_secs = secs;
        }
        if let Some(addr) = self.health_addr {
            cfg.health_addr = addr;
        }
        if let Some(raw) = self.symbols {
            cfg.symbols = parse_symbol_list(&raw)?;
        }

        cfg.finish()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cfg = Args::parse().into_config()?;
    info!(
        "⚙️ {} symbols, every {}s, db {}",
        cfg.symbols.len(),
        cfg.poll_interval_secs,
        cfg.db_path
    );

    let schedule = cfg.market.to_schedule()?;
    let store = Arc::new(DbObservationStore::new(&cfg.db_path)?);
    let client = Arc::new(OptionChainClient::new(cfg.fetch.clone())?);
    let registry = SymbolRegistry::new(cfg.symbols.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(&cfg.health_addr)
        .await
        .with_context(|| format!("Failed to bind health server on {}", cfg.health_addr))?;
    let server = tokio::spawn(api::serve(
        listener,
        ApiState {
            symbols: registry.clone(),
        },
        shutdown_rx.clone(),
    ));

    tokio::spawn(forward_interrupt(tokio::signal::ctrl_c(), shutdown_tx));

    let mut scheduler = IngestionScheduler::new(
        schedule,
        client,
        store,
        Arc::new(SystemClock),
        registry,
        cfg.poll_interval(),
    )
    .await
    .context("Failed to load known records")?;

    let run_result = scheduler.run(shutdown_rx).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Health server exited with error: {:#}", e),
        Err(e) => warn!("Health server task failed: {}", e),
    }

    run_result.context("Failed to close storage")?;
    info!("👋 Shutdown complete");
    Ok(())
}

/// Flip `shutdown` once `signal` fires. If the listener cannot be installed
/// the sender is held forever so the recorder keeps running.
async fn forward_interrupt<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("🛑 Interrupt received, stopping after the current step");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            error!("Failed to listen for Ctrl-C, running without it: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "optchain_recorder=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // cwd and parents first, then the crate root when run from elsewhere
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
