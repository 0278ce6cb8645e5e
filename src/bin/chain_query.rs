//! chain-query: read-only reporting over a recorder database
//!
//! Usage:
//!   cargo run --bin chain-query -- --db ./optchain.db counts
//!   cargo run --bin chain-query -- --db ./optchain.db strike 24000 --from 2024-06-05T03:45:00Z
//!   cargo run --bin chain-query -- --db ./optchain.db batch 24000,24050,24100
//!   cargo run --bin chain-query -- --db ./optchain.db stats 24000

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;

use optchain_recorder::DbObservationStore;

#[derive(Parser, Debug)]
#[command(name = "chain-query")]
#[command(about = "Query recorded option-chain observations")]
struct Args {
    /// Path to SQLite database
    #[arg(long, env = "DB_PATH", default_value = "optchain.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Every observation for one strike, oldest first
    Strike {
        strike: Decimal,
        /// RFC 3339 lower bound on ingestion time
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Observations for several strikes
    Batch {
        #[arg(value_delimiter = ',', required = true)]
        strikes: Vec<Decimal>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Strikes per IN query
        #[arg(long, default_value = "50")]
        batch_size: usize,
    },

    /// Aggregates for one strike
    Stats {
        strike: Decimal,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Row counts
    Counts,

    /// Latest totals summaries
    Summaries {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "optchain_recorder=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = DbObservationStore::open_read_only(&args.db)
        .with_context(|| format!("Failed to open {}", args.db))?;

    match args.command {
        Commands::Strike { strike, from, to } => {
            print_json(&store.query_strike(strike, from, to)?)?;
        }
        Commands::Batch {
            strikes,
            from,
            to,
            batch_size,
        } => {
            print_json(&store.batch_query_strikes(&strikes, from, to, batch_size)?)?;
        }
        Commands::Stats { strike, from, to } => match store.strike_stats(strike, from, to)? {
            Some(stats) => print_json(&stats)?,
            None => println!("No observations for strike {}", strike),
        },
        Commands::Counts => {
            println!("observations: {}", store.observation_count()?);
            println!("summaries:    {}", store.summary_count()?);
        }
        Commands::Summaries { limit } => {
            print_json(&store.recent_summaries(limit)?)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
