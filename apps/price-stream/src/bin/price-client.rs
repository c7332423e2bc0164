#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Price Client Binary
//!
//! Subscribes to the price stream service and logs every update.
//!
//! # Usage
//!
//! ```bash
//! price-client usd
//! price-client --start 2024-01-01T00:00:00Z all
//! price-client --addr http://prices:50051 watch GBP JPY
//! ```
//!
//! A dropped stream is not resumed: the client exits with an error once the
//! server ends or fails the stream.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use price_stream::infrastructure::telemetry::{self, TelemetryConfig};
use price_stream::proto::SubscribeRequest;
use price_stream::{ConnectPolicy, connect_with_retry};

#[derive(Debug, Parser)]
#[command(name = "price-client", version, about = "A client for the price stream service")]
struct Cli {
    /// Replay history from this instant (RFC3339). Defaults to now.
    #[arg(long, global = true)]
    start: Option<String>,

    /// Server address.
    #[arg(long, global = true, env = "PRICE_STREAM_ADDR", default_value = "http://localhost:50051")]
    addr: String,

    /// Connection attempts before giving up.
    #[arg(long, global = true, default_value_t = 5)]
    retries: u32,

    /// Seconds to wait between connection attempts.
    #[arg(long, global = true, default_value_t = 2)]
    backoff_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream the price in USD.
    Usd,
    /// Stream the price in EUR.
    Eur,
    /// Stream the price in USD and EUR.
    All,
    /// Stream the price in the given currency codes.
    Watch {
        /// Currency codes, e.g. GBP JPY.
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

impl Command {
    fn currencies(self) -> Vec<String> {
        match self {
            Self::Usd => vec!["USD".to_string()],
            Self::Eur => vec!["EUR".to_string()],
            Self::All => vec!["USD".to_string(), "EUR".to_string()],
            Self::Watch { codes } => codes,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry_guard = telemetry::init_with_config(TelemetryConfig {
        service_name: "price-client".to_string(),
        ..TelemetryConfig::from_env()
    });

    let policy = ConnectPolicy {
        attempts: cli.retries.max(1),
        backoff: Duration::from_secs(cli.backoff_secs),
    };
    let mut client = connect_with_retry(&cli.addr, policy)
        .await
        .context("could not connect")?;

    let start_time = cli
        .start
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    let currencies = cli.command.currencies();
    tracing::info!(?currencies, start_time = %start_time, "Subscribing");

    let mut stream = client
        .subscribe(SubscribeRequest {
            currencies,
            start_time,
        })
        .await
        .context("error while calling Subscribe")?
        .into_inner();

    while let Some(update) = stream
        .message()
        .await
        .context("error while reading stream")?
    {
        tracing::info!(
            currency = %update.currency,
            timedate = %update.timedate,
            price = update.price,
            "Received a new price update"
        );
    }

    bail!("the stream has ended")
}
