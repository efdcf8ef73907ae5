use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::alerts::{ChannelSink, LogSink};
use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::Identity;
use tollgate::Tollgate;

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Multi-tier admission control and quota reporting", long_about = None)]
struct Args {
    /// YAML configuration file; TOLLGATE__* environment variables override it
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate an identity (`ip:1.2.3.4` or `key:abc`)
    Check {
        identity: Identity,
        /// Record a successful request if allowed
        #[arg(long)]
        record: bool,
    },
    /// Today's usage against the daily quota
    Status { identity: Identity },
    /// Daily usage, most recent first
    History {
        identity: Identity,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Usage guidance for an identity
    Recommend { identity: Identity },
    /// Run one alert sweep and print the alerts
    Sweep,
    /// Drop usage rows dated before a day (YYYY-MM-DD)
    Purge {
        #[arg(long)]
        before: NaiveDate,
    },
    /// Run the alert scheduler until Ctrl+C or SIGTERM
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = TollgateConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");
    let tollgate = Tollgate::connect(&config).await?;

    match args.command {
        Command::Check { identity, record } => {
            let decision = tollgate.check_rate_limit(&identity).await;
            if record && decision.allowed {
                tollgate.record_request(&identity, true).await;
            }
            print_json(&decision)?;
        }
        Command::Status { identity } => {
            print_json(&tollgate.get_quota_status(&identity).await?)?;
        }
        Command::History { identity, days } => {
            print_json(&tollgate.get_quota_history(&identity, days).await?)?;
        }
        Command::Recommend { identity } => {
            print_json(&tollgate.recommend(&identity).await?)?;
        }
        Command::Sweep => {
            for alert in tollgate.sweep_alerts().await? {
                println!("{}", serde_json::to_string(&alert)?);
            }
        }
        Command::Purge { before } => {
            let removed = tollgate.purge_usage_before(before).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::Watch => watch(&tollgate).await?,
    }

    Ok(())
}

/// Print every sweep batch as a JSON line until shutdown.
async fn watch(tollgate: &Tollgate) -> anyhow::Result<()> {
    let (sink, mut batches) = ChannelSink::new(16);
    let handle = tollgate
        .alert_scheduler()
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(sink))
        .start();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            batch = batches.recv() => match batch {
                Some(batch) => println!("{}", serde_json::to_string(&batch)?),
                None => break,
            },
        }
    }

    handle.stop().await;
    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout stays machine-readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
