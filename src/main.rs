use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::admission::{Gatekeeper, KeyDeriver, Outcome, RuleSet};
use turnstile::config::{BackendKind, LogFormat, TelemetryConfig, TurnstileConfig};
use turnstile::store::{
    BestEffortStore, MemoryDocumentStore, MemoryHashStore, TrackerStore, TransactionalStore,
};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-identity request admission control")]
struct Cli {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Answer `<identity> <resource>` lines from stdin with one JSON decision per line
    Serve,
    /// Run repeated admissions for one identity and resource
    Check {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        resource: String,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Pause between attempts
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[derive(Debug, Serialize)]
struct Reply<'a> {
    identity: &'a str,
    resource: &'a str,
    outcome: &'a Outcome,
    status: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    init_tracing(&config.telemetry);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules = RuleSet::new(&config.limits)?;
    let keys = match &config.storage.key_namespace {
        Some(namespace) => KeyDeriver::with_namespace(namespace.clone()),
        None => KeyDeriver::new(),
    };
    let deadline = match config.storage.deadline_millis {
        0 => None,
        millis => Some(Duration::from_millis(millis)),
    };

    info!(
        backend = ?config.storage.backend,
        namespace = ?keys.namespace(),
        rules = rules.rules().len(),
        "Configuration loaded"
    );

    match config.storage.backend {
        BackendKind::Transactional => {
            let store = TransactionalStore::with_retry(
                MemoryDocumentStore::new(),
                config.storage.retry,
            );
            let gatekeeper = Gatekeeper::new(Arc::new(store), rules, keys);
            run(gatekeeper, cli.command, deadline).await?;
        }
        BackendKind::BestEffort => {
            let store = BestEffortStore::new(MemoryHashStore::new());
            let gatekeeper = Gatekeeper::new(Arc::new(store), rules, keys);
            run(gatekeeper, cli.command, deadline).await?;
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    match telemetry.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn admit<S: TrackerStore>(
    gatekeeper: &Gatekeeper<S>,
    identity: &str,
    resource: &str,
    deadline: Option<Duration>,
) -> Outcome {
    let now = Utc::now();
    match deadline {
        Some(deadline) => gatekeeper.admit_within(identity, resource, now, deadline).await,
        None => gatekeeper.admit(identity, resource, now).await,
    }
}

fn render(identity: &str, resource: &str, outcome: &Outcome) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(&Reply {
        identity,
        resource,
        outcome,
        status: outcome.status_code(),
    })?;
    line.push('\n');
    Ok(line)
}

async fn run<S: TrackerStore>(
    gatekeeper: Gatekeeper<S>,
    command: Command,
    deadline: Option<Duration>,
) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();

    match command {
        Command::Serve => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line?,
                    _ = &mut shutdown => break,
                };
                let Some(line) = line else {
                    info!("Input closed");
                    break;
                };

                let mut parts = line.split_whitespace();
                let (Some(identity), Some(resource), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    if !line.trim().is_empty() {
                        warn!(line = %line, "Expected `<identity> <resource>`");
                    }
                    continue;
                };

                let outcome = admit(&gatekeeper, identity, resource, deadline).await;
                stdout
                    .write_all(render(identity, resource, &outcome)?.as_bytes())
                    .await?;
                stdout.flush().await?;
            }
        }
        Command::Check {
            identity,
            resource,
            repeat,
            interval_ms,
        } => {
            for attempt in 0..repeat {
                if attempt > 0 && interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                let outcome = admit(&gatekeeper, &identity, &resource, deadline).await;
                stdout
                    .write_all(render(&identity, &resource, &outcome)?.as_bytes())
                    .await?;
            }
            stdout.flush().await?;
        }
    }

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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
