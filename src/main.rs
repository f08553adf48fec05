use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use solo::command::CommandWorker;
use solo::config::{self, RunMode, SoloConfig};
use solo::coordination::locks::RedisLease;
use solo::coordination::node::{holder_token, node_id};
use solo::coordination::redis::{create_pool, parse_endpoint};
use solo::health::HealthState;
use solo::http::HttpState;
use solo::metrics::MetricsRegistry;
use solo::{LeaseController, LeaseRegistry, TerminationHook};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "solo",
    about = "Run a command in at most one process at a time, coordinated through Redis"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Worker id.  Every process started with the same id (and prefix)
    /// competes for the same lease.
    #[arg(long)]
    id: String,

    /// Redis host, optionally as `host:port` or `rediss://host:port`.
    #[arg(long)]
    host: Option<String>,

    /// Redis port.
    #[arg(long)]
    port: Option<u16>,

    /// Lease validity in milliseconds.
    #[arg(long)]
    ttl_ms: Option<u64>,

    /// Delay between acquisition attempts in milliseconds.
    #[arg(long)]
    ping_ms: Option<u64>,

    /// Delay before re-acquiring after a run, in milliseconds.
    #[arg(long)]
    restart_ms: Option<u64>,

    /// Key prefix in Redis.
    #[arg(long)]
    prefix: Option<String>,

    /// Run the command once, then exit.
    #[arg(long)]
    one_shot: bool,

    /// Program and arguments to run while holding the lease.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    /// Fold command-line overrides into the loaded config.
    fn apply(&self, config: &mut SoloConfig) -> Result<()> {
        if let Some(host) = &self.host {
            let endpoint = parse_endpoint(host)?;
            config.redis.host = endpoint.host;
            if let Some(port) = endpoint.port {
                config.redis.port = port;
            }
            config.redis.tls |= endpoint.tls;
        }
        if let Some(port) = self.port {
            config.redis.port = port;
        }
        if let Some(ttl) = self.ttl_ms {
            config.lease.ttl_ms = ttl;
        }
        if let Some(ping) = self.ping_ms {
            config.lease.ping_interval_ms = ping;
        }
        if let Some(restart) = self.restart_ms {
            config.lease.restart_interval_ms = restart;
        }
        if let Some(prefix) = &self.prefix {
            config.lease.key_prefix = prefix.clone();
        }
        if self.one_shot {
            config.lease.mode = RunMode::OneShot;
        }
        config::validate_config(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => SoloConfig::default(),
    };
    cli.apply(&mut config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, id = %cli.id, "starting solo");

    // ---- Coordination store ----
    let pool = create_pool(&config.redis).await?;
    let node = node_id();
    let holder = holder_token(&node);
    tracing::info!(%node, %holder, "node identity established");
    let lease = RedisLease::new(pool.clone(), holder, config.redis.command_timeout());

    // ---- Shutdown + metrics ----
    let registry = LeaseRegistry::global();
    TerminationHook::install(registry.clone());
    let metrics = MetricsRegistry::new();

    if let Some(listen) = config.metrics_listen.clone() {
        let state = HttpState {
            health: HealthState {
                redis: pool.clone(),
                registry: registry.clone(),
                ping_timeout: config.redis.command_timeout(),
            },
            metrics: metrics.clone(),
        };
        // The termination hook exits the process; the server never needs
        // its own graceful shutdown.
        tokio::spawn(async move {
            if let Err(e) = solo::http::serve(&listen, state, std::future::pending()).await {
                tracing::error!(error = %e, "HTTP endpoint failed");
            }
        });
    }

    // ---- Worker ----
    let (program, args) = cli
        .command
        .split_first()
        .context("no command given")?;
    let heartbeat = CommandWorker::heartbeat_for(config.lease.lease_config().ttl);
    let worker = CommandWorker::new(program.clone(), args.to_vec(), heartbeat);

    let controller = LeaseController::builder(cli.id.clone())
        .settings(&config.lease)
        .lease(Arc::new(lease))
        .worker(worker)
        .registry(registry)
        .metrics(metrics)
        .on_lease_lapsed(|event| {
            tracing::error!(
                key = %event.key,
                episode = event.episode,
                "command outlived its lease; another process may now be running it"
            );
        })
        .build()?;

    tracing::info!(key = %controller.key(), "waiting for lease");
    controller.start().join().await?;

    tracing::info!("solo shut down cleanly");
    Ok(())
}
