//! Chronicle ingestion daemon.
//!
//! This is the main entry point for the analytics ingestion service. It owns
//! the event buffer, the durable journal, the batch flusher, and the voice
//! session tracker, and exposes Prometheus metrics.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (DATABASE_URL from the environment / .env)
//! chronicle-ingest
//!
//! # Run with custom paths
//! chronicle-ingest \
//!     --journal-path /data/chronicle/journal.db \
//!     --database-url postgres://chronicle@db/chronicle
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) for graceful shutdown:
//! 1. Stops all periodic schedulers
//! 2. Closes active voice sessions (synthesized leaves)
//! 3. Runs one final flush of every buffer lane
//! 4. Closes the store pool and exits

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chronicle_core::metrics::{init_metrics, start_metrics_server};
use chronicle_core::privacy::NameCodec;
use chronicle_ingest::scheduler::{spawn_periodic, Shutdown};
use chronicle_ingest::supervisor::HEALTH_CHECK_INTERVAL;
use chronicle_ingest::voice::SAMPLE_INTERVAL_SECS;
use chronicle_ingest::{
    retry_with_backoff, BackoffConfig, BatchFlusher, ConnState, ConnectionSupervisor,
    DirectWriteFallback, EventBuffer, IngestGateway, Journal, PersistentStore,
    VoiceSessionTracker,
};

/// How long the shutdown sequence may take before we give up and exit.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
/// Stale voice sweep / limiter prune cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// Retention and compression policy re-application cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Chronicle ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "chronicle-ingest")]
#[command(about = "Community analytics ingestion daemon")]
#[command(version)]
struct Args {
    /// Postgres/TimescaleDB connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// SQLite journal path for unflushed records
    #[arg(long, env = "JOURNAL_PATH", default_value = "./data/journal.db")]
    journal_path: PathBuf,

    /// Maximum Postgres pool connections
    #[arg(long, default_value = "10")]
    max_connections: u32,

    /// Base64-encoded 32-byte key for display-name encryption
    /// (names are hashed instead when absent)
    #[arg(long, env = "NAME_KEY")]
    name_key: Option<String>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("chronicle_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Chronicle ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    if let Some(dir) = args.journal_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating journal directory {}", dir.display()))?;
    }
    let journal =
        Arc::new(Journal::open(&args.journal_path).context("opening journal")?);

    let (shutdown_handle, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping gracefully...");
            shutdown_handle.trigger();
        }
    });

    // A store outage at boot is no different from one mid-run: keep retrying
    // until it answers or we are told to stop.
    let store = match retry_with_backoff(
        "store-connect",
        BackoffConfig::default(),
        shutdown.clone(),
        || PersistentStore::connect(&args.database_url, args.max_connections),
    )
    .await
    {
        Some(store) => store,
        None => {
            tracing::info!("shutdown requested before the store connected");
            return Ok(());
        }
    };
    store.init_schema().await.context("initializing schema")?;
    if let Err(e) = store.run_maintenance().await {
        // Policies are best-effort: a vanilla Postgres without the
        // timescaledb extension still works for ingestion.
        tracing::warn!("maintenance policies not applied: {}", e);
    }

    let (buffer, flush_trigger) = EventBuffer::new(journal.clone());
    let recovered = buffer.recover().context("recovering journal")?;
    tracing::info!(recovered, "buffer ready");

    let applier: Arc<dyn chronicle_ingest::RecordApplier> = Arc::new(store.clone());
    let flusher = Arc::new(BatchFlusher::new(buffer.clone(), applier.clone()));
    let supervisor = Arc::new(ConnectionSupervisor::new(store.clone(), journal.clone()));
    let gateway = Arc::new(IngestGateway::new(
        buffer.clone(),
        DirectWriteFallback::new(applier),
        supervisor.health(),
        NameCodec::from_key(args.name_key.as_deref()),
        Arc::new(VoiceSessionTracker::new()),
    ));

    let flush_task = {
        let flusher = flusher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { flusher.run(flush_trigger, shutdown).await })
    };

    let sampler_task = {
        let gateway = gateway.clone();
        spawn_periodic(
            "voice-sampler",
            Duration::from_secs(SAMPLE_INTERVAL_SECS),
            shutdown.clone(),
            move || {
                let gateway = gateway.clone();
                async move { gateway.sample_voice().await }
            },
        )
    };

    let cleanup_task = {
        let gateway = gateway.clone();
        spawn_periodic("cleanup", CLEANUP_INTERVAL, shutdown.clone(), move || {
            let gateway = gateway.clone();
            async move { gateway.cleanup_voice().await }
        })
    };

    let health_task = {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        spawn_periodic(
            "health-check",
            HEALTH_CHECK_INTERVAL,
            shutdown.clone(),
            move || {
                let supervisor = supervisor.clone();
                let shutdown = shutdown.clone();
                async move {
                    supervisor.check_once().await;
                    // A failed probe switches to aggressive reconnects
                    // instead of waiting out the probe interval.
                    if supervisor.store_state() == ConnState::Disconnected {
                        supervisor.await_store(shutdown).await;
                    }
                }
            },
        )
    };

    let maintenance_task = {
        let store = store.clone();
        spawn_periodic(
            "maintenance",
            MAINTENANCE_INTERVAL,
            shutdown.clone(),
            move || {
                let store = store.clone();
                async move {
                    if let Err(e) = store.run_maintenance().await {
                        tracing::warn!("maintenance run failed: {}", e);
                    }
                }
            },
        )
    };

    // TODO: wire the platform gateway adapter onto `gateway` once the bot
    // transport lands; until then events arrive via the library API.
    tracing::info!("ingestion pipeline running");

    let mut shutdown_wait = shutdown.clone();
    shutdown_wait.triggered().await;

    let tasks = async {
        for task in [
            flush_task,
            sampler_task,
            cleanup_task,
            health_task,
            maintenance_task,
        ] {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, tasks).await.is_err() {
        tracing::warn!("background tasks did not stop in time");
    }

    // Close sessions first so their rows make the final flush.
    gateway.close_voice_sessions().await;

    let final_flush = tokio::time::timeout(SHUTDOWN_BUDGET, flusher.flush_all()).await;
    match final_flush {
        Ok(report) => tracing::info!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            "final flush complete"
        ),
        Err(_) => {
            let pending = buffer.total_depth();
            tracing::warn!(pending, "final flush timed out; journal will replay on restart");
        }
    }

    store.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}
