//! Enrichment Worker CLI
//!
//! Long-running consumer of the company enrichment queue:
//! 1. Loads configuration (YAML file and/or environment)
//! 2. Connects to Postgres and optionally applies the schema
//! 3. Runs N workers until Ctrl-C
//!
//! Usage:
//!   cargo run --features database,cli --bin enrichment_worker -- \
//!     --config config/enrichment.yaml \
//!     --workers 4
//!
//! Operator actions:
//!   # Queue counts
//!   cargo run --features database,cli --bin enrichment_worker -- --stats
//!
//!   # Return failed entries to pending after fixing the cause
//!   cargo run --features database,cli --bin enrichment_worker -- --requeue-failed
//!
//!   # Process one batch and exit
//!   cargo run --features database,cli --bin enrichment_worker -- --once

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use company_resolver::{
    apply_schema, BackflowWriter, EnrichmentConfig, EnrichmentQueue, EnrichmentWorker,
    HttpLookupClient, PgCacheStore, PgEnrichmentQueue, WorkerSettings,
};

/// Company enrichment queue worker
#[derive(Parser, Debug)]
#[command(name = "enrichment_worker")]
#[command(about = "Resolve queued company names against the external entity-search service")]
struct Args {
    /// YAML configuration file; environment variables override it
    #[arg(long, short = 'c', env = "COMPANY_ENRICHMENT_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Number of concurrent workers (default: queue.workers from config)
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Create the enrichment schema before starting
    #[arg(long)]
    apply_schema: bool,

    /// Process a single batch and exit
    #[arg(long)]
    once: bool,

    /// Print queue counts and exit
    #[arg(long)]
    stats: bool,

    /// Move failed entries back to pending and exit
    #[arg(long)]
    requeue_failed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EnrichmentConfig::load_from_file(path)?,
        None => EnrichmentConfig::from_env().context("Loading configuration from environment")?,
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.queue.workers.max(1) as u32 + 2)
        .connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;

    if args.apply_schema {
        apply_schema(&pool).await?;
    }

    let queue = Arc::new(PgEnrichmentQueue::new(pool.clone()));

    if args.stats {
        let stats = queue.stats().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if args.requeue_failed {
        let requeued = queue.requeue_failed().await?;
        tracing::info!(requeued, "Failed entries returned to pending");
        return Ok(());
    }

    let client = Arc::new(
        HttpLookupClient::from_config(&config.external)
            .context("External lookup client is not configured")?,
    );
    let cache = Arc::new(PgCacheStore::new(pool.clone()));
    let writer = Arc::new(BackflowWriter::from_config(cache, &config));
    let worker = EnrichmentWorker::new(queue, client, writer, WorkerSettings::from_config(&config));

    if args.once {
        let report = worker.process_batch().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = args.workers.unwrap_or(config.queue.workers);
    let handles = worker.spawn_workers(workers, shutdown_rx);
    tracing::info!(workers = handles.len(), "Enrichment workers running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    pool.close().await;
    Ok(())
}
