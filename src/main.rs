//! License Ledger Daemon
//!
//! Serves the trigger/query API and runs the daily batch.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (HTTP server + scheduler)
//! license-ledger
//!
//! # Start with custom config
//! license-ledger --config /path/to/config.toml
//!
//! # Triggers only; an external cron calls POST /batch/daily
//! license-ledger --no-scheduler
//! ```
//!
//! See `http.rs` for the endpoint list.

use clap::Parser;
use license_ledger::services::events::spawn_logging_listener;
use license_ledger::{Config, HttpServer, LedgerDb, Scheduler, Services};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "license-ledger")]
#[command(about = "Benefit accrual and referral payout engine for license packages")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "LICENSE_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "LICENSE_LEDGER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "LICENSE_LEDGER_HTTP_PORT")]
    http_port: Option<u16>,

    /// Disable the in-process scheduler (HTTP triggers only)
    #[arg(long)]
    no_scheduler: bool,

    /// Skip the startup reconciliation pass
    #[arg(long)]
    no_reconcile: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("license_ledger=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if args.no_scheduler {
        config.scheduler_enabled = false;
    }
    if args.no_reconcile {
        config.reconcile_on_start = false;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        epoch = %config.program_epoch,
        pool_policy = ?config.pool_policy,
        "Starting license-ledger"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(LedgerDb::open(&config.storage_dir)?);
    let services = Arc::new(Services::new(db.clone(), &config));
    let listener_handle = spawn_logging_listener(services.events.clone());

    // The ledger wins over stored state; fix drift before taking traffic
    if config.reconcile_on_start {
        let summary = services.reconcile.reconcile_all()?;
        let invariants = services.reconcile.verify_invariants()?;
        if !summary.failed.is_empty() || !invariants.is_clean() {
            warn!(
                failed = summary.failed.len(),
                clean = invariants.is_clean(),
                "Startup reconciliation found problems; affected purchases are halted"
            );
        }
    }

    let scheduler = Arc::new(Scheduler::new(
        services.clone(),
        config.max_concurrency,
        Duration::from_secs(config.scheduler_interval_secs),
    ));

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(scheduler.clone(), http_addr));
    info!("HTTP API available at http://{}", http_addr);

    // Start scheduler if enabled
    let scheduler_handle = if config.scheduler_enabled {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        info!(
            interval_secs = config.scheduler_interval_secs,
            max_concurrency = config.max_concurrency,
            "Scheduler enabled"
        );
        let handle = tokio::spawn(scheduler.clone().run_loop(shutdown_rx));
        Some((handle, shutdown_tx))
    } else {
        info!("Scheduler disabled; use POST /batch/daily");
        None
    };

    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    // Run HTTP server with graceful shutdown
    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    // Signal scheduler to stop between units of work
    if let Some((handle, shutdown_tx)) = scheduler_handle {
        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
    listener_handle.abort();

    // Print stats before exit
    if let Ok(stats) = db.stats() {
        info!(
            ledger_entries = stats.ledger_entries,
            active_purchases = stats.active_purchases,
            pending_commissions = stats.pending_commissions,
            "Final ledger stats"
        );
    }

    Ok(())
}
