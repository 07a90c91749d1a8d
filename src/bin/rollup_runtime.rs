//! Rollup Runtime - periodic stale marker processing
//!
//! This binary keeps aggregates and audit rows current:
//! - Opens the SQLite store (schema is created idempotently)
//! - Optionally starts the SolarFlux publisher
//! - Runs a level-ordered scheduler cycle every interval
//!
//! Usage:
//!   cargo run --release --bin rollup_runtime
//!
//! Environment variables:
//!   ROLLUP_DB_PATH - SQLite database path (default: /var/lib/datum-rollup/rollup.db)
//!   STALE_PARALLELISM - Workers per run (default: 1)
//!   STALE_MAX_ITERATIONS - Markers per worker per run (default: 1000)
//!   STALE_TIMEOUT_SECS - Wall-clock limit per run (default: 300)
//!   STALE_KINDS - Kind filter (default: all)
//!   STALE_INTERVAL_MS - Cycle interval (default: 60000)
//!   ENABLE_FLUX - Publish fresh rows (default: false)

use datum_rollup::pipeline::{
    config::EngineConfig,
    coordinator::TaskCoordinator,
    db::StaleStore,
    engine::StaleEngine,
    flux::{flux_channel, flux_publisher_task, LogFluxPublisher},
    scheduler::scheduler_task,
};
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const FLUX_USAGE_FLUSH: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Rollup Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Workers: {}", config.parallelism);
    info!("   ├─ Budget: {} markers/worker", config.max_iterations);
    info!("   ├─ Run timeout: {:?}", config.timeout);
    info!("   ├─ Interval: {}ms", config.interval_ms);
    info!("   └─ SolarFlux: {}", if config.flux_enabled { "enabled" } else { "disabled" });

    info!("🔧 Initializing database...");
    let store = StaleStore::open(&config.db_path, config.busy_timeout())?;
    info!("✅ Database initialized");

    let (flux, publisher_handle) = if config.flux_enabled {
        let (sender, rx) = flux_channel(config.flux_channel_buffer);
        let usage_writer = store.datum_writer()?;
        let handle = tokio::spawn(async move {
            flux_publisher_task(rx, LogFluxPublisher::new(), Some(usage_writer), FLUX_USAGE_FLUSH).await
        });
        info!("   ├─ ✅ SolarFlux publisher spawned");
        (Some(sender), Some(handle))
    } else {
        (None, None)
    };

    let coordinator = Arc::new(TaskCoordinator::new(Arc::new(StaleEngine::new(store, flux))));
    let shutdown = Arc::new(Notify::new());

    let mut scheduler_handle = {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = Arc::clone(&shutdown);
        let kinds = config.kinds.clone();
        let options = config.run_options();
        let interval_ms = config.interval_ms;
        tokio::spawn(async move {
            if let Err(e) = scheduler_task(coordinator, kinds, options, interval_ms, shutdown).await {
                error!("❌ Scheduler stopped: {}", e);
            }
        })
    };
    info!("   └─ ✅ Scheduler spawned");

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // An in-flight cycle gets a grace period; abandoned transactions roll back as a unit
    shutdown.notify_one();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut scheduler_handle).await {
        Ok(Ok(())) => info!("   ├─ Scheduler stopped"),
        Ok(Err(e)) => error!("❌ Scheduler task failed: {}", e),
        Err(_) => {
            info!("   ├─ Scheduler still busy after {:?}, aborting", SHUTDOWN_GRACE);
            scheduler_handle.abort();
        }
    }

    // Last sender lives in the engine; dropping it closes the flux channel
    drop(coordinator);
    if let Some(handle) = publisher_handle {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(publisher)) => info!("   └─ {} updates published", publisher.published()),
            Ok(Err(e)) => error!("❌ SolarFlux publisher failed: {}", e),
            Err(_) => info!("   └─ SolarFlux publisher did not drain in time"),
        }
    }

    info!("✅ Rollup runtime stopped");
    Ok(())
}
