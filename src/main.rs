//! ==============================================================================
//! main.rs - telemetry hub entry point
//! ==============================================================================
//!
//! purpose:
//!     the hub that remote sensor nodes report to. it accepts cpu/disk
//!     readings, keeps a rolling window and health status per sensor, and
//!     publishes read-only snapshots for a dashboard.
//!
//! responsibilities:
//!     - load hub.toml (or defaults) and set up logging
//!     - bind the ingestion endpoint (failure aborts startup)
//!     - run the snapshot accessor on its own timer
//!     - serve the read-only json api
//!     - shut everything down in order on ctrl-c
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    telemetry hub (this file)                │
//!     │  ┌─────────────┐  ┌─────────────────┐  ┌────────────────┐   │
//!     │  │ listener    │  │ snapshot timer  │  │ json api       │   │
//!     │  │ (port 5555) │  │ (1s cycle)      │  │ (port 8050)    │   │
//!     │  └──────┬──────┘  └────────┬────────┘  └───────┬────────┘   │
//!     │         │ writes           │ reads             │ watch      │
//!     │         └──────────┬───────┘                   │            │
//!     │              ┌─────┴─────┐     publishes       │            │
//!     │              │   store   │ ───────────────────>┘            │
//!     │              └───────────┘                                  │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! shutdown order:
//!     endpoint closes -> in-flight requests finish -> queue drains ->
//!     snapshot timer stops -> api stops
//!
//! ==============================================================================

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use telemetry_hub::config::HubConfig;
use telemetry_hub::snapshot::{self, LogSink, SnapshotAccessor};
use telemetry_hub::{api, Evaluator, Listener, SensorStore};

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Telemetry Hub");
    println!("  cpu/disk ingestion with rolling windows");
    println!("===========================================================");

    // step 1: load configuration
    let (config, source) = HubConfig::load_or_default();

    // step 2: logging (RUST_LOG wins over the config file)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    config.log_summary(&source);

    // step 3: shared state
    let store = SensorStore::new(config.store.window_capacity);
    let evaluator = Evaluator::new(store.clone(), config.alert_policy());

    // step 4: bind the ingestion endpoint
    let listener = match Listener::bind(config.ingest.clone(), evaluator).await {
        Ok(listener) => {
            tracing::info!(address = %config.ingest.bind_address, "ingestion endpoint listening");
            listener
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal: cannot bind ingestion endpoint");
            return Err(e.into());
        }
    };

    // step 5: snapshot accessor on its own timer
    let (watch_sink, reader) = snapshot::watch_channel();
    let mut accessor =
        SnapshotAccessor::new(store.clone(), config.snapshot.interval()).with_sink(watch_sink);
    if config.snapshot.log_summary {
        accessor = accessor.with_sink(LogSink);
    }
    let snapshot_stop = CancellationToken::new();
    let snapshots = tokio::spawn(accessor.run(snapshot_stop.clone()));

    // step 6: json api in background
    let api_stop = CancellationToken::new();
    let api_task = if config.api.enabled {
        match tokio::net::TcpListener::bind(&config.api.bind_address).await {
            Ok(api_listener) => {
                tracing::info!(address = %config.api.bind_address, "snapshot api live");
                let stop = api_stop.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = api::serve(api_listener, reader, stop).await {
                        tracing::error!(error = %e, "snapshot api error");
                    }
                }))
            }
            Err(e) => {
                tracing::error!(address = %config.api.bind_address, error = %e, "snapshot api disabled: bind failed");
                None
            }
        }
    } else {
        None
    };

    // step 7: ctrl-c closes the endpoint
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    // step 8: ingestion runs in the foreground until shutdown
    let result = listener.run(shutdown).await;

    snapshot_stop.cancel();
    snapshots.await.ok();
    api_stop.cancel();
    if let Some(task) = api_task {
        task.await.ok();
    }

    match result {
        Ok(()) => {
            tracing::info!("hub stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "hub stopped on fatal error");
            Err(e.into())
        }
    }
}
