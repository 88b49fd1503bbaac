//! ==============================================================================
//! api.rs - read-only json api over the latest snapshot
//! ==============================================================================
//!
//! routes:
//!     GET /api/sensors        every sensor in the latest snapshot
//!     GET /api/sensors/:id    one sensor, 404 if the hub has not heard of it
//!     GET /api/health         liveness plus sensor count
//!
//! handlers never touch the store. they read whatever the snapshot accessor
//! last published, so a slow http client cannot hold a store lock.
//!
//! ==============================================================================

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::snapshot::{SensorView, Snapshot, SnapshotReader};

pub fn router(reader: SnapshotReader) -> Router {
    Router::new()
        .route("/api/sensors", get(sensors_handler))
        .route("/api/sensors/:id", get(sensor_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(reader)
}

/// Serve the api until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    reader: SnapshotReader,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(reader))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn sensors_handler(State(reader): State<SnapshotReader>) -> Json<Snapshot> {
    Json(reader.latest().as_ref().clone())
}

async fn sensor_handler(
    State(reader): State<SnapshotReader>,
    Path(id): Path<String>,
) -> Result<Json<SensorView>, StatusCode> {
    reader
        .latest()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn health_handler(State(reader): State<SnapshotReader>) -> Json<serde_json::Value> {
    let snapshot = reader.latest();
    Json(serde_json::json!({
        "status": "ok",
        "sensors": snapshot.sensors.len(),
        "taken_at": snapshot.taken_at,
    }))
}
