//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Reports uptime, whether an operation catalogue is loaded, and how many
/// registered operations are waiting or running.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let operations_loaded = state.operations.current().await.is_some();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "operations_loaded": operations_loaded,
        "registered_operations": state.registry.len().await,
    }))
}
