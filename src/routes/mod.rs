//! HTTP route handlers.
//!
//! [`health`] is public. The [`admin`] endpoints sit behind
//! [`crate::auth::require_api_key`]; the [`sockets`] endpoints check a
//! `?token=` query parameter before upgrading.

pub mod admin;
pub mod health;
pub mod sockets;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Build the full router for `state`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::health));

    let authed_routes = Router::new()
        .route("/admin/get-config", get(admin::get_config))
        .route("/admin/get-project", post(admin::get_project))
        .route("/admin/operation-to-run", post(admin::operation_to_run))
        .route(
            "/admin/instance-operation-to-run",
            post(admin::instance_operation_to_run),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/admin/run-operation", get(sockets::run_operation))
        .route("/session/start", get(sockets::start_session));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(cors(&state.config.server.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cross-origin access for the configured origins only.
fn cors(allowed: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
