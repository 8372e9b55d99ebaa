//! WebSocket endpoints.
//!
//! Both validate `?token=<api_key>` and the `Origin` allow-list before the
//! upgrade completes; failures get `403 Forbidden` without upgrading.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{field, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{constant_time_eq, origin_allowed};
use crate::runner;
use crate::session::{self, SessionContext};
use crate::transport::{Transport, WsTransport};
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: String,
}

fn reject_upgrade(state: &AppState, query: &WsQuery, headers: &HeaderMap) -> Option<Response> {
    if !origin_allowed(headers, &state.config.server.allowed_origins) {
        warn!(origin = ?headers.get("origin"), "Rejected upgrade from disallowed origin");
        return Some((StatusCode::FORBIDDEN, "Forbidden").into_response());
    }
    if !constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes()) {
        return Some((StatusCode::FORBIDDEN, "Forbidden").into_response());
    }
    None
}

/// `GET /admin/run-operation?token=<key>`: claim and run a registered operation.
pub async fn run_operation(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(rejection) = reject_upgrade(&state, &query, &headers) {
        return rejection;
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("operation_run", id = %Uuid::new_v4(), hash = field::Empty);
        async move {
            let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));
            runner::run_claimed_operation(
                &state.registry,
                Arc::clone(&state.executor),
                transport,
                state.config.operations.run_timeout(),
            )
            .await;
        }
        .instrument(span)
    })
}

/// `GET /session/start?token=<key>`: drive one private session.
pub async fn start_session(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(rejection) = reject_upgrade(&state, &query, &headers) {
        return rejection;
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("private_session", id = %Uuid::new_v4(), instance = field::Empty);
        async move {
            let ctx = SessionContext {
                executor: Arc::clone(&state.executor),
                operations: state.operations.current().await,
                settings: Arc::clone(&state.session_settings),
            };
            let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));
            session::run_private_session(ctx, transport).await;
        }
        .instrument(span)
    })
}
