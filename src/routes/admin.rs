//! Authenticated admin endpoints.
//!
//! - `GET /admin/get-config`: reload and return the operation catalogue
//! - `POST /admin/get-project`: discover or validate the cloud project
//! - `POST /admin/operation-to-run`: fill and register an operation
//! - `POST /admin/instance-operation-to-run`: fill and register an instance operation
//!
//! Registered operations are run by claiming their hash on
//! `/admin/run-operation`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::instance::TargetInstance;
use crate::operations::fill::project_confirmed;
use crate::operations::{FilledOperation, OperationError, OperationsConfig};
use crate::shell::ExecError;
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

fn operation_error(e: &OperationError) -> ApiError {
    let status = match e {
        OperationError::ConfigNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
        OperationError::OperationNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    api_error(status, e.to_string())
}

async fn current_config(state: &AppState) -> Result<Arc<OperationsConfig>, ApiError> {
    state
        .operations
        .current()
        .await
        .ok_or_else(|| operation_error(&OperationError::ConfigNotLoaded))
}

/// `GET /admin/get-config`
///
/// Reloads the catalogue from disk first. A file that fails validation is
/// reported and the previous catalogue stays active.
pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let path = Path::new(&state.config.operations.path);
    let config = state.operations.reload(path).await.map_err(|e| {
        warn!(path = %path.display(), error = %e, "Operations config reload failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    info!(
        operations = config.operations.len(),
        instance_operations = config.instance_operations.len(),
        "Operations config reloaded"
    );
    serde_json::to_value(&*config)
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    /// Values for common parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Validate this project instead of discovering one.
    #[serde(default)]
    pub project: Option<String>,
}

/// `POST /admin/get-project`
///
/// Without `project`, runs the discovery template and returns the project it
/// reports. With `project`, runs the validation template and succeeds only if
/// its output mentions that project; with no validation template configured
/// the project is accepted as given.
pub async fn get_project(
    State(state): State<AppState>,
    Json(payload): Json<ProjectRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = current_config(&state).await?;
    let timeout = state.config.operations.project_timeout();

    if let Some(project) = payload.project.filter(|p| !p.is_empty()) {
        let Some(filled) = config.fill_validate_project_operation(&payload.params) else {
            return Ok(Json(json!({"project": project})));
        };
        let command = filled.map_err(|e| operation_error(&e))?;
        let output = run_project_command(&state, &command, timeout).await?;
        if !project_confirmed(&output, &project) {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("Project {project} could not be validated"),
            ));
        }
        return Ok(Json(json!({"project": project})));
    }

    let command = config
        .fill_project_operation(&payload.params)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No project operation configured"))?
        .map_err(|e| operation_error(&e))?;
    let output = run_project_command(&state, &command, timeout).await?;
    Ok(Json(json!({"project": config.extract_project(&output)})))
}

async fn run_project_command(
    state: &AppState,
    command: &str,
    timeout: Duration,
) -> Result<String, ApiError> {
    state
        .executor
        .run_with_deadline(command, timeout)
        .await
        .map_err(|failure| {
            warn!(error = %failure, "Project command failed");
            let status = if failure.error == ExecError::Timeout {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            (
                status,
                Json(json!({
                    "error": format!("Project command failed: {}", failure.error),
                    "output": failure.output,
                })),
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct OperationRequest {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// `POST /admin/operation-to-run`
pub async fn operation_to_run(
    State(state): State<AppState>,
    Json(payload): Json<OperationRequest>,
) -> Result<Json<FilledOperation>, ApiError> {
    let config = current_config(&state).await?;
    let filled = config
        .fill_operation(&payload.name, &payload.params)
        .map_err(|e| {
            info!(operation = %payload.name, error = %e, "Operation not filled");
            operation_error(&e)
        })?;
    info!(operation = %payload.name, hash = %filled.hash, "Operation registered");
    state.registry.register(filled.clone()).await;
    Ok(Json(filled))
}

#[derive(Debug, Deserialize)]
pub struct InstanceOperationRequest {
    pub name: String,
    pub instance: TargetInstance,
}

/// `POST /admin/instance-operation-to-run`
pub async fn instance_operation_to_run(
    State(state): State<AppState>,
    Json(payload): Json<InstanceOperationRequest>,
) -> Result<Json<FilledOperation>, ApiError> {
    let config = current_config(&state).await?;
    let filled = config
        .fill_instance_operation(&payload.name, &payload.instance)
        .map_err(|e| {
            info!(operation = %payload.name, error = %e, "Instance operation not filled");
            operation_error(&e)
        })?;
    info!(
        operation = %payload.name,
        instance = %payload.instance.name,
        hash = %filled.hash,
        "Instance operation registered"
    );
    state.registry.register(filled.clone()).await;
    Ok(Json(filled))
}
