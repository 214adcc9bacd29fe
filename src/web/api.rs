//! Defines the Axum API routes and handlers.

use crate::printer::{ControllerError, PrinterController};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use croma_shared::api_models::{GcodeCommandRequest, StartJobResponse};
use croma_shared::print_job::FileId;
use std::sync::Arc;

pub type AppState = Arc<PrinterController>;

/// Helper to create a JSON error response with a message, a stable kind and a status code
fn json_error(message: &str, kind: &str, status: StatusCode) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message, "kind": kind }))).into_response()
}

fn status_for(error: &ControllerError) -> StatusCode {
    match error.kind() {
        "link_unavailable" | "permission_denied" | "link_busy" | "link_error" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "file_not_found" | "source_missing" => StatusCode::NOT_FOUND,
        "no_active_job" | "invalid_transition" => StatusCode::CONFLICT,
        "empty_command" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn controller_error(error: ControllerError) -> axum::response::Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::warn!(error = %error, kind = error.kind(), "API request failed");
    }
    json_error(&error.to_string(), error.kind(), status)
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(controller: AppState) -> Router {
    Router::new()
        .route("/api/v1/printer/connect", post(connect_handler))
        .route("/api/v1/printer/disconnect", post(disconnect_handler))
        .route("/api/v1/printer/status", get(get_status))
        .route("/api/v1/printer/gcode", post(execute_gcode))
        .route("/api/v1/printer/pause", post(pause_handler))
        .route("/api/v1/printer/resume", post(resume_handler))
        .route("/api/v1/printer/stop", post(stop_handler))
        .route("/api/v1/files", get(list_files))
        .route("/api/v1/files/{id}/print", post(start_job))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/filament", get(filament_status))
        .with_state(controller)
}

/// For tests: the router over an already assembled controller.
pub fn app_with_state(state: AppState) -> Router {
    create_router(state)
}

async fn connect_handler(State(controller): State<AppState>) -> axum::response::Response {
    match controller.connect().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "connected": true }))).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn disconnect_handler(State(controller): State<AppState>) -> axum::response::Response {
    controller.disconnect().await;
    (StatusCode::OK, Json(serde_json::json!({ "connected": false }))).into_response()
}

/// Handler to get the current status of the printer.
async fn get_status(State(controller): State<AppState>) -> axum::response::Response {
    (StatusCode::OK, Json(controller.get_status().await)).into_response()
}

/// Handler to execute a single G-code command.
async fn execute_gcode(
    State(controller): State<AppState>,
    Json(payload): Json<GcodeCommandRequest>,
) -> axum::response::Response {
    match controller.send_raw(&payload.command).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn pause_handler(State(controller): State<AppState>) -> axum::response::Response {
    match controller.pause().await {
        Ok(target) => (StatusCode::OK, Json(target)).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn resume_handler(State(controller): State<AppState>) -> axum::response::Response {
    match controller.resume().await {
        Ok(target) => (StatusCode::OK, Json(target)).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn stop_handler(State(controller): State<AppState>) -> axum::response::Response {
    match controller.stop().await {
        Ok(target) => (StatusCode::OK, Json(target)).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn list_files(State(controller): State<AppState>) -> axum::response::Response {
    (StatusCode::OK, Json(controller.files())).into_response()
}

async fn start_job(State(controller): State<AppState>, Path(file_id): Path<FileId>) -> axum::response::Response {
    match controller.start_job(file_id).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(StartJobResponse { job_id })).into_response(),
        Err(e) => controller_error(e),
    }
}

async fn list_jobs(State(controller): State<AppState>) -> axum::response::Response {
    (StatusCode::OK, Json(controller.list_jobs())).into_response()
}

async fn filament_status(State(controller): State<AppState>) -> axum::response::Response {
    (StatusCode::OK, Json(controller.check_filament().await)).into_response()
}
