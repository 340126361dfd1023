//! Admission HTTP server: a thin shell over the orchestrator.
//!
//! Endpoints: health, submit a repair session, read a session's
//! status. Overload maps to 503 so upstream sensors retry at their own
//! pace.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, RepairRequest};

/// Build the HTTP router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/repair/run", post(submit_handler))
        .route("/api/repair/status/{run_id}", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health_handler(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        active_sessions: orchestrator.active_sessions().await,
    })
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    group_id: String,
    workflow_run_id: u64,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn submit_handler(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<SubmitRequest>,
) -> impl IntoResponse {
    let result = orchestrator
        .submit(RepairRequest {
            group_id: request.group_id,
            workflow_run_id: request.workflow_run_id,
        })
        .await;

    match result {
        Ok(run_id) => (StatusCode::ACCEPTED, Json(SubmitResponse { run_id })).into_response(),
        Err(EngineError::Overloaded) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "admission queue saturated".to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    run_id: String,
    group_id: String,
    status: String,
    created_at: String,
    updated_at: String,
}

async fn status_handler(
    State(orchestrator): State<Orchestrator>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match orchestrator.status(&run_id).await {
        Ok(run) => (
            StatusCode::OK,
            Json(StatusResponse {
                run_id: run.id,
                group_id: run.group_id,
                status: run.status,
                created_at: run.created_at.to_rfc3339(),
                updated_at: run.updated_at.to_rfc3339(),
            }),
        )
            .into_response(),
        Err(EngineError::Store(medic_store::StoreError::NotFound { .. })) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no such run: {run_id}"),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}
