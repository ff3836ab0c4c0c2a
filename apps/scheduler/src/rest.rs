//! Thin REST surface over the run registry.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use lattice_core::RunStatus;
use lattice_dispatch::Dispatcher;
use lattice_engine::{RunRegistry, StartRunRequest};
use lattice_protocol::{Envelope, Role, Sender, envelope::types};
use lattice_session::WorkerGateway;
use serde::Deserialize;
use uuid::Uuid;

/// Shared state for the REST handlers.
#[derive(Clone)]
pub struct RestState {
    /// The run registry.
    pub registry: Arc<RunRegistry>,
    /// The dispatcher fed by run submissions.
    pub dispatcher: Arc<Dispatcher>,
    /// Gateway used to notify workers about cancellations.
    pub gateway: WorkerGateway,
    /// Tenant stamped onto submitted runs.
    pub tenant: String,
}

/// Build the REST router.
pub fn router(state: RestState) -> Router {
    Router::new()
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/definition", get(get_definition))
        .route("/runs/{id}/cancel", post(cancel_run))
        .with_state(state)
}

async fn start_run(
    State(state): State<RestState>,
    Json(request): Json<StartRunRequest>,
) -> Response {
    let run_id = Uuid::new_v4().to_string();
    let summary = state
        .registry
        .create_run(&run_id, request, &state.tenant)
        .await;
    let ready = state.registry.collect_ready(Some(&run_id)).await;
    state.dispatcher.enqueue(ready);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "runId": summary.run_id,
            "status": summary.status,
            "definitionHash": summary.definition_hash,
            "clientId": summary.client_id,
            "createdAt": summary.created_at,
        })),
    )
        .into_response()
}

async fn get_run(State(state): State<RestState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(error) => {
            tracing::debug!(run = %id, %error, "run lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn get_definition(State(state): State<RestState>, Path(id): Path<String>) -> Response {
    match state.registry.workflow_with_state(&id).await {
        Ok(definition) => Json(definition).into_response(),
        Err(error) => {
            tracing::debug!(run = %id, %error, "definition lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn cancel_run(State(state): State<RestState>, Path(id): Path<String>) -> Response {
    let (summary, cancelled_next) = match state.registry.cancel_run(&id).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::debug!(run = %id, %error, "cancel failed");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    state.dispatcher.cancel_run(&id);
    // Workers still blocked in next() learn the run is gone.
    for (worker_ref, payload) in cancelled_next {
        let envelope = Envelope::new(
            types::BIZ_EXEC_NEXT_RESPONSE,
            state.tenant.clone(),
            Sender {
                role: Role::Scheduler,
                id: state.gateway.scheduler_id().to_owned(),
            },
        )
        .with_corr(payload.request_id.clone());
        if let Ok(envelope) = envelope.with_payload(&payload) {
            if let Err(error) = state.gateway.send_envelope(&worker_ref, envelope).await {
                tracing::warn!(worker = %worker_ref, %error, "failed to notify next_cancelled");
            }
        }
    }
    Json(summary).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
    cursor: Option<String>,
    status: Option<RunStatus>,
    client_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn list_runs(State(state): State<RestState>, Query(params): Query<ListParams>) -> Response {
    let page = state
        .registry
        .list(
            params.limit.clamp(1, 200),
            params.cursor.as_deref(),
            params.status,
            params.client_id.as_deref(),
        )
        .await;
    Json(page).into_response()
}
