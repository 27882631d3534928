//! Read-only HTTP status server: Prometheus scrape plus execution lookup.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::ServiceBuffer;
use crate::error::StoreError;
use crate::models::ExecutionState;
use crate::store::ExecutionStore;

#[derive(Clone)]
pub struct StatusState {
    pub node_id: String,
    pub store: Arc<dyn ExecutionStore>,
    pub buffer: ServiceBuffer,
    pub registry: Registry,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct CountsResponse {
    node_id: String,
    states: BTreeMap<String, u64>,
    running: Vec<String>,
    enqueued: Vec<String>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/counts", get(counts_handler))
        .route("/api/executions/:id", get(execution_handler))
        .route("/api/executions/:id/history", get(history_handler))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled. Bind and serve errors are logged.
pub async fn run_status_server(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "Status server failed");
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    let status = match err {
        StoreError::ExecutionNotFound(_) | StoreError::ExecutionHistoryNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

async fn metrics_handler(State(state): State<StatusState>) -> Response {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buf) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}

async fn counts_handler(State(state): State<StatusState>) -> Response {
    let mut states = BTreeMap::new();
    for s in ExecutionState::ALL {
        if s == ExecutionState::Undefined {
            continue;
        }
        match state.store.get_execution_count(s) {
            Ok(count) => {
                states.insert(s.to_string(), count);
            }
            Err(e) => return store_error_response(e),
        }
    }

    Json(CountsResponse {
        node_id: state.node_id.clone(),
        states,
        running: state.buffer.running_executions(),
        enqueued: state.buffer.enqueued_executions(),
    })
    .into_response()
}

async fn execution_handler(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_execution(&id) {
        Ok(execution) => Json(execution).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn history_handler(State(state): State<StatusState>, Path(id): Path<String>) -> Response {
    match state.store.get_execution_history(&id) {
        Ok(history) => Json(history).into_response(),
        Err(e) => store_error_response(e),
    }
}
