//! Operator-facing HTTP surface.
//!
//! A small axum server exposing liveness, the full agent status (service
//! states, session snapshot, store and upload counters) and the remote
//! operator's controls: session start/heartbeat/stop and the checkout
//! trigger. This is the boundary the external init system and operator
//! dashboard talk to; rendering is theirs.

use crate::config::ApiConfig;
use crate::orchestrator::{ServiceOrchestrator, ServiceState};
use crate::session::{Session, SessionError, SessionManager, SessionSnapshot};
use anyhow::{Context, Result};
use argus_platform::checkout::{BatchUploadCoordinator, CheckoutError, CheckoutStats};
use argus_platform::status_sync::{PlatformStatusSync, SyncStats};
use argus_platform::store::{LocalResultStore, StoreStats};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ServiceOrchestrator>,
    pub sessions: SessionManager,
    pub coordinator: Arc<BatchUploadCoordinator>,
    pub store: Arc<LocalResultStore>,
    pub sync: Arc<PlatformStatusSync>,
}

/// Full agent status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub services: HashMap<String, ServiceState>,
    pub session: SessionSnapshot,
    pub store: StoreStats,
    pub uploads: CheckoutStats,
    pub sync: SyncStats,
    pub active_endpoint: String,
    pub config_stale: bool,
}

/// Session start request
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub operator_id: String,
}

/// Heartbeat response
#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// New expiry, absent when no session is open.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Stop response
#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    /// The closed session, absent when nothing was open.
    pub closed: Option<Session>,
}

/// Checkout request
#[derive(Debug, Deserialize, Default)]
pub struct CheckoutRequest {
    /// Reserve a single result instead of everything pending.
    pub result_id: Option<Uuid>,
}

/// Checkout response
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub batch_id: Uuid,
    pub committed: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Build the operator API router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/sessions", post(start_session))
        .route("/sessions/heartbeat", post(heartbeat))
        .route("/sessions/current", delete(stop_session))
        .route("/checkout", post(checkout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the operator API until the process exits.
pub async fn serve(state: ApiState, config: &ApiConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind operator API to {}", addr))?;

    info!(addr = %addr, "Operator API listening");
    axum::serve(listener, router(state))
        .await
        .context("Operator API server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let session = match state.sessions.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    };

    Json(StatusResponse {
        services: state.orchestrator.status(),
        session,
        store: state.store.stats(),
        uploads: state.coordinator.stats(),
        sync: state.sync.stats(),
        active_endpoint: state.sync.active_endpoint().name,
        config_stale: state.sync.config_is_stale(),
    })
    .into_response()
}

async fn start_session(
    State(state): State<ApiState>,
    Json(request): Json<StartSessionRequest>,
) -> impl IntoResponse {
    match state.sessions.start(request.operator_id).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e @ SessionError::Conflict) => {
            error_response(StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e @ SessionError::Hardware(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn heartbeat(State(state): State<ApiState>) -> impl IntoResponse {
    match state.sessions.heartbeat().await {
        Ok(expires_at) => Json(HeartbeatResponse { expires_at }).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn stop_session(State(state): State<ApiState>) -> impl IntoResponse {
    match state.sessions.stop().await {
        Ok(closed) => Json(StopSessionResponse { closed }).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn checkout(
    State(state): State<ApiState>,
    request: Option<Json<CheckoutRequest>>,
) -> impl IntoResponse {
    let request = request.map(|Json(r)| r).unwrap_or_default();

    let outcome = match request.result_id {
        Some(result_id) => match state.coordinator.checkout_single(result_id) {
            Ok(batch) => state.coordinator.commit(batch.id).await,
            Err(e) => Err(e),
        },
        None => state.coordinator.checkout_and_commit_all().await,
    };

    match outcome {
        Ok(ack) => Json(CheckoutResponse {
            batch_id: ack.batch_id,
            committed: ack.accepted,
        })
        .into_response(),
        Err(e @ CheckoutError::NothingPending) => {
            error_response(StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e @ (CheckoutError::Conflict(_) | CheckoutError::CommitInFlight(_))) => {
            error_response(StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e @ CheckoutError::UploadFailed { .. }) => {
            error_response(StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
