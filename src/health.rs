//! Read-only HTTP surface: liveness, readiness, metrics, and an on-demand consistency
//! check, all served from the same [`AggregateStats`](crate::stats::AggregateStats)
//! and [`ReconcilerHandle`](crate::reconciler::ReconcilerHandle) the reconciler updates.

use crate::config::Config;
use crate::reconciler::ReconcilerHandle;
use crate::verify_service::VerifyTrigger;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct AppState {
    handle: ReconcilerHandle,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

#[derive(Debug, Serialize)]
struct ReadyBody {
    ready: bool,
    is_leader: bool,
    connected: bool,
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyBody>) {
    let is_leader = state.handle.is_leader();
    let connected = state.handle.is_connected();
    let ready = connected;
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(ReadyBody { ready, is_leader, connected }))
}

async fn metrics(State(state): State<AppState>) -> Json<crate::stats::StatsSnapshot> {
    Json(state.handle.snapshot())
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    schema: Option<String>,
    table: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum VerifyResponse {
    One(crate::stats::ConsistencyReport),
    Many(Vec<crate::stats::ConsistencyReport>),
}

async fn verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match (request.schema, request.table) {
        (Some(schema), Some(table)) => match state.handle.verify_trigger().verify_one(&schema, &table).await {
            Ok(report) => (StatusCode::OK, Json(serde_json::to_value(VerifyResponse::One(report)).unwrap())),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ),
        },
        (None, None) => match state.handle.verify_trigger().verify_all().await {
            Ok(reports) => (StatusCode::OK, Json(serde_json::to_value(VerifyResponse::Many(reports)).unwrap())),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ),
        },
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "must supply both schema and table, or neither" })),
        ),
    }
}

fn router(handle: ReconcilerHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/verify", post(verify))
        .with_state(AppState { handle })
}

/// Serves the health surface on `config.health_port` until `shutdown` fires.
pub async fn serve(config: Arc<Config>, handle: ReconcilerHandle, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health surface listening");

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
