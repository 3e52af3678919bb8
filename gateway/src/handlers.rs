//! `axum` handlers translating HTTP into orchestrator calls (spec §4.9).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::domain::{RawVerifyRequest, VerifyResponse};
use crate::state::AppState;

/// Validate the body against the required-field schema (spec §6 ingress
/// contract) before the orchestrator ever sees it. A body that doesn't
/// deserialize into `RawVerifyRequest` — missing `request_id`/`tool`/`mode`/
/// `role`/`subject`/`context`, or the wrong JSON type for one of them — is
/// schema-invalid and gets 400, never the orchestrator's DENY path. An
/// unrecognized *value* for `tool`/`mode`/`role` (a well-typed string the
/// rules layer doesn't know) is not a schema error and still reaches the
/// orchestrator as a typed violation.
pub async fn verify(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let raw: RawVerifyRequest = match serde_json::from_value(body.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "schema_invalid", "detail": e.to_string()})),
            )
                .into_response();
        }
    };
    let response: VerifyResponse = state.orchestrator.verify(raw, body).await;
    (StatusCode::OK, Json(response)).into_response()
}

pub async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    let db = tokio::time::timeout(
        state.healthcheck_timeout,
        sqlx::query("SELECT 1").execute(&state.db_pool),
    )
    .await;
    let kv = tokio::time::timeout(state.healthcheck_timeout, state.kv.ping()).await;
    let policy = tokio::time::timeout(state.healthcheck_timeout, state.policy.ping()).await;

    let mut failing = Vec::new();
    if !matches!(db, Ok(Ok(_))) {
        failing.push("postgres");
    }
    if !matches!(kv, Ok(Ok(_))) {
        failing.push("redis");
    }
    if !matches!(policy, Ok(Ok(_))) {
        failing.push("policy_engine");
    }

    if failing.is_empty() {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "failing": failing})),
        )
            .into_response()
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}
