//! Operator HTTP API: start/stop/release charging sessions and inspect
//! live/completed sessions and connector status.
//!
//! Plain `axum` router. Each route's success body is the flat, literal
//! shape the operator-facing contract documents (`{ok, message}`,
//! `{ok, transactionId, message}`, `{sessions: [...]}`, `{connectors: [...]}`)
//! rather than a generic wrapper — `X-API-Key` middleware guards the
//! mutating routes only.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::OperatorFacade;
use crate::error::AppError;

#[derive(Clone)]
struct ApiState {
    facade: Arc<OperatorFacade>,
}

pub fn router(facade: Arc<OperatorFacade>) -> Router {
    let state = ApiState { facade };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mutating = Router::new()
        .route("/api/v1/start", post(start))
        .route("/api/v1/stop", post(stop))
        .route("/charge/stop", post(stop_by_connector))
        .route("/api/v1/release", post(release))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/active", get(active))
        .route("/api/v1/history", get(history))
        .route("/api/v1/status", get(status))
        .merge(mutating)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn require_api_key(State(state): State<ApiState>, headers: HeaderMap, request: Request, next: Next) -> Response {
    let Some(expected) = state.facade.config().api_key.as_deref() else {
        return next.run(request).await;
    };
    let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false, "error": "invalid api key"}))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    time: DateTime<Utc>,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        time: Utc::now(),
    })
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    ok: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    ok: bool,
    #[serde(rename = "transactionId")]
    transaction_id: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SessionsResponse<T> {
    sessions: Vec<T>,
}

#[derive(Debug, Serialize)]
struct ConnectorsResponse<T> {
    connectors: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    cpid: String,
    connector_id: u32,
    id_tag: Option<String>,
}

async fn start(State(state): State<ApiState>, Json(req): Json<StartRequest>) -> Result<impl IntoResponse, AppError> {
    state.facade.start(&req.cpid, req.connector_id, req.id_tag).await?;
    Ok(Json(MessageResponse {
        ok: true,
        message: format!("remote start accepted for {} connector {}", req.cpid, req.connector_id),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    cpid: String,
    transaction_id: Option<i64>,
    connector_id: Option<u32>,
}

async fn stop(State(state): State<ApiState>, Json(req): Json<StopRequest>) -> Result<impl IntoResponse, AppError> {
    let transaction_id = state
        .facade
        .stop(&req.cpid, req.transaction_id, req.connector_id)
        .await?;
    Ok(Json(StopResponse {
        ok: true,
        transaction_id,
        message: "remote stop accepted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopByConnectorRequest {
    cpid: String,
    connector_id: u32,
}

async fn stop_by_connector(
    State(state): State<ApiState>,
    Json(req): Json<StopByConnectorRequest>,
) -> Result<impl IntoResponse, AppError> {
    let transaction_id = state
        .facade
        .stop(&req.cpid, None, Some(req.connector_id))
        .await?;
    Ok(Json(StopResponse {
        ok: true,
        transaction_id,
        message: "remote stop accepted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    cpid: String,
    connector_id: u32,
}

async fn release(State(state): State<ApiState>, Json(req): Json<ReleaseRequest>) -> Result<impl IntoResponse, AppError> {
    state.facade.release(&req.cpid, req.connector_id).await?;
    Ok(Json(MessageResponse {
        ok: true,
        message: format!("connector {} released", req.connector_id),
    }))
}

async fn active(State(state): State<ApiState>) -> impl IntoResponse {
    Json(SessionsResponse {
        sessions: state.facade.list_active().await,
    })
}

async fn history(State(state): State<ApiState>) -> impl IntoResponse {
    Json(SessionsResponse {
        sessions: state.facade.list_completed().await,
    })
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(ConnectorsResponse {
        connectors: state.facade.list_status().await,
    })
}
