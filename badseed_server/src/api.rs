use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use badseed_core::{
    candles::{CandleReply, CandleService},
    error::CoreError,
    query::QueryService,
    webhook::{is_authorized, parse_batch, InflowFilter},
    ReconcilerHandle, Settings,
};
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Prefix the frontend uses for serverless-style function paths.
pub const FUNCTIONS_PREFIX: &str = "/.netlify/functions";

#[derive(Clone)]
pub struct ApiState {
    pub settings: Arc<Settings>,
    pub reconciler: ReconcilerHandle,
    pub query: Arc<QueryService>,
    pub candles: Arc<CandleService>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimsParams {
    limit: Option<String>,
}

fn routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/summary", get(summary_handler))
        .route("/metrics", get(metrics_handler))
        .route("/claims", get(claims_handler))
        .route("/bitquery-poller", get(candles_handler))
        .route("/amm-poller", post(poll_handler))
        .route("/fee-worker", post(sweep_handler))
        .route("/webhook-helius", any(webhook_handler))
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(routes())
        .nest(FUNCTIONS_PREFIX, routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn summary_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.query.summary().await)
}

/// Lenient numeric query parameter; anything unparseable means "use the default".
fn number_param<T: std::str::FromStr>(raw: &Option<String>) -> Option<T> {
    raw.as_deref().and_then(|v| v.trim().parse::<T>().ok())
}

async fn metrics_handler(
    State(state): State<ApiState>,
    Query(params): Query<MetricsParams>,
) -> impl IntoResponse {
    let from = number_param::<i64>(&params.from);
    let to = number_param::<i64>(&params.to);
    Json(state.query.metrics(from, to).await)
}

async fn claims_handler(
    State(state): State<ApiState>,
    Query(params): Query<ClaimsParams>,
) -> impl IntoResponse {
    let limit = number_param::<usize>(&params.limit).filter(|l| *l > 0);
    Json(state.query.claims(limit).await)
}

async fn candles_handler(State(state): State<ApiState>) -> Response {
    match state.candles.chart().await {
        CandleReply::Chart(body) => Json(body).into_response(),
        CandleReply::ConfigurationError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Configuration Error" })),
        )
            .into_response(),
        CandleReply::UpstreamError(message) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
        }
    }
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    is_authorized(header, state.settings.webhook_secret())
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// `{ok: true, ...outcome}` on success, `{ok: false, error}` otherwise.
fn outcome_json<T: Serialize>(result: Result<T, CoreError>) -> Json<Value> {
    match result.and_then(|out| serde_json::to_value(out).map_err(CoreError::from)) {
        Ok(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("ok".to_string(), json!(true));
            }
            Json(value)
        }
        Err(e) => {
            error!("Run failed: {}", e);
            Json(json!({ "ok": false, "error": e.to_string() }))
        }
    }
}

async fn poll_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        warn!("Unauthorized poll trigger blocked");
        return unauthorized();
    }
    outcome_json(state.reconciler.poll().await).into_response()
}

async fn sweep_handler(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        warn!("Unauthorized sweep trigger blocked");
        return unauthorized();
    }
    outcome_json(state.reconciler.sweep().await).into_response()
}

async fn webhook_handler(
    State(state): State<ApiState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        warn!("Unauthorized webhook attempt blocked");
        return unauthorized();
    }
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    let filter = InflowFilter::from_settings(&state.settings);
    let batch = match parse_batch(&body, &filter) {
        Ok(batch) => batch,
        Err(e) => {
            warn!("Unreadable webhook body: {}", e);
            return Json(json!({ "ok": false, "detected": 0 })).into_response();
        }
    };
    info!("Webhook delivery: {} candidate transfers", batch.transfers.len());
    match state.reconciler.ingest(batch).await {
        Ok(out) => Json(json!({ "ok": true, "detected": out.detected_sol })).into_response(),
        Err(e) => {
            error!("Webhook processing failed: {}", e);
            Json(json!({ "ok": false, "detected": 0 })).into_response()
        }
    }
}
