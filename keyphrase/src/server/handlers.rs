//! HTTP route handlers for the keyphrase server.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::error::ApiError;
use crate::aggregation::TotalAggregator;
use crate::bootstrap::SnapshotDispatcher;
use crate::change::{BatchRequest, BatchResponse, ChangeRecord, ConnectionChangeRecord};
use crate::error::Error;
use crate::fanout::FanOut;
use crate::metrics::Metrics;
use crate::model::{Connection, OccurrencePayload, OccurrenceRecord, TotalRecord};
use crate::storage::KeyphraseStorage;
use crate::traits::{ConnectionRegistry, OccurrenceStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: KeyphraseStorage,
    pub totals: Arc<TotalAggregator>,
    pub fanout: Arc<FanOut>,
    pub bootstrap: Arc<SnapshotDispatcher>,
    pub metrics: Arc<Metrics>,
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(Error::InvalidInput(format!("invalid request body: {}", e))))
}

/// Handle POST /api/v1/totals/batch
pub async fn handle_totals_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BatchResponse>, ApiError> {
    let request: BatchRequest<ChangeRecord> = parse_json(&body)?;
    Ok(Json(state.totals.process_batch(&request.records).await))
}

/// Handle POST /api/v1/fanout/batch
pub async fn handle_fanout_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BatchResponse>, ApiError> {
    let request: BatchRequest<ChangeRecord> = parse_json(&body)?;
    Ok(Json(state.fanout.process_batch(&request.records).await))
}

/// Handle POST /api/v1/bootstrap/batch
pub async fn handle_bootstrap_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BatchResponse>, ApiError> {
    let request: BatchRequest<ConnectionChangeRecord> = parse_json(&body)?;
    Ok(Json(state.bootstrap.process_batch(&request.records).await))
}

/// Handle PUT /api/v1/occurrences
///
/// Writes page-level occurrence rows; aggregation and fan-out follow
/// through the change feed.
pub async fn handle_put_occurrences(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: BatchRequest<OccurrenceRecord> = parse_json(&body)?;
    state.storage.put_occurrences(&request.records).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "written": request.records.len()
    })))
}

/// Body of a subscribe request. The connection ID is generated when the
/// caller does not supply one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(rename = "connectionID", default)]
    pub connection_id: Option<String>,
    pub callback_endpoint: String,
    pub listening_key: String,
}

/// Handle POST /api/v1/connections
pub async fn handle_register_connection(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Connection>), ApiError> {
    let request: RegisterRequest = parse_json(&body)?;
    let connection = Connection {
        connection_id: request
            .connection_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        callback_endpoint: request.callback_endpoint,
        listening_key: request.listening_key,
    };
    state.storage.register(&connection).await?;
    tracing::debug!(
        connection_id = %connection.connection_id,
        listening_key = %connection.listening_key,
        "registered connection"
    );
    Ok((StatusCode::CREATED, Json(connection)))
}

/// Handle DELETE /api/v1/connections/{id}
pub async fn handle_deregister_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.storage.deregister(&connection_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// Handle GET /api/v1/sites/{site}
///
/// Returns the snapshot a new subscriber to `site` would receive.
pub async fn handle_site_snapshot(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<Vec<OccurrencePayload>>, ApiError> {
    let rows = state.storage.read_site(&site).await?;
    Ok(Json(rows.iter().map(|row| row.payload()).collect()))
}

/// Query parameters for GET /api/v1/totals/{keyphrase}.
#[derive(Debug, Deserialize)]
pub struct TotalParams {
    /// Site to read the total of; the global total when absent.
    pub site: Option<String>,
}

/// Handle GET /api/v1/totals/{keyphrase}
pub async fn handle_get_total(
    State(state): State<AppState>,
    Path(keyphrase): Path<String>,
    Query(params): Query<TotalParams>,
) -> Result<Json<TotalRecord>, ApiError> {
    let mut total = TotalRecord {
        site_key: params.site,
        keyphrase,
        occurrences: 0,
    };
    total.occurrences = state
        .storage
        .read_total(&total.scope(), &total.keyphrase)
        .await?;
    Ok(Json(total))
}

/// Handle GET /metrics
pub async fn handle_metrics(State(state): State<AppState>) -> String {
    state.metrics.encode()
}

/// Handle GET /-/healthy
pub async fn handle_healthy() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Handle GET /-/ready
///
/// Returns 200 OK once storage answers reads.
pub async fn handle_ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.storage.check_storage().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Not Ready"),
    }
}
