//! Host-facing and operator endpoints of the pipeline.
//!
//! - POST /events/transfer        -> hand one transfer event to the intake
//! - GET  /stats                  -> upload and share counters, failure ledger
//! - GET  /history?local_path=... -> the host history row for a file
//! - POST /admin/reload-mappings  -> re-read path rules and swap them in

use crate::{
    errors::AppError,
    models::{event::TransferEvent, history::HistoryRecord},
    services::{intake::IntakeDecision, pipeline::PipelineStats},
    state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

/// `POST /events/transfer`
///
/// 202 when queued, 200 when ignored, 409 for a path already pending and
/// 503 while the pipeline is not subscribed.
pub async fn transfer_event(
    State(state): State<AppState>,
    Json(event): Json<TransferEvent>,
) -> impl IntoResponse {
    let decision = state.pipeline.intake.on_transfer_event(event);
    let status = match decision {
        IntakeDecision::Enqueued { .. } => StatusCode::ACCEPTED,
        IntakeDecision::Ignored { .. } => StatusCode::OK,
        IntakeDecision::Duplicate => StatusCode::CONFLICT,
        IntakeDecision::NotSubscribed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(decision))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.pipeline.stats())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub local_path: String,
}

/// `GET /history?local_path=...`
pub async fn history_record(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryRecord>, AppError> {
    let record = state
        .history
        .fetch_record(&query.local_path)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    record.map(Json).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            format!("no transfer history for `{}`", query.local_path),
        )
    })
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub rules: usize,
}

/// `POST /admin/reload-mappings`
///
/// On a read or parse error the previous rules stay active and 422 is
/// returned. The file is read on the blocking pool.
pub async fn reload_mappings(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, AppError> {
    let store = state.pipeline.rules.clone();
    let rules = tokio::task::spawn_blocking(move || store.reload())
        .await
        .map_err(|err| AppError::internal(format!("mapping reload task failed: {}", err)))??;
    Ok(Json(ReloadResponse { rules }))
}
