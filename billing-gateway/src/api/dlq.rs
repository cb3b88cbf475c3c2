use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::models::DeadLetterRow;
use crate::AppState;

pub(super) async fn get_entry(State(state): State<AppState>, Path(event_id): Path<String>) -> AppResult<Json<DeadLetterRow>> {
    let entry = crate::retry::get_dlq_entry(&state.conn, &event_id)
        .await
        .map_err(AppError::transient_store)?
        .ok_or_else(|| AppError::not_found("no dead-letter entry for this event"))?;
    Ok(Json(entry))
}

pub(super) async fn post_retry(State(state): State<AppState>, Path(event_id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    crate::retry::retry_dlq_event(&state.conn, &state.event_store, &event_id).await.map_err(AppError::transient_store)?;
    Ok(Json(serde_json::json!({ "status": "retrying" })))
}

#[derive(Debug, Deserialize)]
pub(super) struct ResolutionBody {
    resolved_by: String,
    notes: Option<String>,
}

pub(super) async fn post_resolve(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(body): Json<ResolutionBody>,
) -> AppResult<Json<serde_json::Value>> {
    crate::retry::resolve_dlq_event(&state.conn, &event_id, &body.resolved_by, body.notes.as_deref())
        .await
        .map_err(AppError::transient_store)?;
    Ok(Json(serde_json::json!({ "status": "resolved" })))
}

pub(super) async fn post_abandon(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(body): Json<ResolutionBody>,
) -> AppResult<Json<serde_json::Value>> {
    crate::retry::abandon_dlq_event(&state.conn, &event_id, &body.resolved_by, body.notes.as_deref())
        .await
        .map_err(AppError::transient_store)?;
    Ok(Json(serde_json::json!({ "status": "abandoned" })))
}
