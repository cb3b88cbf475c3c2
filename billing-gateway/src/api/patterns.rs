use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppResult;
use crate::models::FailurePatternRow;
use crate::AppState;

pub(super) async fn get_patterns(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
) -> AppResult<Json<Vec<FailurePatternRow>>> {
    let patterns =
        state.pattern_analyzer.list_unresolved(&license_key).await.map_err(crate::error::AppError::transient_store)?;
    Ok(Json(patterns))
}

#[derive(Debug, Deserialize)]
pub(super) struct ResolveBody {
    notes: Option<String>,
}

pub(super) async fn post_resolve(
    State(state): State<AppState>,
    Path((license_key, pattern_kind)): Path<(String, String)>,
    Json(body): Json<ResolveBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .pattern_analyzer
        .resolve(&license_key, &pattern_kind, body.notes.as_deref())
        .await
        .map_err(crate::error::AppError::transient_store)?;
    Ok(Json(serde_json::json!({ "resolved": true })))
}
