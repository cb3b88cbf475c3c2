use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub(super) struct HealthBody {
    status: &'static str,
    version: &'static str,
}

pub(super) async fn get_health(State(_state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody { status: "ok", version: env!("CARGO_PKG_VERSION") })
}
