pub mod dlq;
pub mod health;
pub mod license;
pub mod patterns;
pub mod stream;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .route("/webhooks/payment", post(webhook::post_webhook))
        .route("/licenses/plan-change", post(license::post_plan_change))
        .route("/licenses/{license_key}/activate", post(license::post_activate))
        .route("/licenses/{license_key}/heartbeat", post(license::post_heartbeat))
        .route("/licenses/{license_key}/deactivate", post(license::post_deactivate))
        .route("/licenses/{license_key}/revoke", post(license::post_revoke))
        .route("/stream/{license_key}", get(stream::get_stream))
        .route("/stream/{license_key}/ack", post(stream::post_ack))
        .route("/dlq/{event_id}", get(dlq::get_entry))
        .route("/dlq/{event_id}/retry", post(dlq::post_retry))
        .route("/dlq/{event_id}/resolve", post(dlq::post_resolve))
        .route("/dlq/{event_id}/abandon", post(dlq::post_abandon))
        .route("/patterns/{license_key}", get(patterns::get_patterns))
        .route("/patterns/{license_key}/{pattern_kind}/resolve", post(patterns::post_resolve))
        .with_state(state)
}
