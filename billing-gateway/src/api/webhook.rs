use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::webhook::{IncomingWebhookEvent, IngestOutcome};
use crate::AppState;

#[derive(Serialize)]
pub(super) struct WebhookAck {
    received: bool,
}

/// Verifies the signature header, then hands the parsed body to [`WebhookIngress`].
pub(super) async fn post_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> AppResult<(StatusCode, Json<WebhookAck>)> {
    let signature_header = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::auth("missing X-Webhook-Signature header"))?;

    crate::webhook::verify_signature(&body, signature_header, &state.conf.get().webhook_signing_secret)?;

    let event: IncomingWebhookEvent = serde_json::from_slice(&body).map_err(AppError::validation)?;

    match state.webhook_ingress.ingest(&body, event).await? {
        IngestOutcome::Processed => Ok((StatusCode::OK, Json(WebhookAck { received: true }))),
        // A replayed event id is treated as a success, not a conflict.
        IngestOutcome::Duplicate => Ok((StatusCode::OK, Json(WebhookAck { received: true }))),
    }
}
