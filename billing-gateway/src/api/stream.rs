use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Deserialize;

use crate::error::AppResult;
use crate::wire::AckFrame;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    terminal_id: String,
    last_seen_event_id: Option<String>,
}

/// Frames are pre-rendered SSE text by [`crate::wire::render_sse_frame`]; axum's `Event` builder
/// only serializes the fields explicitly set on it, so each line of the rendered frame has to be
/// fed back to its matching `.id()`/`.event()`/`.data()` call rather than just passed through.
pub(super) async fn get_stream(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    axum_extra::extract::Query(query): axum_extra::extract::Query<StreamQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>> {
    let raw = state
        .delivery
        .clone()
        .stream(state.conn.clone(), license_key, query.terminal_id, query.last_seen_event_id)
        .await?;

    use tokio_stream::StreamExt as _;
    let events = raw.map(|frame| Ok(frame_to_event(&frame)));

    Ok(Sse::new(events))
}

/// Splits a rendered `id: ...\nevent: ...\ndata: ...\n\n` frame back into its three fields and
/// builds the axum [`Event`] from them, so the HTTP response carries the same `id:`/`event:`
/// meta-lines the wire protocol documents, not just the payload.
fn frame_to_event(frame: &str) -> Event {
    let mut event = Event::default();

    for line in frame.lines() {
        if let Some(id) = line.strip_prefix("id: ") {
            event = event.id(id);
        } else if let Some(event_type) = line.strip_prefix("event: ") {
            event = event.event(event_type);
        } else if let Some(data) = line.strip_prefix("data: ") {
            event = event.data(data);
        }
    }

    event
}

pub(super) async fn post_ack(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    axum_extra::extract::Query(query): axum_extra::extract::Query<AckQuery>,
    Json(frame): Json<AckFrame>,
) -> impl IntoResponse {
    let _ = license_key;
    let delivered = state.delivery.ack_router.deliver(&query.terminal_id, frame);
    Json(serde_json::json!({ "delivered": delivered }))
}

#[derive(Debug, Deserialize)]
pub(super) struct AckQuery {
    terminal_id: String,
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use crate::config::ConfHandle;
    use crate::wire::{EventPayload, HeartbeatAck};
    use crate::AppState;

    /// Router-level: `render_sse_frame`'s three-line shape is already unit-tested in `wire.rs`,
    /// but that never exercises `get_stream`. This drives a real response body so a regression
    /// that drops `.id()`/`.event()` from the axum `Event` (and only `.data()` survives) fails here.
    #[tokio::test]
    async fn get_stream_carries_id_and_event_fields_onto_the_wire() {
        let state = AppState::new(ConfHandle::mock_for_tests(":memory:")).await.unwrap();

        state.conn.execute("INSERT INTO customers (id, email) VALUES ('cust_1', 'a@example.com')", ()).await.unwrap();
        state
            .conn
            .execute(
                "INSERT INTO subscriptions (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end, external_subscription_id)
                 VALUES ('sub_1', 'cust_1', 'pro', 'monthly', 'active', 0, 9999999999, 'ext_1')",
                (),
            )
            .await
            .unwrap();

        let license_key = "AUR-PRO-V2-STRMTEST-11223344";
        state
            .conn
            .execute(
                &format!(
                    "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals)
                     VALUES ('{license_key}', 'cust_1', 'sub_1', 5)"
                ),
                (),
            )
            .await
            .unwrap();

        state
            .event_store
            .append(
                "evt_stream_1",
                license_key,
                &EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 1 }),
            )
            .await
            .unwrap();

        let router = crate::api::make_router(state);
        let request = Request::builder()
            .uri(format!("/stream/{license_key}?terminal_id=term1"))
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);

        while !collected.contains("\n\n") {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = tokio::time::timeout(remaining, body.frame())
                .await
                .expect("timed out waiting for the backlog frame")
                .expect("body stream ended before the backlog frame")
                .unwrap();
            if let Some(data) = frame.data_ref() {
                collected.push_str(&String::from_utf8_lossy(data));
            }
        }

        assert!(collected.contains("id: evt_stream_1"), "frame was: {collected:?}");
        assert!(collected.contains("event: heartbeat_ack"), "frame was: {collected:?}");
        assert!(collected.contains("data: "), "frame was: {collected:?}");
    }
}
