//! Delivery endpoint: one logical instance per connected terminal. Replays unacknowledged
//! history, then tails the live bus, awaiting an ack per frame either way.
//!
//! The wire format is SSE framing for server pushes, but ack frames travel the other direction.
//! Since a true SSE connection has no client-to-server leg, acks arrive over a companion endpoint
//! (`api::ack`) correlated by `(terminal_id, event_id)` through [`AckRouter`] rather than inline
//! on the same socket.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::ack_ledger::AckLedger;
use crate::bus::Bus;
use crate::error::{AppError, AppResult};
use crate::event_store::EventStore;
use crate::models::LicenseRow;
use crate::wire::{AckFrame, AckStatus, EventEnvelope, EventPayload, HeartbeatAck};

/// How long the endpoint waits for a client ack before recording a `timeout` failure and moving
/// on to the next event.
const PER_FRAME_ACK_TIMEOUT: StdDuration = StdDuration::from_secs(30);
/// Cadence of `heartbeat_ack` frames sent during the live phase.
const HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(30);
/// If no write succeeds within this window, the connection is presumed dead and closed.
const KEEPALIVE_WINDOW: StdDuration = StdDuration::from_secs(90);

/// Routes client-submitted ack frames to the delivery task awaiting them.
#[derive(Default, Clone)]
pub struct AckRouter {
    pending: Arc<DashMap<(String, String), oneshot::Sender<AckFrame>>>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, terminal_id: &str, event_id: &str) -> oneshot::Receiver<AckFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((terminal_id.to_owned(), event_id.to_owned()), tx);
        rx
    }

    fn clear(&self, terminal_id: &str, event_id: &str) {
        self.pending.remove(&(terminal_id.to_owned(), event_id.to_owned()));
    }

    /// Called by the companion ack endpoint when a client posts an ack frame. Returns `false`
    /// if no delivery task is currently awaiting this `(terminal_id, event_id)` pair — a late
    /// or duplicate ack, which the caller should still treat as success.
    pub fn deliver(&self, terminal_id: &str, frame: AckFrame) -> bool {
        if let Some((_, tx)) = self.pending.remove(&(terminal_id.to_owned(), frame.event_id.clone())) {
            let _ = tx.send(frame);
            true
        } else {
            false
        }
    }
}

pub struct DeliveryEndpoint {
    pub event_store: Arc<EventStore>,
    pub ack_ledger: Arc<AckLedger>,
    pub bus: Arc<dyn Bus>,
    pub ack_router: AckRouter,
}

async fn authenticate(conn: &libsql::Connection, license_key: &str) -> AppResult<LicenseRow> {
    let mut rows = conn
        .query(
            "SELECT license_key, customer_id, subscription_id, max_terminals, activation_count, is_active,
                    revoked_at, revocation_reason, issued_at, expires_at
             FROM licenses WHERE license_key = ?1",
            [license_key],
        )
        .await
        .map_err(AppError::transient_store)?;

    let row = rows.next().await.map_err(AppError::transient_store)?.ok_or_else(|| AppError::auth("unknown license key"))?;
    let license: LicenseRow = libsql::de::from_row(&row).map_err(AppError::transient_store)?;

    if !license.is_active || license.revoked_at.is_some() {
        return Err(AppError::auth("license is revoked"));
    }

    if let Some(expires_at) = license.expires_at() {
        if OffsetDateTime::now_utc() > expires_at {
            return Err(AppError::auth("license has expired"));
        }
    }

    Ok(license)
}

impl DeliveryEndpoint {
    /// Drives one terminal's connection. Returns a stream of rendered SSE frames; the caller
    /// (the axum handler) is responsible for writing them to the response body and for dropping
    /// the stream when the transport closes, which cancels this task.
    pub async fn stream(
        self: Arc<Self>,
        conn: libsql::Connection,
        license_key: String,
        terminal_id: String,
        last_seen_event_id: Option<String>,
    ) -> AppResult<ReceiverStream<String>> {
        authenticate(&conn, &license_key).await?;

        let cursor = match last_seen_event_id {
            Some(id) => self.event_store.get(&id).await.map_err(AppError::transient_store)?.map(|row| row.created_at()),
            None => None,
        }
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            if let Err(error) = self.drive(license_key, terminal_id, cursor, tx).await {
                warn!(%error, "delivery endpoint ended");
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn drive(
        &self,
        license_key: String,
        terminal_id: String,
        cursor: OffsetDateTime,
        tx: mpsc::Sender<String>,
    ) -> anyhow::Result<()> {
        // Replay phase: everything since the client's cursor, in creation order.
        let backlog = self.event_store.list_since(&license_key, cursor).await?;
        for row in backlog {
            let envelope = EventStore::to_envelope(&row)?;
            if !self.deliver_and_await_ack(&terminal_id, &license_key, &envelope, &tx).await? {
                return Ok(()); // transport closed
            }
        }

        // Live phase: subscribe, then tail, interleaved with heartbeats.
        let mut subscription = self.bus.subscribe(&license_key);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut last_successful_write = tokio::time::Instant::now();

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(envelope) = event else { return Ok(()) };
                    if !self.deliver_and_await_ack(&terminal_id, &license_key, &envelope, &tx).await? {
                        return Ok(());
                    }
                    last_successful_write = tokio::time::Instant::now();
                }
                _ = heartbeat.tick() => {
                    let envelope = heartbeat_envelope(&license_key);
                    let frame = crate::wire::render_sse_frame(&envelope)?;
                    if tx.send(frame).await.is_ok() {
                        last_successful_write = tokio::time::Instant::now();
                    } else if last_successful_write.elapsed() > KEEPALIVE_WINDOW {
                        return Ok(());
                    }
                }
            }

            if last_successful_write.elapsed() > KEEPALIVE_WINDOW {
                return Ok(());
            }
        }
    }

    /// Sends one envelope and waits for its ack, recording the outcome in the ledger. Returns
    /// `Ok(false)` if the transport channel is closed (the caller should stop).
    async fn deliver_and_await_ack(
        &self,
        terminal_id: &str,
        license_key: &str,
        envelope: &EventEnvelope,
        tx: &mpsc::Sender<String>,
    ) -> anyhow::Result<bool> {
        let frame = crate::wire::render_sse_frame(envelope)?;
        let ack_rx = self.ack_router.register(terminal_id, &envelope.id);

        if tx.send(frame).await.is_err() {
            self.ack_router.clear(terminal_id, &envelope.id);
            return Ok(false);
        }

        let outcome = tokio::time::timeout(PER_FRAME_ACK_TIMEOUT, ack_rx).await;
        self.ack_router.clear(terminal_id, &envelope.id);

        let ack_frame = match outcome {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) | Err(_) => AckFrame {
                event_id: envelope.id.clone(),
                status: AckStatus::Failed,
                error_message: Some("timeout".to_owned()),
                processing_time_ms: PER_FRAME_ACK_TIMEOUT.as_millis() as i64,
            },
        };

        self.ack_ledger.record(license_key, terminal_id, &ack_frame).await?;
        Ok(true)
    }
}

fn heartbeat_envelope(license_key: &str) -> EventEnvelope {
    EventEnvelope {
        id: ulid::Ulid::new().to_string(),
        timestamp: OffsetDateTime::now_utc(),
        license_key: license_key.to_owned(),
        payload: EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: OffsetDateTime::now_utc().unix_timestamp() * 1000 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use time::Duration;

    async fn setup(license_key: &str) -> (Arc<EventStore>, Arc<AckLedger>, Arc<dyn Bus>, libsql::Connection) {
        let conn = crate::db::connect(":memory:").await.unwrap();
        conn.execute(
            "INSERT INTO customers (id, email) VALUES ('cust_1', 'a@example.com')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO subscriptions (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end, external_subscription_id)
             VALUES ('sub_1', 'cust_1', 'pro', 'monthly', 'active', 0, 9999999999, 'ext_1')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            &format!("INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals) VALUES ('{license_key}', 'cust_1', 'sub_1', 5)"),
            (),
        )
        .await
        .unwrap();

        let event_store = Arc::new(EventStore::new(conn.clone(), Duration::hours(24)));
        let ack_ledger = Arc::new(AckLedger::new(conn.clone()));
        let bus: Arc<dyn Bus> = Arc::new(InProcessBus::default());
        (event_store, ack_ledger, bus, conn)
    }

    #[tokio::test]
    async fn rejects_unknown_license() {
        let (event_store, ack_ledger, bus, conn) = setup("AUR-PRO-V2-X").await;
        let endpoint = Arc::new(DeliveryEndpoint { event_store, ack_ledger, bus, ack_router: AckRouter::new() });

        let result = endpoint.stream(conn, "AUR-PRO-V2-UNKNOWN".to_owned(), "term1".to_owned(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn replays_backlog_before_going_live() {
        let license_key = "AUR-PRO-V2-X";
        let (event_store, ack_ledger, bus, conn) = setup(license_key).await;
        event_store
            .append("evt_1", license_key, &EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 1 }))
            .await
            .unwrap();

        let ack_router = AckRouter::new();
        let endpoint = Arc::new(DeliveryEndpoint { event_store, ack_ledger, bus, ack_router: ack_router.clone() });

        let mut stream = endpoint.stream(conn, license_key.to_owned(), "term1".to_owned(), None).await.unwrap();

        use tokio_stream::StreamExt as _;
        let first_frame = tokio::time::timeout(StdDuration::from_secs(1), stream.next()).await.unwrap().unwrap();
        assert!(first_frame.contains("id: evt_1"));

        let delivered = ack_router.deliver(
            "term1",
            AckFrame { event_id: "evt_1".to_owned(), status: AckStatus::Success, error_message: None, processing_time_ms: 1 },
        );
        assert!(delivered);
    }
}
