//! Retry engine and dead letter queue. Runs as a recurring [`event_queue::Job`] on the shared job
//! queue (the same abstraction driving the scheduled sweeps in [`crate::sweeps`]).
//!
//! A retry that errors mid-cycle records a `failed` attempt for that one event and the cycle
//! moves on; the engine itself never blocks on one bad event, and the job-queue runner already
//! isolates one job's failure from the next scheduled occurrence.

use std::sync::Arc;

use async_trait::async_trait;
use event_queue::Job;
use libsql::Connection;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use crate::ack_ledger::AckLedger;
use crate::bus::Bus;
use crate::event_store::EventStore;
use crate::models::{DeadLetterRow, DlqStatus, RetryResult};

/// How far back from "now" an event must be before it's eligible for its first retry check;
/// gives the live delivery path a moment to ack before the sweep starts chasing it.
const RETRY_LAG: Duration = Duration::seconds(30);
const BASE_BACKOFF: Duration = Duration::seconds(1);
const BACKOFF_MULTIPLIER: i64 = 2;

pub struct RetryTickJob {
    pub conn: Connection,
    pub event_store: Arc<EventStore>,
    pub ack_ledger: Arc<AckLedger>,
    pub bus: Arc<dyn Bus>,
    pub max_retry_attempts: u32,
}

#[async_trait]
impl Job for RetryTickJob {
    fn name(&self) -> &str {
        "retry_tick"
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok("{}".to_owned())
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let summary = self.tick().await?;
        info!(
            considered = summary.considered,
            republished = summary.republished,
            dead_lettered = summary.dead_lettered,
            "retry tick complete"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RetrySummary {
    pub considered: usize,
    pub republished: usize,
    pub dead_lettered: usize,
}

impl RetryTickJob {
    /// Scans eligible events, counts attempts, and either dead-letters or republishes with backoff.
    pub async fn tick(&self) -> anyhow::Result<RetrySummary> {
        let mut summary = RetrySummary::default();
        let cutoff = OffsetDateTime::now_utc() - RETRY_LAG;

        let candidates = self.event_store.scan_expiring(cutoff).await?;

        for event in candidates {
            if self.ack_ledger.has_success(&event.event_id).await? {
                continue;
            }

            if !self.due_for_retry(&event.event_id).await? {
                continue;
            }

            summary.considered += 1;

            let attempt_number = self.attempt_count(&event.event_id).await? + 1;

            if attempt_number > i64::from(self.max_retry_attempts) {
                if let Err(error) = self.dead_letter(&event).await {
                    warn!(%error, event_id = %event.event_id, "failed to move event to the dead letter queue");
                    continue;
                }
                summary.dead_lettered += 1;
                continue;
            }

            match self.republish(&event, attempt_number).await {
                Ok(()) => summary.republished += 1,
                Err(error) => {
                    warn!(%error, event_id = %event.event_id, "retry attempt failed, deferring to next cycle");
                    self.record_attempt(&event.event_id, attempt_number, RetryResult::Failed, Some(error.to_string()), None)
                        .await
                        .ok();
                }
            }
        }

        Ok(summary)
    }

    async fn due_for_retry(&self, event_id: &str) -> anyhow::Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT next_retry_at FROM retry_attempts WHERE event_id = ?1 ORDER BY attempt_number DESC LIMIT 1",
                [event_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(true); // no prior attempt
        };

        let next_retry_at: Option<i64> = row.get(0).ok();
        match next_retry_at {
            Some(ts) => Ok(OffsetDateTime::now_utc().unix_timestamp() >= ts),
            None => Ok(true),
        }
    }

    async fn attempt_count(&self, event_id: &str) -> anyhow::Result<i64> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM retry_attempts WHERE event_id = ?1", [event_id]).await?;
        let row = rows.next().await?.expect("COUNT(*) always returns a row");
        Ok(row.get(0)?)
    }

    async fn republish(&self, event: &crate::models::EventRow, attempt_number: i64) -> anyhow::Result<()> {
        let envelope = EventStore::to_envelope(event)?;
        self.bus.publish(&event.license_key, &envelope).await;

        let delay_ms = BASE_BACKOFF.whole_milliseconds() as i64 * BACKOFF_MULTIPLIER.pow((attempt_number - 1) as u32);
        let next_retry_at = OffsetDateTime::now_utc() + Duration::milliseconds(delay_ms);

        self.record_attempt(&event.event_id, attempt_number, RetryResult::Failed, None, Some((next_retry_at, delay_ms))).await
    }

    async fn record_attempt(
        &self,
        event_id: &str,
        attempt_number: i64,
        result: RetryResult,
        error_message: Option<String>,
        retry_schedule: Option<(OffsetDateTime, i64)>,
    ) -> anyhow::Result<()> {
        let id = Ulid::new().to_string();
        let (next_retry_at, backoff_delay_ms) = match retry_schedule {
            Some((at, ms)) => (Some(at.unix_timestamp()), Some(ms)),
            None => (None, None),
        };

        self.conn
            .execute(
                "INSERT INTO retry_attempts (id, event_id, attempt_number, result, error_message, next_retry_at, backoff_delay_ms)
                 VALUES (:id, :event_id, :attempt_number, :result, :error_message, :next_retry_at, :backoff_delay_ms)",
                (
                    (":id", id),
                    (":event_id", event_id.to_owned()),
                    (":attempt_number", attempt_number),
                    (":result", result.as_str().to_owned()),
                    (":error_message", error_message),
                    (":next_retry_at", next_retry_at),
                    (":backoff_delay_ms", backoff_delay_ms),
                ),
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, event: &crate::models::EventRow) -> anyhow::Result<()> {
        let retry_count = self.attempt_count(&event.event_id).await?;

        self.conn
            .execute(
                "INSERT INTO dead_letter_entries
                    (event_id, license_key, event_type, payload, original_created_at, retry_count, status, last_error_message, last_error_at)
                 VALUES (:event_id, :license_key, :event_type, :payload, :original_created_at, :retry_count, :status, :last_error_message, :last_error_at)
                 ON CONFLICT (event_id) DO NOTHING",
                (
                    (":event_id", event.event_id.clone()),
                    (":license_key", event.license_key.clone()),
                    (":event_type", event.event_type.clone()),
                    (":payload", event.payload.clone()),
                    (":original_created_at", event.created_at),
                    (":retry_count", retry_count),
                    (":status", DlqStatus::PendingReview.as_str().to_owned()),
                    (":last_error_message", Some("retry attempts exhausted".to_owned())),
                    (":last_error_at", Some(OffsetDateTime::now_utc().unix_timestamp())),
                ),
            )
            .await?;
        Ok(())
    }
}

/// Re-injects a DLQ event into the event store with a fresh short-horizon expiry and flips its
/// status to `retrying`.
pub async fn retry_dlq_event(conn: &Connection, event_store: &EventStore, event_id: &str) -> anyhow::Result<()> {
    event_store.reinject_with_short_expiry(event_id, Duration::hours(1)).await?;

    conn.execute(
        "UPDATE dead_letter_entries SET status = ?1 WHERE event_id = ?2",
        (DlqStatus::Retrying.as_str(), event_id.to_owned()),
    )
    .await?;
    Ok(())
}

pub async fn resolve_dlq_event(conn: &Connection, event_id: &str, resolved_by: &str, notes: Option<&str>) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE dead_letter_entries SET status = :status, resolved_by = :resolved_by, resolved_at = :resolved_at, resolution_notes = :notes
         WHERE event_id = :event_id",
        (
            (":status", DlqStatus::Resolved.as_str()),
            (":resolved_by", resolved_by.to_owned()),
            (":resolved_at", OffsetDateTime::now_utc().unix_timestamp()),
            (":notes", notes.map(str::to_owned)),
            (":event_id", event_id.to_owned()),
        ),
    )
    .await?;
    Ok(())
}

pub async fn abandon_dlq_event(conn: &Connection, event_id: &str, resolved_by: &str, notes: Option<&str>) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE dead_letter_entries SET status = :status, resolved_by = :resolved_by, resolved_at = :resolved_at, resolution_notes = :notes
         WHERE event_id = :event_id",
        (
            (":status", DlqStatus::Abandoned.as_str()),
            (":resolved_by", resolved_by.to_owned()),
            (":resolved_at", OffsetDateTime::now_utc().unix_timestamp()),
            (":notes", notes.map(str::to_owned)),
            (":event_id", event_id.to_owned()),
        ),
    )
    .await?;
    Ok(())
}

pub async fn get_dlq_entry(conn: &Connection, event_id: &str) -> anyhow::Result<Option<DeadLetterRow>> {
    let mut rows = conn
        .query(
            "SELECT event_id, license_key, event_type, payload, original_created_at, retry_count,
                    last_error_message, last_error_at, status, resolved_by, resolved_at, resolution_notes, failed_at
             FROM dead_letter_entries WHERE event_id = ?1",
            [event_id],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(libsql::de::from_row(&row)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::wire::{EventPayload, HeartbeatAck};

    async fn job() -> RetryTickJob {
        let conn = crate::db::connect(":memory:").await.unwrap();
        let event_store = Arc::new(EventStore::new(conn.clone(), Duration::hours(24)));
        let ack_ledger = Arc::new(AckLedger::new(conn.clone()));
        let bus: Arc<dyn Bus> = Arc::new(InProcessBus::default());
        RetryTickJob { conn, event_store, ack_ledger, bus, max_retry_attempts: 5 }
    }

    #[tokio::test]
    async fn acked_events_are_skipped() {
        let job = job().await;
        job.event_store
            .append("evt_1", "AUR-PRO-V2-X", &EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 0 }))
            .await
            .unwrap();
        job.ack_ledger
            .record(
                "AUR-PRO-V2-X",
                "term1",
                &crate::wire::AckFrame {
                    event_id: "evt_1".to_owned(),
                    status: crate::wire::AckStatus::Success,
                    error_message: None,
                    processing_time_ms: 1,
                },
            )
            .await
            .unwrap();

        // Events are only eligible past RETRY_LAG; force the created_at back in time.
        job.conn.execute("UPDATE events SET created_at = created_at - 3600", ()).await.unwrap();

        let summary = job.tick().await.unwrap();
        assert_eq!(summary.considered, 0);
    }

    #[tokio::test]
    async fn exhausting_retries_moves_event_to_dlq() {
        let mut job = job().await;
        job.max_retry_attempts = 2;
        job.event_store
            .append("evt_1", "AUR-PRO-V2-X", &EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 0 }))
            .await
            .unwrap();
        job.conn.execute("UPDATE events SET created_at = created_at - 3600", ()).await.unwrap();

        // First two ticks republish (no next_retry_at gate crossed since delay > 0, so force time).
        for _ in 0..2 {
            job.tick().await.unwrap();
            job.conn.execute("UPDATE retry_attempts SET next_retry_at = 0", ()).await.unwrap();
        }

        let summary = job.tick().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);

        let entry = get_dlq_entry(&job.conn, "evt_1").await.unwrap().unwrap();
        assert_eq!(entry.status, "pending_review");
        assert_eq!(entry.retry_count, 2);
    }
}
