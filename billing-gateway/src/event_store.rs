//! Durable append-only record of subscription events with a bounded time-to-live.
//!
//! Persistence here is best-effort for producers: [`EventStore::append`] never fails the
//! caller's transaction plan. If the insert itself errors, the caller logs and moves on; the
//! fabric degrades to in-memory delivery only for that one event rather than stalling the hot
//! path on the store.

use libsql::Connection;
use time::{Duration, OffsetDateTime};

use crate::models::EventRow;
use crate::wire::{EventEnvelope, EventPayload};

pub struct EventStore {
    conn: Connection,
    ttl: Duration,
}

impl EventStore {
    pub fn new(conn: Connection, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    /// Inserts the event if `event_id` hasn't been seen before; a conflict is a silent success
    /// since the event is already durable.
    pub async fn append(&self, id: &str, license_key: &str, payload: &EventPayload) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.ttl;
        let payload_json = serde_json::to_string(payload)?;

        self.conn
            .execute(
                "INSERT INTO events (event_id, license_key, event_type, payload, created_at, expires_at)
                 VALUES (:id, :license_key, :event_type, :payload, :created_at, :expires_at)
                 ON CONFLICT (event_id) DO NOTHING",
                (
                    (":id", id.to_owned()),
                    (":license_key", license_key.to_owned()),
                    (":event_type", payload.type_name().to_owned()),
                    (":payload", payload_json),
                    (":created_at", now.unix_timestamp()),
                    (":expires_at", expires_at.unix_timestamp()),
                ),
            )
            .await?;

        Ok(())
    }

    /// Every non-expired event for `license_key` created after `after`, in creation order. Used
    /// by the delivery endpoint's replay phase and by the retry engine.
    pub async fn list_since(&self, license_key: &str, after: OffsetDateTime) -> anyhow::Result<Vec<EventRow>> {
        let now = OffsetDateTime::now_utc();

        let mut rows = self
            .conn
            .query(
                "SELECT event_id, license_key, event_type, payload, created_at, expires_at
                 FROM events
                 WHERE license_key = :license_key AND created_at > :after AND expires_at > :now
                 ORDER BY created_at ASC",
                (
                    (":license_key", license_key.to_owned()),
                    (":after", after.unix_timestamp()),
                    (":now", now.unix_timestamp()),
                ),
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(libsql::de::from_row::<EventRow>(&row)?);
        }
        Ok(events)
    }

    /// Events eligible for a retry pass: created before `lag_before`, license-keyed, regardless
    /// of ack state — the caller joins this against the acknowledgement ledger.
    pub async fn scan_expiring(&self, before: OffsetDateTime) -> anyhow::Result<Vec<EventRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT event_id, license_key, event_type, payload, created_at, expires_at
                 FROM events WHERE created_at < :before ORDER BY created_at ASC",
                [(":before", before.unix_timestamp())],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(libsql::de::from_row::<EventRow>(&row)?);
        }
        Ok(events)
    }

    pub async fn get(&self, event_id: &str) -> anyhow::Result<Option<EventRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT event_id, license_key, event_type, payload, created_at, expires_at FROM events WHERE event_id = ?1",
                [event_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(libsql::de::from_row::<EventRow>(&row)?)),
            None => Ok(None),
        }
    }

    /// Deletes every event whose `expires_at < before`; returns the number deleted.
    pub async fn delete_expired(&self, before: OffsetDateTime) -> anyhow::Result<u64> {
        let changed =
            self.conn.execute("DELETE FROM events WHERE expires_at < ?1", [before.unix_timestamp()]).await?;
        Ok(changed)
    }

    /// Reinjects `event_id` into the store with a fresh, short expiry — used by the DLQ retry
    /// operator action.
    pub async fn reinject_with_short_expiry(&self, event_id: &str, horizon: Duration) -> anyhow::Result<()> {
        let expires_at = OffsetDateTime::now_utc() + horizon;
        self.conn
            .execute(
                "UPDATE events SET expires_at = ?1 WHERE event_id = ?2",
                ((expires_at.unix_timestamp()), event_id.to_owned()),
            )
            .await?;
        Ok(())
    }

    pub fn to_envelope(row: &EventRow) -> anyhow::Result<EventEnvelope> {
        let payload: EventPayload = serde_json::from_str(&row.payload)?;
        Ok(EventEnvelope { id: row.event_id.clone(), timestamp: row.created_at(), license_key: row.license_key.clone(), payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HeartbeatAck;

    async fn store() -> EventStore {
        let conn = crate::db::connect(":memory:").await.unwrap();
        EventStore::new(conn, Duration::hours(24))
    }

    fn sample_payload() -> EventPayload {
        EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 0 })
    }

    #[tokio::test]
    async fn duplicate_append_is_a_silent_no_op() {
        let store = store().await;
        store.append("evt_1", "AUR-PRO-V2-X", &sample_payload()).await.unwrap();
        store.append("evt_1", "AUR-PRO-V2-X", &sample_payload()).await.unwrap();

        let events = store.list_since("AUR-PRO-V2-X", OffsetDateTime::UNIX_EPOCH).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn list_since_excludes_events_at_or_before_cursor() {
        let store = store().await;
        store.append("evt_1", "AUR-PRO-V2-X", &sample_payload()).await.unwrap();
        let cursor = store.get("evt_1").await.unwrap().unwrap().created_at();

        store.append("evt_2", "AUR-PRO-V2-X", &sample_payload()).await.unwrap();

        let events = store.list_since("AUR-PRO-V2-X", cursor).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "evt_2");
    }

    #[tokio::test]
    async fn delete_expired_removes_only_past_events() {
        let store = store().await;
        store.append("evt_1", "AUR-PRO-V2-X", &sample_payload()).await.unwrap();

        let deleted = store.delete_expired(OffsetDateTime::now_utc() - Duration::hours(1)).await.unwrap();
        assert_eq!(deleted, 0);

        let deleted = store.delete_expired(OffsetDateTime::now_utc() + Duration::hours(25)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
