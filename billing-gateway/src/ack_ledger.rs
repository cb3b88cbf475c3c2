//! Acknowledgement ledger: write-only from the delivery endpoint, read by the retry engine and
//! the pattern analyzer.

use libsql::Connection;
use ulid::Ulid;

use crate::models::{AckStatus, AcknowledgementRow};
use crate::wire::AckFrame;

pub struct AckLedger {
    conn: Connection,
}

impl AckLedger {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Appends an ack row. A duplicate `success` for the same `(event_id, terminal_id)` is
    /// silently ignored; duplicate `failed` rows are all kept, since they feed the pattern
    /// analyzer.
    pub async fn record(&self, license_key: &str, terminal_id: &str, frame: &AckFrame) -> anyhow::Result<()> {
        let status = match frame.status {
            crate::wire::AckStatus::Success => AckStatus::Success,
            crate::wire::AckStatus::Failed => AckStatus::Failed,
        };

        let id = Ulid::new().to_string();

        self.conn
            .execute(
                "INSERT INTO acknowledgements (id, event_id, license_key, terminal_id, status, error_message, processing_time_ms)
                 VALUES (:id, :event_id, :license_key, :terminal_id, :status, :error_message, :processing_time_ms)
                 ON CONFLICT DO NOTHING",
                (
                    (":id", id),
                    (":event_id", frame.event_id.clone()),
                    (":license_key", license_key.to_owned()),
                    (":terminal_id", terminal_id.to_owned()),
                    (":status", status.as_str().to_owned()),
                    (":error_message", frame.error_message.clone()),
                    (":processing_time_ms", frame.processing_time_ms),
                ),
            )
            .await?;

        Ok(())
    }

    pub async fn has_success(&self, event_id: &str) -> anyhow::Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM acknowledgements WHERE event_id = ?1 AND status = 'success' LIMIT 1",
                [event_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn failures_since(&self, since_unix: i64) -> anyhow::Result<Vec<AcknowledgementRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, event_id, license_key, terminal_id, status, error_message, processing_time_ms, acknowledged_at
                 FROM acknowledgements WHERE status = 'failed' AND acknowledged_at >= ?1
                 ORDER BY acknowledged_at ASC",
                [since_unix],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(libsql::de::from_row::<AcknowledgementRow>(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AckStatus as WireAckStatus;

    async fn ledger() -> AckLedger {
        let conn = crate::db::connect(":memory:").await.unwrap();
        conn.execute(
            "INSERT INTO events (event_id, license_key, event_type, payload, expires_at) VALUES ('e1', 'AUR-PRO-V2-X', 't', '{}', 9999999999)",
            (),
        )
        .await
        .unwrap();
        AckLedger::new(conn)
    }

    fn frame(status: WireAckStatus) -> AckFrame {
        AckFrame { event_id: "e1".to_owned(), status, error_message: None, processing_time_ms: 10 }
    }

    #[tokio::test]
    async fn duplicate_success_is_idempotent() {
        let ledger = ledger().await;
        ledger.record("AUR-PRO-V2-X", "term1", &frame(WireAckStatus::Success)).await.unwrap();
        ledger.record("AUR-PRO-V2-X", "term1", &frame(WireAckStatus::Success)).await.unwrap();

        assert!(ledger.has_success("e1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_acks_do_not_count_as_success() {
        let ledger = ledger().await;
        ledger.record("AUR-PRO-V2-X", "term1", &frame(WireAckStatus::Failed)).await.unwrap();
        ledger.record("AUR-PRO-V2-X", "term1", &frame(WireAckStatus::Failed)).await.unwrap();

        assert!(!ledger.has_success("e1").await.unwrap());
        assert_eq!(ledger.failures_since(0).await.unwrap().len(), 2);
    }
}
