//! Scheduled sweeps: three recurring [`event_queue::Job`]s registered against the shared job
//! queue alongside the retry tick (`crate::retry::RetryTickJob`).
//!
//! None of these jobs touch a delivery connection directly; like the retry engine they only
//! write rows and publish to the bus, leaving actual frame delivery to whichever
//! [`crate::delivery::DeliveryEndpoint`] is currently subscribed.

use std::sync::Arc;

use async_trait::async_trait;
use event_queue::Job;
use libsql::Connection;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use crate::bus::Bus;
use crate::event_store::EventStore;
use crate::wire::{DeactivationBroadcast, EventEnvelope, EventPayload, SubscriptionCancelled};

const TRIAL_POST_EXPIRY_GRACE: Duration = Duration::days(7);
const CANCELLATION_GRACE: Duration = Duration::days(7);
const WARNING_WINDOWS: [Duration; 2] = [Duration::days(3), Duration::days(1)];

fn within_warning_window(deadline: OffsetDateTime, now: OffsetDateTime) -> bool {
    WARNING_WINDOWS.iter().any(|window| {
        let warn_at = deadline - *window;
        now >= warn_at && now < warn_at + Duration::hours(6)
    })
}

async fn publish_subscription_cancelled(
    bus: &dyn Bus,
    event_store: &EventStore,
    license_key: &str,
    cancel_immediately: bool,
    grace_period_end: Option<OffsetDateTime>,
) -> anyhow::Result<()> {
    let envelope_id = Ulid::new().to_string();
    let payload = EventPayload::SubscriptionCancelled(SubscriptionCancelled {
        cancelled_at: OffsetDateTime::now_utc(),
        cancel_immediately,
        grace_period_end,
    });
    event_store.append(&envelope_id, license_key, &payload).await?;

    let envelope =
        EventEnvelope { id: envelope_id, timestamp: OffsetDateTime::now_utc(), license_key: license_key.to_owned(), payload };
    bus.publish(license_key, &envelope).await;
    Ok(())
}

async fn licenses_for_subscription(conn: &Connection, subscription_id: &str) -> anyhow::Result<Vec<String>> {
    let mut rows = conn
        .query(
            "SELECT license_key FROM licenses WHERE subscription_id = ?1 AND is_active = 1",
            [subscription_id],
        )
        .await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row.get::<String>(0)?);
    }
    Ok(out)
}

async fn revoke_licenses(conn: &Connection, subscription_id: &str, reason: &str) -> anyhow::Result<Vec<String>> {
    let licenses = licenses_for_subscription(conn, subscription_id).await?;
    for license_key in &licenses {
        conn.execute(
            "UPDATE licenses SET is_active = 0, revoked_at = unixepoch(), revocation_reason = :reason WHERE license_key = :key",
            ((":reason", reason.to_owned()), (":key", license_key.clone())),
        )
        .await?;
    }
    Ok(licenses)
}

#[derive(Debug, Default)]
pub struct SweepSummary {
    pub considered: usize,
    pub warned: usize,
    pub acted: usize,
}

/// Every six hours: warns trials nearing `trial_end`, and for already-expired trials, either
/// warns (inside the 7-day post-trial grace) or cancels and revokes (past it).
pub struct TrialEndingSweepJob {
    pub conn: Connection,
    pub event_store: Arc<EventStore>,
    pub bus: Arc<dyn Bus>,
}

#[async_trait]
impl Job for TrialEndingSweepJob {
    fn name(&self) -> &str {
        "trial_ending_sweep"
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok("{}".to_owned())
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let summary = self.sweep().await?;
        info!(considered = summary.considered, warned = summary.warned, acted = summary.acted, "trial ending sweep complete");
        Ok(())
    }
}

impl TrialEndingSweepJob {
    pub async fn sweep(&self) -> anyhow::Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        let now = OffsetDateTime::now_utc();

        let mut rows = self
            .conn
            .query("SELECT id, trial_end, external_subscription_id FROM subscriptions WHERE status = 'trialing'", ())
            .await?;

        let mut trials = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let trial_end: Option<i64> = row.get(1).ok();
            trials.push((id, trial_end));
        }

        for (subscription_id, trial_end) in trials {
            summary.considered += 1;
            let Some(trial_end) = trial_end else { continue };
            let trial_end = OffsetDateTime::from_unix_timestamp(trial_end).unwrap_or(now);

            if now <= trial_end {
                if within_warning_window(trial_end, now) {
                    info!(subscription_id, "trial ending soon notification queued");
                    summary.warned += 1;
                }
                continue;
            }

            let grace_deadline = trial_end + TRIAL_POST_EXPIRY_GRACE;
            if now <= grace_deadline {
                info!(subscription_id, "trial ended, within post-trial grace, notification queued");
                summary.warned += 1;
                continue;
            }

            self.conn
                .execute("UPDATE subscriptions SET status = 'cancelled' WHERE id = ?1", [subscription_id.clone()])
                .await?;
            let licenses = revoke_licenses(&self.conn, &subscription_id, "trial grace period expired").await?;
            for license_key in licenses {
                publish_subscription_cancelled(self.bus.as_ref(), &self.event_store, &license_key, true, None).await?;
            }
            summary.acted += 1;
        }

        Ok(summary)
    }
}

/// Every twelve hours: warns cancelled-but-still-in-grace subscriptions, and past grace
/// deactivates their licenses with an immediate-disable broadcast.
pub struct GracePeriodSweepJob {
    pub conn: Connection,
    pub event_store: Arc<EventStore>,
    pub bus: Arc<dyn Bus>,
}

#[async_trait]
impl Job for GracePeriodSweepJob {
    fn name(&self) -> &str {
        "grace_period_sweep"
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok("{}".to_owned())
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let summary = self.sweep().await?;
        info!(considered = summary.considered, warned = summary.warned, acted = summary.acted, "grace period sweep complete");
        Ok(())
    }
}

impl GracePeriodSweepJob {
    pub async fn sweep(&self) -> anyhow::Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        let now = OffsetDateTime::now_utc();

        let mut rows = self.conn.query("SELECT id, canceled_at FROM subscriptions WHERE status = 'cancelled'", ()).await?;

        let mut subscriptions = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let canceled_at: Option<i64> = row.get(1).ok();
            subscriptions.push((id, canceled_at));
        }

        for (subscription_id, canceled_at) in subscriptions {
            summary.considered += 1;
            let Some(canceled_at) = canceled_at else { continue };
            let canceled_at = OffsetDateTime::from_unix_timestamp(canceled_at).unwrap_or(now);
            let grace_deadline = canceled_at + CANCELLATION_GRACE;

            if now <= grace_deadline {
                if within_warning_window(grace_deadline, now) {
                    info!(subscription_id, "cancellation grace period warning queued");
                    summary.warned += 1;
                }
                continue;
            }

            let licenses = revoke_licenses(&self.conn, &subscription_id, "cancellation grace period expired").await?;
            for license_key in licenses {
                let envelope_id = Ulid::new().to_string();
                let payload = EventPayload::DeactivationBroadcast(DeactivationBroadcast {
                    terminal_id: String::new(),
                    immediate_disable: true,
                });
                self.event_store.append(&envelope_id, &license_key, &payload).await?;
                let envelope = EventEnvelope {
                    id: envelope_id,
                    timestamp: now,
                    license_key: license_key.clone(),
                    payload,
                };
                self.bus.publish(&license_key, &envelope).await;

                publish_subscription_cancelled(self.bus.as_ref(), &self.event_store, &license_key, true, None).await?;
            }
            summary.acted += 1;
        }

        Ok(summary)
    }
}

/// Deletes events whose `expires_at` has passed. Unlike the other two sweeps this one has no
/// business-rule branch — it's a pure cleanup pass.
pub struct EventTtlSweepJob {
    pub event_store: Arc<EventStore>,
}

#[async_trait]
impl Job for EventTtlSweepJob {
    fn name(&self) -> &str {
        "event_ttl_sweep"
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok("{}".to_owned())
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let deleted = self.event_store.delete_expired(OffsetDateTime::now_utc()).await?;
        info!(deleted, "event ttl sweep complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;

    async fn setup() -> (Connection, Arc<EventStore>, Arc<dyn Bus>) {
        let conn = crate::db::connect(":memory:").await.unwrap();
        conn.execute("INSERT INTO customers (id, email) VALUES ('cust_1', 'a@example.com')", ()).await.unwrap();
        let event_store = Arc::new(EventStore::new(conn.clone(), Duration::hours(24)));
        let bus: Arc<dyn Bus> = Arc::new(InProcessBus::default());
        (conn, event_store, bus)
    }

    #[tokio::test]
    async fn expired_trial_past_grace_cancels_and_revokes() {
        let (conn, event_store, bus) = setup().await;

        let long_past = OffsetDateTime::now_utc() - Duration::days(40);
        conn.execute(
            &format!(
                "INSERT INTO subscriptions (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end, trial_end, external_subscription_id)
                 VALUES ('sub_1', 'cust_1', 'pro', 'monthly', 'trialing', 0, 9999999999, {}, 'ext_1')",
                long_past.unix_timestamp()
            ),
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals) VALUES ('AUR-PRO-V2-X', 'cust_1', 'sub_1', 5)",
            (),
        )
        .await
        .unwrap();

        let job = TrialEndingSweepJob { conn: conn.clone(), event_store, bus };
        let summary = job.sweep().await.unwrap();
        assert_eq!(summary.acted, 1);

        let mut rows = conn.query("SELECT status FROM subscriptions WHERE id = 'sub_1'", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let status: String = row.get(0).unwrap();
        assert_eq!(status, "cancelled");
    }

    #[tokio::test]
    async fn trial_inside_post_expiry_grace_only_warns() {
        let (conn, event_store, bus) = setup().await;

        let recently_expired = OffsetDateTime::now_utc() - Duration::days(2);
        conn.execute(
            &format!(
                "INSERT INTO subscriptions (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end, trial_end, external_subscription_id)
                 VALUES ('sub_1', 'cust_1', 'pro', 'monthly', 'trialing', 0, 9999999999, {}, 'ext_1')",
                recently_expired.unix_timestamp()
            ),
            (),
        )
        .await
        .unwrap();

        let job = TrialEndingSweepJob { conn: conn.clone(), event_store, bus };
        let summary = job.sweep().await.unwrap();
        assert_eq!(summary.acted, 0);

        let mut rows = conn.query("SELECT status FROM subscriptions WHERE id = 'sub_1'", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let status: String = row.get(0).unwrap();
        assert_eq!(status, "trialing");
    }

    #[tokio::test]
    async fn event_ttl_sweep_deletes_only_expired_events() {
        let (conn, event_store, _bus) = setup().await;
        event_store
            .append("e1", "AUR-PRO-V2-X", &EventPayload::HeartbeatAck(crate::wire::HeartbeatAck { server_time_ms: 0 }))
            .await
            .unwrap();
        conn.execute("UPDATE events SET expires_at = 0", ()).await.unwrap();

        let mut job = EventTtlSweepJob { event_store: event_store.clone() };
        job.run().await.unwrap();

        let mut rows = conn.query("SELECT COUNT(*) FROM events", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 0);
    }
}
