//! Webhook ingress: signature verification, idempotency, and the typed handler dispatch table for
//! the external payment processor's events.
//!
//! The transactional shape is authoritative: the handler runs inside one transaction that updates
//! the local projection and writes audit rows; outbound events are published only after commit,
//! never inside it, so a publish failure can never undo a write.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use libsql::Connection;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq as _;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::bus::Bus;
use crate::error::{AppError, AppResult};
use crate::event_store::EventStore;
use crate::wire::{
    EventPayload, LicenseReactivated, SubscriptionCancelled, SubscriptionPastDue, SubscriptionPaymentSucceeded,
    SubscriptionReactivated, SubscriptionUpdated,
};

type HmacSha256 = Hmac<Sha256>;

/// Signature header tolerance: a request whose `t=` timestamp is further than this from now is
/// rejected, bounding the replay window for a leaked signature.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verifies a `Stripe-Signature`-style header of the form `t=<unix>,v1=<hex hmac>`.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &str) -> AppResult<()> {
    let mut timestamp = None;
    let mut provided_sig = None;

    for part in signature_header.split(',') {
        let mut halves = part.splitn(2, '=');
        match (halves.next(), halves.next()) {
            (Some("t"), Some(v)) => timestamp = Some(v),
            (Some("v1"), Some(v)) => provided_sig = Some(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| AppError::validation("missing timestamp in signature header"))?;
    let provided_sig = provided_sig.ok_or_else(|| AppError::validation("missing v1 signature"))?;

    let ts: i64 = timestamp.parse().map_err(|_| AppError::validation("malformed signature timestamp"))?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(AppError::auth("signature timestamp outside tolerance"));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| AppError::new(crate::error::ErrorKind::Auth, e))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(provided_sig.as_bytes()).into() {
        Ok(())
    } else {
        Err(AppError::auth("signature verification failed"))
    }
}

#[derive(Debug, Deserialize)]
pub struct IncomingWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

pub struct WebhookIngress {
    pub conn: Connection,
    pub event_store: Arc<EventStore>,
    pub bus: Arc<dyn Bus>,
    pub hmac_secret: Vec<u8>,
}

/// Outcome of handling one webhook delivery, reported back to the HTTP layer for status coding.
pub enum IngestOutcome {
    Processed,
    Duplicate,
}

impl WebhookIngress {
    /// Returns `Duplicate` without touching any projection if the receipt already exists
    /// (idempotency guard via `WebhookReceipt` uniqueness).
    pub async fn ingest(&self, raw_body: &[u8], event: IncomingWebhookEvent) -> AppResult<IngestOutcome> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO webhook_receipts (external_event_id, event_type, payload)
                 VALUES (:id, :event_type, :payload)
                 ON CONFLICT (external_event_id) DO NOTHING",
                (
                    (":id", event.id.clone()),
                    (":event_type", event.event_type.clone()),
                    (":payload", String::from_utf8_lossy(raw_body).into_owned()),
                ),
            )
            .await
            .map_err(AppError::transient_store)?;

        if inserted == 0 {
            return Ok(IngestOutcome::Duplicate);
        }

        let outbound = match self.dispatch(&event).await {
            Ok(outbound) => outbound,
            Err(error) => {
                self.mark_receipt(&event.id, false, Some(&error.to_string())).await.ok();
                return Err(error);
            }
        };

        self.mark_receipt(&event.id, true, None).await.map_err(AppError::transient_store)?;

        // Publish after commit: a transport failure must never roll back a projection write.
        for (license_key, payload) in outbound {
            let envelope_id = Ulid::new().to_string();
            if let Err(error) = self.event_store.append(&envelope_id, &license_key, &payload).await {
                warn!(%error, "failed to persist outbound event, delivering best-effort only");
            }
            let envelope = crate::wire::EventEnvelope {
                id: envelope_id,
                timestamp: OffsetDateTime::now_utc(),
                license_key: license_key.clone(),
                payload,
            };
            self.bus.publish(&license_key, &envelope).await;
        }

        Ok(IngestOutcome::Processed)
    }

    async fn mark_receipt(&self, external_event_id: &str, processed: bool, error_info: Option<&str>) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE webhook_receipts SET processed = :processed, error_info = :error_info WHERE external_event_id = :id",
                (
                    (":processed", processed),
                    (":error_info", error_info.map(str::to_owned)),
                    (":id", external_event_id.to_owned()),
                ),
            )
            .await?;
        Ok(())
    }

    /// Dispatches by event type inside a single transaction. Returns the outbound events to
    /// publish once the transaction has committed.
    async fn dispatch(&self, event: &IncomingWebhookEvent) -> AppResult<Vec<(String, EventPayload)>> {
        let tx = self.conn.transaction().await.map_err(AppError::transient_store)?;

        let outbound = match event.event_type.as_str() {
            "checkout.session.completed" => {
                handlers::checkout_session_completed(&tx, &event.data, &self.hmac_secret).await?
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                handlers::subscription_upserted(&tx, &event.data).await?
            }
            "customer.subscription.deleted" => handlers::subscription_deleted(&tx, &event.data).await?,
            "invoice.payment_succeeded" => handlers::invoice_payment_succeeded(&tx, &event.data).await?,
            "invoice.payment_failed" => handlers::invoice_payment_failed(&tx, &event.data).await?,
            "customer.updated" => handlers::customer_updated(&tx, &event.data).await?,
            "customer.deleted" => handlers::customer_deleted(&tx, &event.data).await?,
            other => {
                tx.commit().await.map_err(AppError::transient_store)?;
                debug!(event_type = other, "unhandled webhook event type, receipt recorded only");
                return Ok(Vec::new());
            }
        };

        tx.commit().await.map_err(AppError::transient_store)?;
        Ok(outbound)
    }
}

mod handlers {
    use super::*;
    use libsql::Transaction;

    #[derive(Debug, Deserialize)]
    struct CheckoutSessionCompleted {
        customer: String,
        subscription: String,
        plan_id: String,
    }

    pub(super) async fn checkout_session_completed(
        tx: &Transaction,
        data: &serde_json::Value,
        hmac_secret: &[u8],
    ) -> AppResult<Vec<(String, EventPayload)>> {
        let payload: CheckoutSessionCompleted =
            serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        tx.execute(
            "INSERT INTO customers (id, email) VALUES (?1, '') ON CONFLICT (id) DO NOTHING",
            [payload.customer.clone()],
        )
        .await
        .map_err(AppError::transient_store)?;

        let subscription_id = Ulid::new().to_string();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        tx.execute(
            "INSERT INTO subscriptions
                (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end, external_subscription_id)
             VALUES (:id, :customer_id, :plan_id, 'monthly', 'active', :now, :period_end, :external_id)
             ON CONFLICT (external_subscription_id) DO NOTHING",
            (
                (":id", subscription_id.clone()),
                (":customer_id", payload.customer.clone()),
                (":plan_id", payload.plan_id.clone()),
                (":now", now),
                (":period_end", now + 30 * 86400),
                (":external_id", payload.subscription.clone()),
            ),
        )
        .await
        .map_err(AppError::transient_store)?;

        tx.execute(
            "INSERT INTO subscription_changes (id, subscription_id, to_plan_id) VALUES (?1, ?2, ?3)",
            (Ulid::new().to_string(), subscription_id.clone(), payload.plan_id.clone()),
        )
        .await
        .map_err(AppError::transient_store)?;

        let plan: license_key::Plan = serde_json::from_value(serde_json::Value::String(payload.plan_id.clone()))
            .map_err(|e| AppError::validation(e))?;

        let new_key = license_key::mint(plan, &payload.customer, hmac_secret);
        tx.execute(
            "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals)
             VALUES (:key, :customer_id, :subscription_id, :max_terminals)",
            (
                (":key", new_key),
                (":customer_id", payload.customer),
                (":subscription_id", subscription_id),
                (":max_terminals", i64::from(plan.default_max_terminals())),
            ),
        )
        .await
        .map_err(AppError::transient_store)?;

        // No outbound event: the license has no subscriber yet, the client connects afterward.
        Ok(Vec::new())
    }

    #[derive(Debug, Deserialize)]
    struct SubscriptionUpserted {
        external_subscription_id: String,
        status: String,
    }

    pub(super) async fn subscription_upserted(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        let payload: SubscriptionUpserted = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        let mut rows = tx
            .query("SELECT id, status FROM subscriptions WHERE external_subscription_id = ?1", [payload.external_subscription_id.clone()])
            .await
            .map_err(AppError::transient_store)?;

        let Some(row) = rows.next().await.map_err(AppError::transient_store)? else {
            return Err(AppError::not_found("subscription not found for external id"));
        };

        let subscription_id: String = row.get(0).map_err(AppError::transient_store)?;
        let previous_status: String = row.get(1).map_err(AppError::transient_store)?;

        tx.execute(
            "UPDATE subscriptions SET status = ?1 WHERE id = ?2",
            (payload.status.clone(), subscription_id.clone()),
        )
        .await
        .map_err(AppError::transient_store)?;

        let mut outbound = Vec::new();
        let reactivating = matches!(previous_status.as_str(), "cancelled" | "past_due")
            && matches!(payload.status.as_str(), "active" | "trialing");

        if reactivating {
            let mut license_rows = tx
                .query(
                    "SELECT license_key FROM licenses WHERE subscription_id = ?1 AND is_active = 0",
                    [subscription_id.clone()],
                )
                .await
                .map_err(AppError::transient_store)?;

            let mut licenses = Vec::new();
            while let Some(row) = license_rows.next().await.map_err(AppError::transient_store)? {
                licenses.push(row.get::<String>(0).map_err(AppError::transient_store)?);
            }

            for license_key in licenses {
                tx.execute(
                    "UPDATE licenses SET is_active = 1, revoked_at = NULL, revocation_reason = NULL WHERE license_key = ?1",
                    [license_key.clone()],
                )
                .await
                .map_err(AppError::transient_store)?;

                outbound.push((license_key, EventPayload::LicenseReactivated(LicenseReactivated { plan_id: String::new() })));
            }
        }

        for license_key in licenses_for_subscription(tx, &subscription_id).await? {
            outbound.push((license_key, EventPayload::SubscriptionUpdated(SubscriptionUpdated { status: payload.status.clone() })));
        }

        Ok(outbound)
    }

    pub(super) async fn subscription_deleted(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        #[derive(Deserialize)]
        struct Payload {
            external_subscription_id: String,
        }
        let payload: Payload = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        let mut rows = tx
            .query("SELECT id FROM subscriptions WHERE external_subscription_id = ?1", [payload.external_subscription_id])
            .await
            .map_err(AppError::transient_store)?;
        let Some(row) = rows.next().await.map_err(AppError::transient_store)? else {
            return Err(AppError::not_found("subscription not found"));
        };
        let subscription_id: String = row.get(0).map_err(AppError::transient_store)?;

        tx.execute("UPDATE subscriptions SET status = 'cancelled' WHERE id = ?1", [subscription_id.clone()])
            .await
            .map_err(AppError::transient_store)?;

        let mut outbound = Vec::new();
        for license_key in licenses_for_subscription(tx, &subscription_id).await? {
            tx.execute(
                "UPDATE licenses SET is_active = 0, revoked_at = unixepoch(), revocation_reason = 'subscription cancelled' WHERE license_key = ?1",
                [license_key.clone()],
            )
            .await
            .map_err(AppError::transient_store)?;

            outbound.push((license_key, EventPayload::SubscriptionCancelled(SubscriptionCancelled {
                cancelled_at: OffsetDateTime::now_utc(),
                cancel_immediately: true,
                grace_period_end: None,
            })));
        }

        Ok(outbound)
    }

    pub(super) async fn invoice_payment_succeeded(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        #[derive(Deserialize)]
        struct Payload {
            external_payment_id: String,
            external_subscription_id: String,
            amount_cents: i64,
        }
        let payload: Payload = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        let mut rows = tx
            .query("SELECT id, status FROM subscriptions WHERE external_subscription_id = ?1", [payload.external_subscription_id])
            .await
            .map_err(AppError::transient_store)?;
        let Some(row) = rows.next().await.map_err(AppError::transient_store)? else {
            return Err(AppError::not_found("subscription not found"));
        };
        let subscription_id: String = row.get(0).map_err(AppError::transient_store)?;
        let previous_status: String = row.get(1).map_err(AppError::transient_store)?;

        tx.execute(
            "INSERT INTO payments (id, external_payment_id, subscription_id, amount_cents, status)
             VALUES (?1, ?2, ?3, ?4, 'succeeded') ON CONFLICT (external_payment_id) DO NOTHING",
            (Ulid::new().to_string(), payload.external_payment_id, subscription_id.clone(), payload.amount_cents),
        )
        .await
        .map_err(AppError::transient_store)?;

        tx.execute("UPDATE subscriptions SET status = 'active' WHERE id = ?1", [subscription_id.clone()])
            .await
            .map_err(AppError::transient_store)?;

        let mut outbound = Vec::new();
        for license_key in licenses_for_subscription(tx, &subscription_id).await? {
            outbound.push((
                license_key.clone(),
                EventPayload::SubscriptionPaymentSucceeded(SubscriptionPaymentSucceeded { amount_cents: payload.amount_cents }),
            ));

            if previous_status == "past_due" {
                outbound.push((license_key, EventPayload::SubscriptionReactivated(SubscriptionReactivated { plan_id: String::new() })));
            }
        }

        Ok(outbound)
    }

    pub(super) async fn invoice_payment_failed(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        #[derive(Deserialize)]
        struct Payload {
            external_payment_id: String,
            external_subscription_id: String,
            amount_cents: i64,
            failure_code: Option<String>,
        }
        let payload: Payload = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        let mut rows = tx
            .query("SELECT id, status FROM subscriptions WHERE external_subscription_id = ?1", [payload.external_subscription_id])
            .await
            .map_err(AppError::transient_store)?;
        let Some(row) = rows.next().await.map_err(AppError::transient_store)? else {
            return Err(AppError::not_found("subscription not found"));
        };
        let subscription_id: String = row.get(0).map_err(AppError::transient_store)?;
        let previous_status: String = row.get(1).map_err(AppError::transient_store)?;

        tx.execute(
            "INSERT INTO payments (id, external_payment_id, subscription_id, amount_cents, status, failure_code)
             VALUES (?1, ?2, ?3, ?4, 'failed', ?5) ON CONFLICT (external_payment_id) DO NOTHING",
            (Ulid::new().to_string(), payload.external_payment_id, subscription_id.clone(), payload.amount_cents, payload.failure_code),
        )
        .await
        .map_err(AppError::transient_store)?;

        tx.execute("UPDATE subscriptions SET status = 'past_due' WHERE id = ?1", [subscription_id.clone()])
            .await
            .map_err(AppError::transient_store)?;

        let mut outbound = Vec::new();
        for license_key in licenses_for_subscription(tx, &subscription_id).await? {
            outbound.push((
                license_key.clone(),
                EventPayload::SubscriptionPastDue(SubscriptionPastDue { past_due_since: OffsetDateTime::now_utc() }),
            ));

            if previous_status != "past_due" {
                outbound.push((license_key, EventPayload::SubscriptionUpdated(SubscriptionUpdated { status: "past_due".to_owned() })));
            }
        }

        Ok(outbound)
    }

    pub(super) async fn customer_updated(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        #[derive(Deserialize)]
        struct Payload {
            id: String,
            email: String,
        }
        let payload: Payload = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        tx.execute("UPDATE customers SET email = ?1 WHERE id = ?2", (payload.email, payload.id))
            .await
            .map_err(AppError::transient_store)?;
        Ok(Vec::new())
    }

    pub(super) async fn customer_deleted(tx: &Transaction, data: &serde_json::Value) -> AppResult<Vec<(String, EventPayload)>> {
        #[derive(Deserialize)]
        struct Payload {
            id: String,
        }
        let payload: Payload = serde_json::from_value(data.clone()).map_err(|e| AppError::validation(e))?;

        tx.execute("UPDATE customers SET deleted_at = unixepoch() WHERE id = ?1", [payload.id.clone()])
            .await
            .map_err(AppError::transient_store)?;

        let mut sub_rows = tx
            .query("SELECT id FROM subscriptions WHERE customer_id = ?1", [payload.id])
            .await
            .map_err(AppError::transient_store)?;

        let mut subscription_ids = Vec::new();
        while let Some(row) = sub_rows.next().await.map_err(AppError::transient_store)? {
            subscription_ids.push(row.get::<String>(0).map_err(AppError::transient_store)?);
        }

        for subscription_id in subscription_ids {
            tx.execute("UPDATE subscriptions SET status = 'cancelled' WHERE id = ?1", [subscription_id.clone()])
                .await
                .map_err(AppError::transient_store)?;
            tx.execute(
                "UPDATE licenses SET is_active = 0, revoked_at = unixepoch(), revocation_reason = 'customer deleted' WHERE subscription_id = ?1",
                [subscription_id],
            )
            .await
            .map_err(AppError::transient_store)?;
        }

        Ok(Vec::new())
    }

    /// Outbound events are keyed by license, but the payment-processor payload only carries the
    /// subscription id; this resolves the currently active licenses for it. A subscription can
    /// have zero (mid-checkout, before `checkout_session_completed` commits its license insert)
    /// or more than one (a plan change that hasn't fully migrated activations yet) active license.
    async fn licenses_for_subscription(tx: &Transaction, subscription_id: &str) -> AppResult<Vec<String>> {
        let mut rows = tx
            .query("SELECT license_key FROM licenses WHERE subscription_id = ?1 AND is_active = 1", [subscription_id.to_owned()])
            .await
            .map_err(AppError::transient_store)?;

        let mut license_keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(AppError::transient_store)? {
            license_keys.push(row.get::<String>(0).map_err(AppError::transient_store)?);
        }

        Ok(license_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verify_signature_accepts_a_freshly_signed_payload() {
        let secret = "whsec_test";
        let payload = b"{\"id\":\"evt_1\"}";
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let header = sign(payload, secret, now);

        assert!(verify_signature(payload, &header, secret).is_ok());
    }

    #[test]
    fn verify_signature_rejects_stale_timestamp() {
        let secret = "whsec_test";
        let payload = b"{}";
        let header = sign(payload, secret, 0);

        assert!(verify_signature(payload, &header, secret).is_err());
    }

    #[test]
    fn verify_signature_rejects_tampered_payload() {
        let secret = "whsec_test";
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let header = sign(b"{\"id\":\"evt_1\"}", secret, now);

        assert!(verify_signature(b"{\"id\":\"evt_2\"}", &header, secret).is_err());
    }

    #[tokio::test]
    async fn duplicate_webhook_is_a_no_op_on_the_second_delivery() {
        let conn = crate::db::connect(":memory:").await.unwrap();
        let event_store = Arc::new(EventStore::new(conn.clone(), time::Duration::hours(24)));
        let bus: Arc<dyn Bus> = Arc::new(crate::bus::InProcessBus::default());
        let ingress = WebhookIngress { conn, event_store, bus, hmac_secret: b"test-license-secret".to_vec() };

        let event = IncomingWebhookEvent {
            id: "evt_1".to_owned(),
            event_type: "customer.updated".to_owned(),
            data: serde_json::json!({ "id": "cust_1", "email": "a@example.com" }),
        };

        ingress.conn.execute("INSERT INTO customers (id, email) VALUES ('cust_1', '')", ()).await.unwrap();

        let first = ingress.ingest(b"{}", IncomingWebhookEvent { id: event.id.clone(), event_type: event.event_type.clone(), data: event.data.clone() }).await.unwrap();
        assert!(matches!(first, IngestOutcome::Processed));

        let second = ingress.ingest(b"{}", event).await.unwrap();
        assert!(matches!(second, IngestOutcome::Duplicate));
    }

    #[tokio::test]
    async fn checkout_session_completed_issues_a_license_for_the_new_subscription() {
        let conn = crate::db::connect(":memory:").await.unwrap();
        let event_store = Arc::new(EventStore::new(conn.clone(), time::Duration::hours(24)));
        let bus: Arc<dyn Bus> = Arc::new(crate::bus::InProcessBus::default());
        let ingress = WebhookIngress { conn, event_store, bus, hmac_secret: b"test-license-secret".to_vec() };

        let event = IncomingWebhookEvent {
            id: "evt_checkout_1".to_owned(),
            event_type: "checkout.session.completed".to_owned(),
            data: serde_json::json!({ "customer": "cust_1", "subscription": "sub_ext_1", "plan_id": "pro" }),
        };

        let outcome = ingress.ingest(b"{}", event).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Processed));

        let mut rows = ingress
            .conn
            .query(
                "SELECT l.license_key, l.max_terminals FROM licenses l
                 JOIN subscriptions s ON s.id = l.subscription_id
                 WHERE s.external_subscription_id = 'sub_ext_1' AND l.is_active = 1",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().expect("a license should have been minted");
        let license_key: String = row.get(0).unwrap();
        let max_terminals: i64 = row.get(1).unwrap();

        assert!(license_key.starts_with("AUR-PRO-"));
        assert_eq!(max_terminals, i64::from(license_key::Plan::Pro.default_max_terminals()));
    }
}
