//! Streaming wire protocol types: the envelope, the closed set of event payloads, the
//! client ack frame and the connect-time handshake.
//!
//! The envelope is adjacently tagged (`type` names the variant, `data` holds its payload) so the
//! JSON on the wire is exactly `{id, type, timestamp, licenseKey, data:{...}}` without any manual
//! (de)serialization code.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "licenseKey")]
    pub license_key: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "subscription_cancelled")]
    SubscriptionCancelled(SubscriptionCancelled),
    #[serde(rename = "subscription_reactivated")]
    SubscriptionReactivated(SubscriptionReactivated),
    #[serde(rename = "subscription_updated")]
    SubscriptionUpdated(SubscriptionUpdated),
    #[serde(rename = "subscription_past_due")]
    SubscriptionPastDue(SubscriptionPastDue),
    #[serde(rename = "subscription_payment_succeeded")]
    SubscriptionPaymentSucceeded(SubscriptionPaymentSucceeded),
    #[serde(rename = "license_revoked")]
    LicenseRevoked(LicenseRevoked),
    #[serde(rename = "license_reactivated")]
    LicenseReactivated(LicenseReactivated),
    #[serde(rename = "plan_changed")]
    PlanChanged(PlanChanged),
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck(HeartbeatAck),
    #[serde(rename = "terminal_added")]
    TerminalAdded(TerminalAdded),
    #[serde(rename = "terminal_removed")]
    TerminalRemoved(TerminalRemoved),
    #[serde(rename = "terminal_reconnected")]
    TerminalReconnected(TerminalReconnected),
    #[serde(rename = "primary_changed")]
    PrimaryChanged(PrimaryChanged),
    #[serde(rename = "state_sync")]
    StateSync(StateSync),
    #[serde(rename = "deactivation_broadcast")]
    DeactivationBroadcast(DeactivationBroadcast),
}

impl EventPayload {
    /// The `type` discriminant as it appears on the wire, used both for the SSE `event:` field
    /// and for persisting [`crate::models::Event::event_type`].
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::SubscriptionCancelled(_) => "subscription_cancelled",
            EventPayload::SubscriptionReactivated(_) => "subscription_reactivated",
            EventPayload::SubscriptionUpdated(_) => "subscription_updated",
            EventPayload::SubscriptionPastDue(_) => "subscription_past_due",
            EventPayload::SubscriptionPaymentSucceeded(_) => "subscription_payment_succeeded",
            EventPayload::LicenseRevoked(_) => "license_revoked",
            EventPayload::LicenseReactivated(_) => "license_reactivated",
            EventPayload::PlanChanged(_) => "plan_changed",
            EventPayload::HeartbeatAck(_) => "heartbeat_ack",
            EventPayload::TerminalAdded(_) => "terminal_added",
            EventPayload::TerminalRemoved(_) => "terminal_removed",
            EventPayload::TerminalReconnected(_) => "terminal_reconnected",
            EventPayload::PrimaryChanged(_) => "primary_changed",
            EventPayload::StateSync(_) => "state_sync",
            EventPayload::DeactivationBroadcast(_) => "deactivation_broadcast",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCancelled {
    #[serde(with = "time::serde::rfc3339")]
    pub cancelled_at: OffsetDateTime,
    pub cancel_immediately: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionReactivated {
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpdated {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPastDue {
    #[serde(with = "time::serde::rfc3339")]
    pub past_due_since: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPaymentSucceeded {
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRevoked {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseReactivated {
    pub plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChanged {
    pub new_license_key: String,
    pub new_plan_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalAdded {
    pub terminal_id: String,
    pub terminal_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRemoved {
    pub terminal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalReconnected {
    pub terminal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryChanged {
    pub terminal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSync {
    pub active_terminal_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivationBroadcast {
    pub terminal_id: String,
    pub immediate_disable: bool,
}

/// Client-to-server ack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckFrame {
    pub event_id: String,
    pub status: AckStatus,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Failed,
}

/// Connect-time handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeFrame {
    pub license_key: String,
    pub last_seen_event_id: Option<String>,
    pub terminal_id: String,
}

/// Renders one envelope as a server-sent-events frame: `id: ...\nevent: ...\ndata: ...\n\n`.
pub fn render_sse_frame(envelope: &EventEnvelope) -> anyhow::Result<String> {
    let data = serde_json::to_string(envelope)?;
    Ok(format!("id: {}\nevent: {}\ndata: {data}\n\n", envelope.id, envelope.payload.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_to_the_documented_shape() {
        let envelope = EventEnvelope {
            id: "evt_1".to_owned(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            license_key: "AUR-PRO-V2-ABCDEFGH-11223344".to_owned(),
            payload: EventPayload::SubscriptionCancelled(SubscriptionCancelled {
                cancelled_at: OffsetDateTime::UNIX_EPOCH,
                cancel_immediately: true,
                grace_period_end: None,
            }),
        };

        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["id"], "evt_1");
        assert_eq!(value["type"], "subscription_cancelled");
        assert_eq!(value["licenseKey"], "AUR-PRO-V2-ABCDEFGH-11223344");
        assert_eq!(value["data"]["cancel_immediately"], true);
    }

    #[test]
    fn sse_frame_has_three_lines_and_a_blank_terminator() {
        let envelope = EventEnvelope {
            id: "evt_2".to_owned(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            license_key: "AUR-BAS-V2-ABCDEFGH-11223344".to_owned(),
            payload: EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 0 }),
        };

        let frame = render_sse_frame(&envelope).unwrap();
        assert!(frame.starts_with("id: evt_2\nevent: heartbeat_ack\ndata: "));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn ack_frame_round_trips_through_json() {
        let json = r#"{"event_id":"evt_1","status":"success","error_message":null,"processing_time_ms":12}"#;
        let ack: AckFrame = serde_json::from_str(json).unwrap();
        assert_eq!(ack.status, AckStatus::Success);
    }
}
