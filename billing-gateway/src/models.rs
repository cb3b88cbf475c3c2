//! Row types mirroring the tables created in [`crate::db`]. These are thin: the business logic
//! lives in each component module, not here.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

fn from_unix(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub license_key: String,
    pub event_type: String,
    pub payload: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl EventRow {
    pub fn created_at(&self) -> OffsetDateTime {
        from_unix(self.created_at)
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        from_unix(self.expires_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Failed,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Success => "success",
            AckStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcknowledgementRow {
    pub id: String,
    pub event_id: String,
    pub license_key: String,
    pub terminal_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
    pub acknowledged_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryResult {
    Success,
    Failed,
    Timeout,
}

impl RetryResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryResult::Success => "success",
            RetryResult::Failed => "failed",
            RetryResult::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryAttemptRow {
    pub id: String,
    pub event_id: String,
    pub attempt_number: i64,
    pub result: String,
    pub error_message: Option<String>,
    pub next_retry_at: Option<i64>,
    pub backoff_delay_ms: Option<i64>,
    pub attempted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqStatus {
    PendingReview,
    Retrying,
    Resolved,
    Abandoned,
}

impl DlqStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqStatus::PendingReview => "pending_review",
            DlqStatus::Retrying => "retrying",
            DlqStatus::Resolved => "resolved",
            DlqStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub event_id: String,
    pub license_key: String,
    pub event_type: String,
    pub payload: String,
    pub original_created_at: i64,
    pub retry_count: i64,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<i64>,
    pub status: String,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
    pub failed_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookReceiptRow {
    pub external_event_id: String,
    pub event_type: String,
    pub payload: String,
    pub processed: bool,
    pub error_info: Option<String>,
    pub received_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRow {
    pub id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub billing_cycle: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    pub external_subscription_id: String,
    pub plan_change_count: i64,
}

impl SubscriptionRow {
    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status)
    }

    pub fn canceled_at(&self) -> Option<OffsetDateTime> {
        self.canceled_at.map(from_unix)
    }

    pub fn trial_end(&self) -> Option<OffsetDateTime> {
        self.trial_end.map(from_unix)
    }

    pub fn current_period_end(&self) -> OffsetDateTime {
        from_unix(self.current_period_end)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseRow {
    pub license_key: String,
    pub customer_id: String,
    pub subscription_id: String,
    pub max_terminals: i64,
    pub activation_count: i64,
    pub is_active: bool,
    pub revoked_at: Option<i64>,
    pub revocation_reason: Option<String>,
    pub issued_at: i64,
    pub expires_at: Option<i64>,
}

impl LicenseRow {
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at.map(from_unix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationRow {
    pub id: String,
    pub license_key: String,
    pub machine_id_hash: String,
    pub terminal_name: String,
    pub first_activation: i64,
    pub last_heartbeat: Option<i64>,
    pub is_active: bool,
    pub ip_address: Option<String>,
    pub location: Option<String>,
}

impl ActivationRow {
    pub fn first_activation(&self) -> OffsetDateTime {
        from_unix(self.first_activation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSeverity {
    Low,
    Medium,
    High,
}

impl PatternSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternSeverity::Low => "low",
            PatternSeverity::Medium => "medium",
            PatternSeverity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePatternRow {
    pub id: String,
    pub license_key: String,
    pub pattern_kind: String,
    pub severity_tier: String,
    pub occurrence_count: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
}
