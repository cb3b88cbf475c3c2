//! Offline classifier over acknowledgement failure text.
//!
//! Runs against a configurable window of [`crate::ack_ledger::AckLedger`] failures, groups by
//! license key, and upserts a [`crate::models::FailurePatternRow`] per detected category. This is
//! read-only with respect to deliveries — it never touches the event store or the bus, only the
//! `acknowledgements` and `failure_patterns` tables.

use libsql::Connection;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

use crate::ack_ledger::AckLedger;
use crate::models::{FailurePatternRow, PatternSeverity};

const BURST_THRESHOLD: usize = 5;
const BURST_WINDOW: Duration = Duration::minutes(5);
const TIMEOUT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternKind {
    Burst,
    Timeout,
    NetworkError,
    ParsingValidation,
    RateLimit,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::Burst => "burst",
            PatternKind::Timeout => "timeout",
            PatternKind::NetworkError => "network_error",
            PatternKind::ParsingValidation => "parsing_validation",
            PatternKind::RateLimit => "rate_limit",
        }
    }

    fn severity(self) -> PatternSeverity {
        match self {
            PatternKind::Burst => PatternSeverity::High,
            PatternKind::NetworkError => PatternSeverity::High,
            PatternKind::RateLimit => PatternSeverity::Medium,
            PatternKind::Timeout => PatternSeverity::Medium,
            PatternKind::ParsingValidation => PatternSeverity::Low,
        }
    }
}

fn matches_timeout(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("timeout") || m.contains("timed out")
}

fn matches_network_error(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("dns") || m.contains("refused") || m.contains("unreachable")
}

fn matches_parsing(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("parse") || m.contains("invalid") || m.contains("validation") || m.contains("malformed")
}

fn matches_rate_limit(message: &str) -> bool {
    message.contains("429") || message.to_lowercase().contains("too many")
}

pub struct PatternAnalyzer {
    pub conn: Connection,
    pub ack_ledger: AckLedger,
}

#[derive(Debug, Default)]
pub struct AnalysisSummary {
    pub licenses_considered: usize,
    pub patterns_detected: usize,
}

impl PatternAnalyzer {
    /// Scans failures since `window_start`, grouped by license, detecting the five
    /// categories. A license can trigger more than one category in the same pass.
    pub async fn analyze(&self, window_start: OffsetDateTime) -> anyhow::Result<AnalysisSummary> {
        let failures = self.ack_ledger.failures_since(window_start.unix_timestamp()).await?;

        let mut by_license: std::collections::HashMap<String, Vec<(OffsetDateTime, String)>> = std::collections::HashMap::new();
        for failure in failures {
            let at = OffsetDateTime::from_unix_timestamp(failure.acknowledged_at).unwrap_or(window_start);
            let message = failure.error_message.unwrap_or_default();
            by_license.entry(failure.license_key).or_default().push((at, message));
        }

        let mut summary = AnalysisSummary::default();

        for (license_key, entries) in by_license {
            summary.licenses_considered += 1;
            let mut detected = Vec::new();

            if has_burst(&entries) {
                detected.push(PatternKind::Burst);
            }
            if entries.iter().filter(|(_, m)| matches_timeout(m)).count() >= TIMEOUT_THRESHOLD {
                detected.push(PatternKind::Timeout);
            }
            if entries.iter().any(|(_, m)| matches_network_error(m)) {
                detected.push(PatternKind::NetworkError);
            }
            if entries.iter().any(|(_, m)| matches_parsing(m)) {
                detected.push(PatternKind::ParsingValidation);
            }
            if entries.iter().any(|(_, m)| matches_rate_limit(m)) {
                detected.push(PatternKind::RateLimit);
            }

            for kind in detected {
                self.upsert_pattern(&license_key, kind).await?;
                summary.patterns_detected += 1;
            }
        }

        Ok(summary)
    }

    async fn upsert_pattern(&self, license_key: &str, kind: PatternKind) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO failure_patterns (id, license_key, pattern_kind, severity_tier, occurrence_count)
                 VALUES (:id, :license_key, :kind, :severity, 1)
                 ON CONFLICT (license_key, pattern_kind) DO UPDATE SET
                     occurrence_count = occurrence_count + 1,
                     last_seen_at = unixepoch(),
                     severity_tier = excluded.severity_tier",
                (
                    (":id", Ulid::new().to_string()),
                    (":license_key", license_key.to_owned()),
                    (":kind", kind.as_str().to_owned()),
                    (":severity", kind.severity().as_str().to_owned()),
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn resolve(&self, license_key: &str, pattern_kind: &str, notes: Option<&str>) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE failure_patterns SET resolved_at = unixepoch(), resolution_notes = :notes
                 WHERE license_key = :license_key AND pattern_kind = :kind",
                (
                    (":notes", notes.map(str::to_owned)),
                    (":license_key", license_key.to_owned()),
                    (":kind", pattern_kind.to_owned()),
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn list_unresolved(&self, license_key: &str) -> anyhow::Result<Vec<FailurePatternRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, license_key, pattern_kind, severity_tier, occurrence_count, first_seen_at, last_seen_at, resolved_at, resolution_notes
                 FROM failure_patterns WHERE license_key = ?1 AND resolved_at IS NULL",
                [license_key],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(libsql::de::from_row(&row)?);
        }
        Ok(out)
    }
}

/// At least [`BURST_THRESHOLD`] failures within any [`BURST_WINDOW`]-wide slice of the entries.
fn has_burst(entries: &[(OffsetDateTime, String)]) -> bool {
    if entries.len() < BURST_THRESHOLD {
        return false;
    }
    let mut timestamps: Vec<OffsetDateTime> = entries.iter().map(|(at, _)| *at).collect();
    timestamps.sort();

    timestamps
        .windows(BURST_THRESHOLD)
        .any(|window| window[window.len() - 1] - window[0] <= BURST_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{AckFrame, AckStatus};

    async fn analyzer() -> PatternAnalyzer {
        let conn = crate::db::connect(":memory:").await.unwrap();
        conn.execute(
            "INSERT INTO events (event_id, license_key, event_type, payload, expires_at) VALUES ('e1', 'AUR-PRO-V2-X', 't', '{}', 9999999999)",
            (),
        )
        .await
        .unwrap();
        let ack_ledger = AckLedger::new(conn.clone());
        PatternAnalyzer { conn, ack_ledger }
    }

    async fn record_failure(analyzer: &PatternAnalyzer, terminal: &str, message: &str) {
        analyzer
            .ack_ledger
            .record(
                "AUR-PRO-V2-X",
                terminal,
                &AckFrame {
                    event_id: "e1".to_owned(),
                    status: AckStatus::Failed,
                    error_message: Some(message.to_owned()),
                    processing_time_ms: 1,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn five_quick_failures_trigger_a_burst_pattern() {
        let analyzer = analyzer().await;
        for i in 0..5 {
            record_failure(&analyzer, &format!("term{i}"), "connection reset").await;
        }

        let summary = analyzer.analyze(OffsetDateTime::UNIX_EPOCH).await.unwrap();
        assert_eq!(summary.licenses_considered, 1);

        let patterns = analyzer.list_unresolved("AUR-PRO-V2-X").await.unwrap();
        assert!(patterns.iter().any(|p| p.pattern_kind == "burst"));
    }

    #[tokio::test]
    async fn timeout_keyword_requires_at_least_three_occurrences() {
        let analyzer = analyzer().await;
        record_failure(&analyzer, "term1", "request timed out").await;
        record_failure(&analyzer, "term1", "connection timeout").await;

        analyzer.analyze(OffsetDateTime::UNIX_EPOCH).await.unwrap();
        let patterns = analyzer.list_unresolved("AUR-PRO-V2-X").await.unwrap();
        assert!(!patterns.iter().any(|p| p.pattern_kind == "timeout"));

        record_failure(&analyzer, "term1", "timeout waiting for ack").await;
        analyzer.analyze(OffsetDateTime::UNIX_EPOCH).await.unwrap();
        let patterns = analyzer.list_unresolved("AUR-PRO-V2-X").await.unwrap();
        assert!(patterns.iter().any(|p| p.pattern_kind == "timeout"));
    }

    #[tokio::test]
    async fn resolving_a_pattern_clears_it_from_the_unresolved_list() {
        let analyzer = analyzer().await;
        record_failure(&analyzer, "term1", "DNS resolution failed").await;
        analyzer.analyze(OffsetDateTime::UNIX_EPOCH).await.unwrap();
        assert!(!analyzer.list_unresolved("AUR-PRO-V2-X").await.unwrap().is_empty());

        analyzer.resolve("AUR-PRO-V2-X", "network_error", Some("ISP outage, confirmed resolved")).await.unwrap();
        assert!(analyzer.list_unresolved("AUR-PRO-V2-X").await.unwrap().is_empty());
    }
}
