//! Process configuration, sourced entirely from environment variables.
//!
//! Unlike a hot-reloadable file-backed configuration, the values here are fixed for the
//! lifetime of the process: rotating a webhook secret or changing a grace period is an
//! operational action that warrants a restart, not a live config push.

use std::env;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;

const DEFAULT_GRACE_PERIOD_DAYS_PAID: i64 = 7;
const DEFAULT_GRACE_PERIOD_DAYS_PAST_DUE: i64 = 3;
const DEFAULT_EVENT_TTL_HOURS: i64 = 24;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_DEACTIVATIONS_PER_YEAR: u32 = 3;
const DEFAULT_MAX_TRIAL_PLAN_CHANGES: u32 = 4;

/// Immutable, process-wide configuration handle. Cheaply cloneable (an `Arc` underneath).
#[derive(Clone)]
pub struct ConfHandle(Arc<Conf>);

impl ConfHandle {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self(Arc::new(Conf::from_env()?)))
    }

    #[doc(hidden)]
    pub fn mock_for_tests(database_url: &str) -> Self {
        Self(Arc::new(Conf {
            database_url: database_url.to_owned(),
            job_queue_database_url: ":memory:".to_owned(),
            pubsub_url: None,
            webhook_signing_secret: "test-webhook-secret".to_owned(),
            license_hmac_secret: b"test-license-secret".to_vec(),
            grace_period_days_paid: DEFAULT_GRACE_PERIOD_DAYS_PAID,
            grace_period_days_past_due: DEFAULT_GRACE_PERIOD_DAYS_PAST_DUE,
            event_ttl_hours: DEFAULT_EVENT_TTL_HOURS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_deactivations_per_year: DEFAULT_MAX_DEACTIVATIONS_PER_YEAR,
            max_trial_plan_changes: DEFAULT_MAX_TRIAL_PLAN_CHANGES,
            log_path: Utf8PathBuf::from("./billing-gateway.log"),
            bind_address: "127.0.0.1:8080".to_owned(),
        }))
    }

    pub fn get(&self) -> Arc<Conf> {
        Arc::clone(&self.0)
    }
}

#[derive(Debug)]
pub struct Conf {
    pub database_url: String,
    /// Separate database from `database_url`: the job queue keeps its own `user_version`-tracked
    /// migrations (see `event-queue-libsql`), which would collide with the application schema's
    /// migration counter if both lived in the same file.
    pub job_queue_database_url: String,
    /// Cross-instance pub/sub transport URL. `None` selects the in-process fallback.
    pub pubsub_url: Option<String>,
    pub webhook_signing_secret: String,
    pub license_hmac_secret: Vec<u8>,
    pub grace_period_days_paid: i64,
    pub grace_period_days_past_due: i64,
    pub event_ttl_hours: i64,
    pub max_retry_attempts: u32,
    pub max_deactivations_per_year: u32,
    pub max_trial_plan_changes: u32,
    pub log_path: Utf8PathBuf,
    pub bind_address: String,
}

impl Conf {
    fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let job_queue_database_url =
            env::var("JOB_QUEUE_DATABASE_URL").unwrap_or_else(|_| "file:billing-gateway-jobs.db3".to_owned());
        let webhook_signing_secret = env::var("WEBHOOK_SIGNING_SECRET").context("WEBHOOK_SIGNING_SECRET is required")?;
        let license_hmac_secret = env::var("LICENSE_HMAC_SECRET")
            .context("LICENSE_HMAC_SECRET is required")?
            .into_bytes();

        let pubsub_url = env::var("PUBSUB_URL").ok().filter(|value| !value.is_empty());

        Ok(Self {
            database_url,
            job_queue_database_url,
            pubsub_url,
            webhook_signing_secret,
            license_hmac_secret,
            grace_period_days_paid: parse_env_or("GRACE_PERIOD_DAYS_PAID", DEFAULT_GRACE_PERIOD_DAYS_PAID)?,
            grace_period_days_past_due: parse_env_or("GRACE_PERIOD_DAYS_PAST_DUE", DEFAULT_GRACE_PERIOD_DAYS_PAST_DUE)?,
            event_ttl_hours: parse_env_or("EVENT_TTL_HOURS", DEFAULT_EVENT_TTL_HOURS)?,
            max_retry_attempts: parse_env_or("MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)?,
            max_deactivations_per_year: parse_env_or("MAX_DEACTIVATIONS_PER_YEAR", DEFAULT_MAX_DEACTIVATIONS_PER_YEAR)?,
            max_trial_plan_changes: parse_env_or("MAX_TRIAL_PLAN_CHANGES", DEFAULT_MAX_TRIAL_PLAN_CHANGES)?,
            log_path: env::var("LOG_PATH")
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|_| Utf8PathBuf::from("./billing-gateway.log")),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("failed to read {key}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_conf_carries_expected_defaults() {
        let handle = ConfHandle::mock_for_tests(":memory:");
        let conf = handle.get();
        assert_eq!(conf.max_retry_attempts, DEFAULT_MAX_RETRY_ATTEMPTS);
        assert_eq!(conf.grace_period_days_paid, DEFAULT_GRACE_PERIOD_DAYS_PAID);
        assert!(conf.pubsub_url.is_none());
    }
}
