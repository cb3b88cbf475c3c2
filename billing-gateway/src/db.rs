//! Connection setup and schema migration for the relational store.
//!
//! Same PRAGMA tuning and `user_version`-tracked migration approach as the job queue crate:
//! WAL journal, a single append-only migration list, no down-migrations.

use anyhow::Context as _;
use libsql::Connection;

pub async fn connect(database_url: &str) -> anyhow::Result<Connection> {
    let db = if let Some(path) = database_url.strip_prefix("file:") {
        libsql::Builder::new_local(path).build().await.context("failed to open local database")?
    } else if database_url == ":memory:" {
        libsql::Builder::new_local(":memory:").build().await.context("failed to open in-memory database")?
    } else {
        libsql::Builder::new_remote(database_url.to_owned(), String::new())
            .build()
            .await
            .context("failed to open remote database")?
    };

    let conn = db.connect().context("failed to open connection")?;
    apply_pragmas(&conn).await?;
    migrate(&conn).await?;
    Ok(conn)
}

async fn apply_pragmas(conn: &Connection) -> anyhow::Result<()> {
    const PRAGMAS: &str = "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 15000;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -3000;
        PRAGMA temp_store = MEMORY;
    ";

    trace!(sql_query = %PRAGMAS, "PRAGMAs query");

    let mut batch_rows = conn.execute_batch(PRAGMAS).await.context("failed to batch execute SQL query")?;
    while let Some(rows) = batch_rows.next_stmt_row() {
        let Some(mut rows) = rows else { continue };
        while let Ok(Some(row)) = rows.next().await {
            trace!(?row, "PRAGMA row");
        }
    }

    Ok(())
}

async fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let user_version = query_user_version(conn).await?;

    match MIGRATIONS.get(user_version..) {
        Some(remaining) if !remaining.is_empty() => {
            info!(user_version, migration_count = MIGRATIONS.len() - user_version, "Start migration");

            for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                trace!(migration_id, %sql_query, "Apply migration");

                conn.execute_batch(sql_query)
                    .await
                    .with_context(|| format!("failed to execute migration {migration_id}"))?;

                update_user_version(conn, migration_id + 1).await.context("failed to update user version")?;
            }

            info!("Migration complete");
        }
        None => warn!(user_version, "user_version is set to an unexpected value"),
        _ => debug!(user_version, "Database is already up to date"),
    }

    Ok(())
}

async fn query_user_version(conn: &Connection) -> anyhow::Result<usize> {
    let row = conn
        .query("PRAGMA user_version", ())
        .await
        .context("failed to execute SQL query")?
        .next()
        .await
        .context("failed to read the row")?
        .context("no row returned")?;

    let value = row.get::<u64>(0).context("failed to read user_version value")?;
    Ok(usize::try_from(value).expect("number not too big"))
}

async fn update_user_version(conn: &Connection, value: usize) -> anyhow::Result<()> {
    let value = u64::try_from(value).expect("number not too big");
    conn.execute(&format!("PRAGMA user_version = {value}"), ())
        .await
        .context("failed to execute SQL query")?;
    Ok(())
}

/// Typically, migrations should not be modified once released; only append to this list.
const MIGRATIONS: &[&str] = &[
    // Migration 0: customers, subscriptions, licenses, activations.
    "CREATE TABLE customers (
        id TEXT NOT NULL PRIMARY KEY,
        email TEXT NOT NULL,
        deleted_at INT,
        created_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE TABLE subscriptions (
        id TEXT NOT NULL PRIMARY KEY,
        customer_id TEXT NOT NULL REFERENCES customers(id),
        plan_id TEXT NOT NULL,
        billing_cycle TEXT NOT NULL,
        status TEXT NOT NULL,
        current_period_start INT NOT NULL,
        current_period_end INT NOT NULL,
        cancel_at_period_end INT NOT NULL DEFAULT 0,
        canceled_at INT,
        trial_start INT,
        trial_end INT,
        external_subscription_id TEXT NOT NULL UNIQUE,
        plan_change_count INT NOT NULL DEFAULT 0,
        created_at INT NOT NULL DEFAULT (unixepoch()),
        updated_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_subscriptions_customer ON subscriptions(customer_id);
    CREATE INDEX idx_subscriptions_status ON subscriptions(status);

    CREATE TABLE subscription_changes (
        id TEXT NOT NULL PRIMARY KEY,
        subscription_id TEXT NOT NULL REFERENCES subscriptions(id),
        from_plan_id TEXT,
        to_plan_id TEXT NOT NULL,
        proration_cents INT,
        created_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE TABLE payments (
        id TEXT NOT NULL PRIMARY KEY,
        external_payment_id TEXT NOT NULL UNIQUE,
        subscription_id TEXT NOT NULL REFERENCES subscriptions(id),
        amount_cents INT NOT NULL,
        status TEXT NOT NULL,
        failure_code TEXT,
        created_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE TABLE licenses (
        license_key TEXT NOT NULL PRIMARY KEY,
        customer_id TEXT NOT NULL REFERENCES customers(id),
        subscription_id TEXT NOT NULL REFERENCES subscriptions(id),
        max_terminals INT NOT NULL,
        activation_count INT NOT NULL DEFAULT 0,
        is_active INT NOT NULL DEFAULT 1,
        revoked_at INT,
        revocation_reason TEXT,
        issued_at INT NOT NULL DEFAULT (unixepoch()),
        expires_at INT,
        updated_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_licenses_customer ON licenses(customer_id);
    CREATE INDEX idx_licenses_subscription ON licenses(subscription_id);

    CREATE TABLE activations (
        id TEXT NOT NULL PRIMARY KEY,
        license_key TEXT NOT NULL REFERENCES licenses(license_key),
        machine_id_hash TEXT NOT NULL,
        terminal_name TEXT NOT NULL,
        first_activation INT NOT NULL DEFAULT (unixepoch()),
        last_heartbeat INT,
        is_active INT NOT NULL DEFAULT 1,
        ip_address TEXT,
        location TEXT,
        deactivated_at INT
    ) STRICT;

    CREATE INDEX idx_activations_license_machine ON activations(license_key, machine_id_hash);

    CREATE UNIQUE INDEX idx_activations_active_once
        ON activations(license_key, machine_id_hash) WHERE is_active = 1;

    CREATE TABLE deactivation_log (
        license_key TEXT NOT NULL REFERENCES licenses(license_key),
        deactivated_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_deactivation_log_license ON deactivation_log(license_key, deactivated_at);

    CREATE TRIGGER update_licenses_updated_at AFTER UPDATE ON licenses
    BEGIN
        UPDATE licenses SET updated_at = unixepoch() WHERE license_key == NEW.license_key;
    END;

    CREATE TRIGGER update_subscriptions_updated_at AFTER UPDATE ON subscriptions
    BEGIN
        UPDATE subscriptions SET updated_at = unixepoch() WHERE id == NEW.id;
    END;",
    // Migration 1: event store, acknowledgements, retry attempts, dead letters, webhook receipts.
    "CREATE TABLE events (
        event_id TEXT NOT NULL PRIMARY KEY,
        license_key TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INT NOT NULL DEFAULT (unixepoch()),
        expires_at INT NOT NULL
    ) STRICT;

    CREATE INDEX idx_events_license_key_created_at ON events(license_key, created_at);
    CREATE INDEX idx_events_expires_at ON events(expires_at);

    CREATE TABLE acknowledgements (
        id TEXT NOT NULL PRIMARY KEY,
        event_id TEXT NOT NULL REFERENCES events(event_id),
        license_key TEXT NOT NULL,
        terminal_id TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        processing_time_ms INT NOT NULL DEFAULT 0,
        acknowledged_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_acknowledgements_event ON acknowledgements(event_id);

    CREATE UNIQUE INDEX idx_acknowledgements_success_once
        ON acknowledgements(event_id, terminal_id) WHERE status = 'success';

    CREATE TABLE retry_attempts (
        id TEXT NOT NULL PRIMARY KEY,
        event_id TEXT NOT NULL REFERENCES events(event_id),
        attempt_number INT NOT NULL,
        result TEXT NOT NULL,
        error_message TEXT,
        next_retry_at INT,
        backoff_delay_ms INT,
        attempted_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_retry_attempts_event_attempt ON retry_attempts(event_id, attempt_number);

    CREATE TABLE dead_letter_entries (
        event_id TEXT NOT NULL PRIMARY KEY REFERENCES events(event_id),
        license_key TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        original_created_at INT NOT NULL,
        retry_count INT NOT NULL,
        last_error_message TEXT,
        last_error_at INT,
        status TEXT NOT NULL,
        resolved_by TEXT,
        resolved_at INT,
        resolution_notes TEXT,
        failed_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE INDEX idx_dead_letter_status_failed_at ON dead_letter_entries(status, failed_at);

    CREATE TABLE webhook_receipts (
        external_event_id TEXT NOT NULL PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        processed INT NOT NULL DEFAULT 0,
        error_info TEXT,
        received_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE TABLE failure_patterns (
        id TEXT NOT NULL PRIMARY KEY,
        license_key TEXT NOT NULL,
        pattern_kind TEXT NOT NULL,
        severity_tier TEXT NOT NULL,
        occurrence_count INT NOT NULL DEFAULT 1,
        first_seen_at INT NOT NULL DEFAULT (unixepoch()),
        last_seen_at INT NOT NULL DEFAULT (unixepoch()),
        resolved_at INT,
        resolution_notes TEXT
    ) STRICT;

    CREATE UNIQUE INDEX idx_failure_patterns_license_kind
        ON failure_patterns(license_key, pattern_kind);",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_in_memory_db_runs_migrations() {
        let conn = connect(":memory:").await.unwrap();
        let mut rows = conn.query("SELECT COUNT(*) FROM licenses", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn acknowledgement_uniqueness_is_enforced_only_for_success() {
        let conn = connect(":memory:").await.unwrap();
        conn.execute(
            "INSERT INTO events (event_id, license_key, event_type, payload, expires_at) VALUES ('e1', 'AUR-PRO-V2-X', 't', '{}', 9999999999)",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO acknowledgements (id, event_id, license_key, terminal_id, status) VALUES ('a1', 'e1', 'AUR-PRO-V2-X', 'term1', 'failed')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO acknowledgements (id, event_id, license_key, terminal_id, status) VALUES ('a2', 'e1', 'AUR-PRO-V2-X', 'term1', 'failed')",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO acknowledgements (id, event_id, license_key, terminal_id, status) VALUES ('a3', 'e1', 'AUR-PRO-V2-X', 'term1', 'success')",
            (),
        )
        .await
        .unwrap();

        let result = conn
            .execute(
                "INSERT INTO acknowledgements (id, event_id, license_key, terminal_id, status) VALUES ('a4', 'e1', 'AUR-PRO-V2-X', 'term1', 'success')",
                (),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn only_one_active_activation_per_license_and_machine() {
        let conn = connect(":memory:").await.unwrap();
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
            "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals) VALUES ('AUR-PRO-V2-X', 'cust_1', 'sub_1', 5)",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO activations (id, license_key, machine_id_hash, terminal_name) VALUES ('act_1', 'AUR-PRO-V2-X', 'hash_1', 'box-1')",
            (),
        )
        .await
        .unwrap();

        let result = conn
            .execute(
                "INSERT INTO activations (id, license_key, machine_id_hash, terminal_name) VALUES ('act_2', 'AUR-PRO-V2-X', 'hash_1', 'box-1-again')",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
