#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use async_trait::async_trait;
use event_queue::{CronJobCompact, DynJob, JobCtx, JobQueue, JobReader, RunnerWaker, ScheduleFor};
use libsql::Connection;
use std::str::FromStr as _;
use time::OffsetDateTime;
use ulid::Ulid;
use uuid::Uuid;

#[rustfmt::skip]
pub use libsql;

/// Implementation of [`JobQueue`] using libSQL as the backend.
///
/// This is inspired by 37signals' Solid Queue:
/// - <https://dev.37signals.com/introducing-solid-queue/>
/// - <https://github.com/rails/solid_queue/>
///
/// And "How to build a job queue with Rust and PostgreSQL" on kerkour.com:
/// - <https://kerkour.com/rust-job-queue-with-postgresql>
///
/// We use the `user_version` pragma to store the migration state; it's a lightweight approach
/// since it's just an integer at a fixed offset in the SQLite file.
#[derive(typed_builder::TypedBuilder)]
pub struct LibSqlJobQueue {
    runner_waker: RunnerWaker,
    conn: Connection,
    #[builder(default = 5)]
    max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
enum JobStatus {
    Queued = 0,
    Running = 1,
}

fn next_cron_occurrence(schedule: &cron_clock::Schedule, after: OffsetDateTime) -> anyhow::Result<OffsetDateTime> {
    let after_chrono = chrono::DateTime::from_timestamp(after.unix_timestamp(), 0).context("out of range timestamp")?;

    let next = schedule
        .after(&after_chrono)
        .next()
        .context("cron schedule has no future occurrence")?;

    OffsetDateTime::from_unix_timestamp(next.timestamp()).context("cron occurrence out of range")
}

impl LibSqlJobQueue {
    async fn apply_pragmas(&self) -> anyhow::Result<()> {
        // Inspiration taken from https://briandouglas.ie/sqlite-defaults/
        const PRAGMAS: &str = "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 15000;
            PRAGMA cache_size = -3000;
            PRAGMA auto_vacuum = INCREMENTAL;
            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self
            .conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to batch execute SQL query")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn
                        .execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    self.update_user_version(migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> anyhow::Result<usize> {
        let row = self
            .conn
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

    async fn update_user_version(&self, value: usize) -> anyhow::Result<()> {
        let value = u64::try_from(value).expect("number not too big");
        let sql_query = format!("PRAGMA user_version = {value}");

        self.conn
            .execute(&sql_query, ())
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }
}

#[async_trait]
impl JobQueue for LibSqlJobQueue {
    async fn setup(&self) -> anyhow::Result<()> {
        self.apply_pragmas().await?;
        self.migrate().await?;
        Ok(())
    }

    async fn reset_claimed_jobs(&self) -> anyhow::Result<()> {
        let sql_query = "UPDATE job_queue SET status = :queued_status WHERE status = :running_status";

        let params = (
            (":running_status", JobStatus::Running as u32),
            (":queued_status", JobStatus::Queued as u32),
        );

        let changed_count = self
            .conn
            .execute(sql_query, params)
            .await
            .context("failed to execute SQL query")?;

        trace!(changed_count, "Jobs reset with success");

        Ok(())
    }

    async fn push_job_raw(&self, job_name: &str, job_def: String, schedule_for: ScheduleFor) -> anyhow::Result<()> {
        // UUID v4 only provides randomness, which leads to fragmentation.
        // We use ULID instead to reduce index fragmentation.
        // https://github.com/ulid/spec
        let id = Uuid::from(Ulid::new()).to_string();

        let (scheduled_for, cron) = match schedule_for {
            ScheduleFor::Now => (OffsetDateTime::now_utc(), None),
            ScheduleFor::Once(at) => (at, None),
            ScheduleFor::Cron(schedule) => {
                let next = next_cron_occurrence(&schedule, OffsetDateTime::now_utc())?;
                (next, Some(schedule.to_string()))
            }
        };

        let sql_query = "INSERT INTO job_queue
            (id, scheduled_for, failed_attempts, status, name, def, cron)
            VALUES (:id, :scheduled_for, :failed_attempts, :status, :name, jsonb(:def), :cron)";

        let params = (
            (":id", id),
            (":scheduled_for", scheduled_for.unix_timestamp()),
            (":failed_attempts", 0),
            (":status", JobStatus::Queued as u32),
            (":name", job_name.to_owned()),
            (":def", job_def),
            (":cron", cron),
        );

        self.conn
            .execute(sql_query, params)
            .await
            .context("failed to execute SQL query")?;

        self.runner_waker.wake();

        Ok(())
    }

    async fn claim_jobs(&self, reader: &dyn JobReader, number_of_jobs: usize) -> anyhow::Result<Vec<JobCtx>> {
        let number_of_jobs = u32::try_from(number_of_jobs).context("number_of_jobs is too big")?;

        // If we were using Postgres, we would need `FOR UPDATE SKIP LOCKED` in the query to
        // avoid blocking other readers/writers. In SQLite/libSQL there is only a single writer
        // at a time, so this directive doesn't exist; claiming is naturally serialized.
        let sql_query = "UPDATE job_queue
            SET status = :running_status
            WHERE id IN (
                SELECT id
                FROM job_queue
                WHERE status = :queued_status AND failed_attempts < :max_attempts AND scheduled_for <= unixepoch()
                ORDER BY scheduled_for
                LIMIT :number_of_jobs
            )
            RETURNING id, failed_attempts, name, json(def) as def, cron";

        let params = (
            (":running_status", JobStatus::Running as u32),
            (":queued_status", JobStatus::Queued as u32),
            (":max_attempts", self.max_attempts),
            (":number_of_jobs", number_of_jobs),
        );

        let mut rows = self
            .conn
            .query(sql_query, params)
            .await
            .context("failed to execute SQL query")?;

        let mut jobs = Vec::new();

        loop {
            let row = match rows.next().await {
                Ok(row) => row,
                Err(error) => {
                    error!(%error, "Failed to get next row");
                    break;
                }
            };

            let Some(row) = row else {
                break;
            };

            match libsql::de::from_row::<'_, JobModel>(&row) {
                Ok(model) => match reader.read_json(&model.name, &model.def) {
                    Ok(job) => {
                        let cron = model
                            .cron
                            .as_deref()
                            .map(cron_clock::Schedule::from_str)
                            .transpose()
                            .ok()
                            .flatten();

                        jobs.push(JobCtx {
                            id: model.id,
                            failed_attempts: model.failed_attempts,
                            job,
                            cron,
                        });
                    }
                    Err(e) => {
                        error!(error = format!("{e:#}"), "Failed to read job definition; deleting invalid job");
                        let _ = self.delete_job(model.id).await;
                    }
                },
                Err(error) => {
                    error!(%error, ?row, "Failed to read row");
                }
            }
        }

        return Ok(jobs);

        #[derive(serde::Deserialize, Debug, Clone)]
        struct JobModel {
            id: Uuid,
            failed_attempts: u32,
            name: String,
            def: String,
            cron: Option<String>,
        }
    }

    async fn delete_job(&self, id: Uuid) -> anyhow::Result<()> {
        self.conn
            .execute("DELETE FROM job_queue WHERE id = $1", [id.to_string()])
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }

    async fn fail_job(&self, id: Uuid, schedule_for: OffsetDateTime) -> anyhow::Result<()> {
        let sql_query = "UPDATE job_queue
            SET
                status = :queued_status,
                failed_attempts = failed_attempts + 1,
                scheduled_for = :scheduled_for
            WHERE id = :id";

        let params = (
            (":queued_status", JobStatus::Queued as u32),
            (":scheduled_for", schedule_for.unix_timestamp()),
            (":id", id.to_string()),
        );

        self.conn
            .execute(sql_query, params)
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }

    async fn clear_failed(&self) -> anyhow::Result<()> {
        let deleted_count = self
            .conn
            .execute("DELETE FROM job_queue WHERE failed_attempts >= $1", [self.max_attempts])
            .await
            .context("failed to execute SQL query")?;

        trace!(deleted_count, "Cleared failed jobs with success");

        Ok(())
    }

    async fn next_scheduled_date(&self) -> anyhow::Result<Option<OffsetDateTime>> {
        let sql_query = "SELECT scheduled_for
            FROM job_queue
            WHERE status = :queued_status AND failed_attempts < :max_attempts
            ORDER BY scheduled_for ASC
            LIMIT 1";

        let params = (
            (":queued_status", JobStatus::Queued as u32),
            (":max_attempts", self.max_attempts),
        );

        let mut rows = self
            .conn
            .query(sql_query, params)
            .await
            .context("failed to execute SQL query")?;

        let Some(row) = rows.next().await.context("failed to read the row")? else {
            return Ok(None);
        };

        let scheduled_for = row.get::<i64>(0).context("failed to read scheduled_for value")?;
        let scheduled_for =
            OffsetDateTime::from_unix_timestamp(scheduled_for).context("invalid UNIX timestamp for scheduled_for")?;

        Ok(Some(scheduled_for))
    }

    async fn schedule_next_cron_job(&self, id: Uuid) -> anyhow::Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT cron FROM job_queue WHERE id = $1", [id.to_string()])
            .await
            .context("failed to execute SQL query")?;

        let row = rows.next().await.context("failed to read row")?.context("job not found")?;
        let cron: String = row.get(0).context("job has no cron schedule")?;
        let schedule = cron_clock::Schedule::from_str(&cron).context("invalid stored cron expression")?;

        let now = OffsetDateTime::now_utc();
        let next = next_cron_occurrence(&schedule, now)?;

        self.conn
            .execute(
                "UPDATE job_queue SET scheduled_for = :scheduled_for, status = :queued_status, failed_attempts = 0 WHERE id = :id",
                (
                    (":scheduled_for", next.unix_timestamp()),
                    (":queued_status", JobStatus::Queued as u32),
                    (":id", id.to_string()),
                ),
            )
            .await
            .context("failed to execute SQL query")?;

        Ok(u64::try_from(next.unix_timestamp() - now.unix_timestamp()).unwrap_or(0))
    }

    async fn get_cron_jobs(&self) -> anyhow::Result<Vec<CronJobCompact>> {
        let mut rows = self
            .conn
            .query("SELECT id, name, cron FROM job_queue WHERE cron IS NOT NULL", ())
            .await
            .context("failed to execute SQL query")?;

        let mut jobs = Vec::new();

        while let Some(row) = rows.next().await.context("failed to read row")? {
            let model: CronJobRow = libsql::de::from_row(&row).context("failed to deserialize row")?;
            jobs.push(CronJobCompact {
                id: model.id,
                name: model.name,
                cron: model.cron,
            });
        }

        return Ok(jobs);

        #[derive(serde::Deserialize)]
        struct CronJobRow {
            id: Uuid,
            name: String,
            cron: String,
        }
    }
}

/// Typically, migrations should not be modified once released; only append to this list.
const MIGRATIONS: &[&str] = &[
    // Migration 0
    "CREATE TABLE job_queue (
        id TEXT NOT NULL PRIMARY KEY,
        created_at INT NOT NULL DEFAULT (unixepoch()),
        updated_at INT NOT NULL DEFAULT (unixepoch()),
        scheduled_for INT NOT NULL,
        failed_attempts INT NOT NULL,
        status INT NOT NULL,
        name TEXT NOT NULL,
        def BLOB NOT NULL,
        cron TEXT
    ) STRICT;

    CREATE TRIGGER update_job_updated_at_on_update AFTER UPDATE ON job_queue
    BEGIN
        UPDATE job_queue SET updated_at = unixepoch() WHERE id == NEW.id;
    END;

    CREATE INDEX idx_scheduled_for ON job_queue(scheduled_for);",
];

#[cfg(test)]
mod tests {
    use super::*;
    use event_queue::{Job, JobQueueExt};

    struct PingJob;

    #[async_trait]
    impl Job for PingJob {
        fn name(&self) -> &str {
            "ping"
        }

        fn write_json(&self) -> anyhow::Result<String> {
            Ok("{}".to_owned())
        }

        async fn run(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct PingReader;

    impl JobReader for PingReader {
        fn read_json(&self, _name: &str, _json: &str) -> anyhow::Result<DynJob> {
            Ok(Box::new(PingJob))
        }
    }

    async fn build_queue() -> LibSqlJobQueue {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();
        let queue = LibSqlJobQueue::builder()
            .conn(conn)
            .runner_waker(RunnerWaker::new(|| {}))
            .build();
        queue.setup().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn claims_only_due_jobs() {
        let queue = build_queue().await;
        let reader = PingReader;

        let job = Box::new(PingJob) as DynJob;
        queue.push_job(&job, ScheduleFor::Now).await.unwrap();

        let future_job = Box::new(PingJob) as DynJob;
        queue
            .push_job(&future_job, ScheduleFor::Once(OffsetDateTime::now_utc() + time::Duration::hours(1)))
            .await
            .unwrap();

        let claimed = queue.claim_jobs(&reader, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn cron_job_reschedules_instead_of_deleting() {
        let queue = build_queue().await;
        let reader = PingReader;

        let schedule: cron_clock::Schedule = "0 * * * * * *".parse().unwrap();
        let job = Box::new(PingJob) as DynJob;
        queue.push_job(&job, ScheduleFor::Cron(schedule)).await.unwrap();

        let cron_jobs = queue.get_cron_jobs().await.unwrap();
        assert_eq!(cron_jobs.len(), 1);

        let seconds = queue.schedule_next_cron_job(cron_jobs[0].id).await.unwrap();
        assert!(seconds < 120);

        let _ = reader;
    }

    #[tokio::test]
    async fn failed_job_is_requeued_with_incremented_attempts() {
        let queue = build_queue().await;
        let reader = PingReader;

        let job = Box::new(PingJob) as DynJob;
        queue.push_job(&job, ScheduleFor::Now).await.unwrap();

        let claimed = queue.claim_jobs(&reader, 10).await.unwrap();
        let job_id = claimed[0].id;

        queue.fail_job(job_id, OffsetDateTime::now_utc()).await.unwrap();

        let claimed_again = queue.claim_jobs(&reader, 10).await.unwrap();
        assert_eq!(claimed_again.len(), 1);
        assert_eq!(claimed_again[0].failed_attempts, 1);
    }
}
