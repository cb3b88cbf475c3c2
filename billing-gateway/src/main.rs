#[macro_use]
extern crate tracing;

use std::future::Future;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use billing_gateway::config::ConfHandle;
use billing_gateway::log::BillingGatewayLog;
use billing_gateway::retry::RetryTickJob;
use billing_gateway::sweeps::{EventTtlSweepJob, GracePeriodSweepJob, TrialEndingSweepJob};
use billing_gateway::{api, AppState};
use event_queue::{DynJob, DynJobQueue, Job, JobCtx, JobQueue as _, JobQueueExt as _, JobReader, RunnerWaker, ScheduleFor};
use event_queue_libsql::LibSqlJobQueue;
use service_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Job names registered as recurring cron jobs at startup. Kept here (rather than as consts on
/// each job type) since this is the one place that needs all four together.
const RETRY_TICK: (&str, &str) = ("retry_tick", "0 * * * * * *"); // every minute
const TRIAL_ENDING_SWEEP: (&str, &str) = ("trial_ending_sweep", "0 0 */6 * * * *"); // every six hours
const GRACE_PERIOD_SWEEP: (&str, &str) = ("grace_period_sweep", "0 0 */12 * * * *"); // every twelve hours
const EVENT_TTL_SWEEP: (&str, &str) = ("event_ttl_sweep", "0 0 * * * * *"); // hourly

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run().await.inspect_err(|error| {
        // The logger may not have been installed yet if `ConfHandle::from_env` itself failed.
        eprintln!("billing-gateway failed to start: {error:#}");
    })
}

async fn run() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::from_env().context("unable to initialize configuration")?;
    let conf = conf_handle.get();

    let _logger_guard =
        billing_log::init::<BillingGatewayLog>(&conf.log_path, "info", std::env::var("BILLING_GATEWAY_LOG").ok().as_deref())
            .context("failed to set up logger")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting billing gateway");

    let state = AppState::new(conf_handle).await.context("failed to build application state")?;

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let mut tasks = Vec::new();

    let job_queue = build_job_queue(&conf.job_queue_database_url).await.context("failed to set up job queue")?;
    register_recurring_jobs(&job_queue).await.context("failed to register recurring jobs")?;

    tasks.push(spawn(JobRunnerTask { queue: Arc::clone(&job_queue), state: state.clone() }, shutdown_signal.clone()));

    tasks.push(spawn(
        billing_log::LogDeleterTask::<BillingGatewayLog>::new(conf.log_path.clone()),
        shutdown_signal.clone(),
    ));

    tasks.push(spawn(HttpServerTask { state: state.clone(), bind_address: conf.bind_address.clone() }, shutdown_signal.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");
    shutdown_handle.signal();

    tokio::select! {
        () = shutdown_handle.all_closed() => debug!("all tasks stopped gracefully"),
        () = tokio::time::sleep(Duration::from_secs(10)) => warn!("some tasks did not stop in time"),
    }

    // Any task still running past the grace period above is aborted when `tasks` drops here.
    drop(tasks);

    Ok(())
}

fn spawn<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<anyhow::Result<()>>
where
    T: Task<Output = anyhow::Result<()>> + 'static,
{
    service_task::spawn_task(task, shutdown_signal)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// The job queue keeps its own `user_version`-tracked migrations, separate from the application
/// schema (see [`billing_gateway::config::Conf::job_queue_database_url`]).
async fn build_job_queue(database_url: &str) -> anyhow::Result<DynJobQueue> {
    let path = database_url.strip_prefix("file:").unwrap_or(database_url);

    let conn = event_queue_libsql::libsql::Builder::new_local(path)
        .build()
        .await
        .context("failed to open job queue database")?
        .connect()
        .context("failed to open job queue connection")?;

    let runner_waker = RunnerWaker::new(|| {});
    let queue = LibSqlJobQueue::builder().conn(conn).runner_waker(runner_waker).build();

    queue.setup().await.context("job queue migration failed")?;
    queue.reset_claimed_jobs().await.context("failed to reset claimed jobs")?;
    queue.clear_failed().await.context("failed to clear exhausted jobs")?;

    Ok(Arc::new(queue))
}

/// Registers the four recurring jobs driving the retry engine and the scheduled sweeps, skipping
/// any name already present so a restart doesn't pile up duplicate cron rows.
async fn register_recurring_jobs(queue: &DynJobQueue) -> anyhow::Result<()> {
    let existing: std::collections::HashSet<String> =
        queue.get_cron_jobs().await.context("failed to list existing cron jobs")?.into_iter().map(|job| job.name).collect();

    for (name, cron) in [RETRY_TICK, TRIAL_ENDING_SWEEP, GRACE_PERIOD_SWEEP, EVENT_TTL_SWEEP] {
        if existing.contains(name) {
            continue;
        }

        let schedule = cron_clock::Schedule::from_str(cron).with_context(|| format!("invalid cron expression for {name}"))?;
        let job = placeholder_job(name);
        queue.push_job(&job, ScheduleFor::Cron(schedule)).await.with_context(|| format!("failed to register {name}"))?;
        info!(job_name = name, cron, "registered recurring job");
    }

    Ok(())
}

/// The job def body is empty for all four recurring jobs (they read their working set fresh from
/// the database on every run); this only carries the right `name()` so the row lands with the
/// right identity for [`BillingJobReader`] to reconstruct on claim.
struct NamedPlaceholder(&'static str);

#[async_trait]
impl Job for NamedPlaceholder {
    fn name(&self) -> &str {
        self.0
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok("{}".to_owned())
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("placeholder job should never run directly; the reader always substitutes a live job")
    }
}

fn placeholder_job(name: &'static str) -> DynJob {
    Box::new(NamedPlaceholder(name))
}

/// Reconstructs a runnable job from its name and the shared [`AppState`]. Every job here is
/// stateless JSON (`"{}"`); what actually matters is wiring in the live `conn`/`event_store`/
/// `bus` handles rather than anything serialized in the row.
struct BillingJobReader {
    state: AppState,
}

impl JobReader for BillingJobReader {
    fn read_json(&self, name: &str, _json: &str) -> anyhow::Result<DynJob> {
        match name {
            "retry_tick" => Ok(Box::new(RetryTickJob {
                conn: self.state.conn.clone(),
                event_store: self.state.event_store.clone(),
                ack_ledger: self.state.ack_ledger.clone(),
                bus: self.state.bus.clone(),
                max_retry_attempts: self.state.conf.get().max_retry_attempts,
            })),
            "trial_ending_sweep" => Ok(Box::new(TrialEndingSweepJob {
                conn: self.state.conn.clone(),
                event_store: self.state.event_store.clone(),
                bus: self.state.bus.clone(),
            })),
            "grace_period_sweep" => Ok(Box::new(GracePeriodSweepJob {
                conn: self.state.conn.clone(),
                event_store: self.state.event_store.clone(),
                bus: self.state.bus.clone(),
            })),
            "event_ttl_sweep" => Ok(Box::new(EventTtlSweepJob { event_store: self.state.event_store.clone() })),
            other => anyhow::bail!("unknown job name: {other}"),
        }
    }
}

struct JobRunnerTask {
    queue: DynJobQueue,
    state: AppState,
}

#[async_trait]
impl Task for JobRunnerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "job runner";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        job_runner_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn job_runner_task(ctx: JobRunnerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("task started");

    let JobRunnerTask { queue, state } = ctx;
    let reader = BillingJobReader { state };
    let notify_runner = Arc::new(tokio::sync::Notify::new());
    let runner_waker = RunnerWaker::new({
        let notify_runner = Arc::clone(&notify_runner);
        move || notify_runner.notify_one()
    });

    let spawn = |mut ctx: JobCtx, callback: event_queue::SpawnCallback| {
        tokio::spawn(async move {
            let result = ctx.job.run().await;
            (callback)(result).await;
        });
    };

    let sleep = |duration: Duration| (Box::new(tokio::time::sleep(duration)) as Box<dyn Future<Output = ()> + Send>).into();

    let wait_notified = {
        let notify_runner = Arc::clone(&notify_runner);
        move || {
            let notify_runner = Arc::clone(&notify_runner);
            (Box::new(async move { notify_runner.notified().await }) as Box<dyn Future<Output = ()> + Send>).into()
        }
    };

    let wait_notified_timeout = {
        let notify_runner = Arc::clone(&notify_runner);
        move |timeout: Duration| {
            let notify_runner = Arc::clone(&notify_runner);
            (Box::new(async move {
                tokio::select! {
                    () = notify_runner.notified() => {}
                    () = tokio::time::sleep(timeout) => {}
                }
            }) as Box<dyn Future<Output = ()> + Send>)
                .into()
        }
    };

    let runner = event_queue::JobRunner {
        queue,
        reader: &reader,
        spawn: &spawn,
        sleep: &sleep,
        wait_notified: &wait_notified,
        wait_notified_timeout: &wait_notified_timeout,
        waker: runner_waker,
        max_batch_size: 4,
    };

    tokio::select! {
        () = runner.run() => {}
        () = shutdown_signal.wait() => {}
    }

    debug!("task terminated");

    Ok(())
}

struct HttpServerTask {
    state: AppState,
    bind_address: String,
}

#[async_trait]
impl Task for HttpServerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http server";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let router = api::make_router(self.state).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

        let listener = TcpListener::bind(&self.bind_address).await.with_context(|| format!("failed to bind {}", self.bind_address))?;

        info!(address = %self.bind_address, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("http server failed")
    }
}
