use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cadence_core::{EventLevel, EventSink, OverlapPolicy};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cron::{truncate_to_minute, CronExpression},
    error::{JobError, Result, SchedulerError},
    job::{CronJob, JobSnapshot},
};

/// Minute-aligned cron scheduler.
///
/// Owns its jobs, runs a background tick loop once [`start`](Self::start) is
/// called, and dispatches each due job as its own tokio task. Job outcomes are
/// reported through the [`EventSink`] given at construction.
pub struct JobScheduler {
    ticker: Ticker,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Wall clock read by the tick loop, `start` and `trigger`.
type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The part of the scheduler the background loop needs: jobs, sink, policy.
#[derive(Clone)]
struct Ticker {
    jobs: Vec<Arc<CronJob>>,
    sink: Arc<dyn EventSink>,
    overlap: OverlapPolicy,
    clock: Clock,
}

impl JobScheduler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ticker: Ticker {
                jobs: Vec::new(),
                sink,
                overlap: OverlapPolicy::default(),
                clock: Arc::new(Utc::now),
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.ticker.overlap = overlap;
        self
    }

    /// Replace the wall clock, which defaults to [`Utc::now`].
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.ticker.clock = Arc::new(clock);
        self
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.ticker.overlap
    }

    /// Parse `expression` and register a job running `task` on that schedule.
    ///
    /// A malformed expression is returned as [`SchedulerError::Parse`]; callers
    /// are expected to treat it as fatal at setup.
    pub fn add_job<F, Fut>(&mut self, name: impl Into<String>, expression: &str, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let schedule = CronExpression::parse(expression)?;
        self.add(CronJob::new(name, schedule, task))
    }

    /// Register an already constructed job. Names must be unique, and jobs
    /// can only be added while the scheduler is stopped.
    pub fn add(&mut self, job: CronJob) -> Result<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.ticker.find(job.name()).is_some() {
            return Err(SchedulerError::DuplicateJob {
                name: job.name().to_string(),
            });
        }
        debug!(job = %job.name(), schedule = %job.schedule(), "job registered");
        self.ticker.jobs.push(Arc::new(job));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ticker.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticker.jobs.is_empty()
    }

    /// Snapshots of every job, in registration order.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.ticker.jobs.iter().map(|job| job.snapshot()).collect()
    }

    pub fn job(&self, name: &str) -> Option<JobSnapshot> {
        self.ticker.find(name).map(|job| job.snapshot())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Activate every job and compute its first run at or after `now`.
    ///
    /// A schedule with no run inside the search window is reported as a
    /// warning and left active; it simply never fires.
    pub fn prime(&self, now: DateTime<Utc>) {
        for job in &self.ticker.jobs {
            job.set_active(true);
            match job.refresh_next_run(now) {
                Some(next) => {
                    info!(job = %job.name(), next_run = %next, "job scheduled");
                    self.ticker.emit(
                        EventLevel::Info,
                        &format!("Job '{}' scheduled, next run at {next}", job.name()),
                    );
                }
                None => self.ticker.exhausted(job),
            }
        }
    }

    /// Activate all jobs and launch the tick loop in the background.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.prime((self.ticker.clock)());

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_loop(
            self.ticker.clone(),
            Arc::clone(&self.running),
            shutdown_rx,
        ));
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.ticker.emit(
            EventLevel::Info,
            &format!("Scheduler started with {} jobs", self.ticker.jobs.len()),
        );
        Ok(())
    }

    /// Deactivate all jobs and wait for the tick loop to exit.
    ///
    /// Executions already dispatched keep running to completion.
    pub async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        for job in &self.ticker.jobs {
            job.set_active(false);
        }
        self.shutdown_tx.send_replace(true);

        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop terminated abnormally");
            }
        }
        if was_running {
            self.ticker.emit(EventLevel::Info, "Scheduler stopped");
        }
    }

    /// Start, emit a heartbeat every `heartbeat` until `shutdown` resolves,
    /// then stop.
    pub async fn run_until<S>(&self, shutdown: S, heartbeat: Duration) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.start()?;

        let mut interval = tokio::time::interval(heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => self.ticker.heartbeat(),
            }
        }

        self.stop().await;
        Ok(())
    }

    /// One evaluation pass at `now`: claim and dispatch every active job whose
    /// schedule matches the current minute. Returns the number dispatched.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        self.ticker.tick(now)
    }

    /// Dispatch the named job right away, outside its schedule.
    ///
    /// The run goes through the same outcome handling as a scheduled one but
    /// does not take the minute's claim.
    pub fn trigger(&self, name: &str) -> Result<()> {
        let job = self
            .ticker
            .find(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;
        let now = (self.ticker.clock)();
        let minute = truncate_to_minute(&now).unwrap_or(now);
        self.ticker.emit(
            EventLevel::Info,
            &format!("Job '{name}' triggered manually"),
        );
        self.ticker.dispatch(job, minute, false);
        Ok(())
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.ticker.jobs)
            .field("overlap", &self.ticker.overlap)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Ticker {
    fn find(&self, name: &str) -> Option<&Arc<CronJob>> {
        self.jobs.iter().find(|job| job.name() == name)
    }

    fn emit(&self, level: EventLevel, message: &str) {
        self.sink.emit(level, message);
    }

    fn exhausted(&self, job: &CronJob) {
        let err = SchedulerError::ScheduleExhausted {
            job: job.name().to_string(),
            expression: job.schedule().to_string(),
        };
        warn!(job = %job.name(), "{err}");
        self.emit(EventLevel::Warning, &err.to_string());
    }

    fn heartbeat(&self) {
        let active = self.jobs.iter().filter(|job| job.is_active()).count();
        let running: usize = self.jobs.iter().map(|job| job.running()).sum();
        debug!(active, running, "heartbeat");
        self.emit(
            EventLevel::Info,
            &format!("Scheduler heartbeat: {active} active jobs, {running} running"),
        );
    }

    fn tick(&self, now: DateTime<Utc>) -> usize {
        let Some(minute) = truncate_to_minute(&now) else {
            return 0;
        };

        let mut dispatched = 0;
        for job in &self.jobs {
            if !job.is_active() || !job.schedule().matches(&minute) {
                continue;
            }
            if !job.try_claim(minute) {
                continue;
            }
            if self.overlap == OverlapPolicy::Skip && job.running() > 0 {
                warn!(job = %job.name(), %minute, running = job.running(), "previous run still active, skipping");
                self.emit(
                    EventLevel::Warning,
                    &format!(
                        "Job '{}' is still running, skipping the {} run",
                        job.name(),
                        minute.format("%Y-%m-%d %H:%M")
                    ),
                );
                continue;
            }
            self.dispatch(job, minute, true);
            dispatched += 1;
        }
        dispatched
    }

    /// Run one execution of `job` on its own task. Errors and panics stop at
    /// the task boundary and become a failed outcome.
    fn dispatch(&self, job: &Arc<CronJob>, minute: DateTime<Utc>, claimed: bool) {
        let job = Arc::clone(job);
        let sink = Arc::clone(&self.sink);
        let task = job.task();
        let run_id = Uuid::new_v4();

        job.begin_run();
        info!(job = %job.name(), %run_id, %minute, "executing job");

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;
            job.end_run();

            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(JobError::Failed(e)),
                Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
            };
            let next = job.finish(minute, claimed, result.is_ok());
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    info!(job = %job.name(), %run_id, ?elapsed, "job succeeded");
                    sink.emit(
                        EventLevel::Success,
                        &format!("Job '{}' completed in {elapsed:.1?}", job.name()),
                    );
                }
                Err(e) => {
                    error!(job = %job.name(), %run_id, ?elapsed, error = %e, "job failed");
                    sink.emit(
                        EventLevel::Error,
                        &format!("Job '{}' failed: {e}", job.name()),
                    );
                }
            }

            if next.is_none() {
                let err = SchedulerError::ScheduleExhausted {
                    job: job.name().to_string(),
                    expression: job.schedule().to_string(),
                };
                warn!(job = %job.name(), "{err}");
                sink.emit(EventLevel::Warning, &err.to_string());
            }
        });
    }
}

/// Background loop: wake at each minute boundary and tick, until stopped.
async fn run_loop(ticker: Ticker, running: Arc<AtomicBool>, mut shutdown: watch::Receiver<bool>) {
    info!(jobs = ticker.jobs.len(), "scheduler loop started");
    loop {
        let wait = until_next_minute((ticker.clock)());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let dispatched = ticker.tick((ticker.clock)());
        debug!(dispatched, "tick");
    }
    info!("scheduler loop stopped");
}

/// Time left until the next whole minute of `now`.
fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let floor = truncate_to_minute(&now).unwrap_or(now);
    (floor + chrono::Duration::minutes(1) - now)
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
