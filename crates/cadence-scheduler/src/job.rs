use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;

use crate::cron::CronExpression;

/// Opaque unit of work. The scheduler calls it with no arguments; `Ok`
/// means success, `Err` (or a panic) means failure.
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Scheduling state shared between the tick loop and running executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobState {
    /// Minute this job was last claimed for. Cleared after a failed run.
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled minute, for display only.
    pub next_run: Option<DateTime<Utc>>,
}

/// A schedule bound to a task.
pub struct CronJob {
    name: String,
    schedule: CronExpression,
    task: JobTask,
    active: AtomicBool,
    /// Executions dispatched and not yet finished.
    running: AtomicUsize,
    state: Mutex<JobState>,
}

impl CronJob {
    pub fn new<F, Fut>(name: impl Into<String>, schedule: CronExpression, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            schedule,
            task: Arc::new(move || task().boxed()),
            active: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            state: Mutex::new(JobState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &CronExpression {
        &self.schedule
    }

    pub(crate) fn task(&self) -> JobTask {
        Arc::clone(&self.task)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Executions currently in flight.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_run(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_run(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn state(&self) -> JobState {
        *self.lock()
    }

    /// Claim `minute` for this job.
    ///
    /// Succeeds only if the job has not been claimed for this minute or a
    /// later one. The test and the update happen under the job's lock, so two
    /// concurrent claims for the same minute never both succeed.
    pub fn try_claim(&self, minute: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        match state.last_run {
            Some(last) if last >= minute => false,
            _ => {
                state.last_run = Some(minute);
                true
            }
        }
    }

    /// Compute and store the first scheduled minute at or after `from`.
    pub fn refresh_next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.next_run_after(&from);
        self.lock().next_run = next;
        next
    }

    /// Record the outcome of the execution that ran for `minute`.
    ///
    /// A failed execution that held the claim releases it, making the job
    /// eligible again on the next tick. A newer claim taken by an overlapping
    /// execution is left alone. Returns the recomputed `next_run`.
    pub(crate) fn finish(
        &self,
        minute: DateTime<Utc>,
        claimed: bool,
        succeeded: bool,
    ) -> Option<DateTime<Utc>> {
        // The scan can take a while; keep it outside the lock.
        let next = self.schedule.next_run_after(&(minute + Duration::minutes(1)));
        let mut state = self.lock();
        if claimed && !succeeded && state.last_run.is_some_and(|last| last <= minute) {
            state.last_run = None;
        }
        state.next_run = next;
        next
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            name: self.name.clone(),
            schedule: self.schedule.to_string(),
            active: self.is_active(),
            last_run: state.last_run,
            next_run: state.next_run,
            running: self.running(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CronJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronJob")
            .field("name", &self.name)
            .field("schedule", &self.schedule.as_str())
            .field("active", &self.is_active())
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only view of a job for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub schedule: String,
    pub active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Barrier;

    fn minute(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, h, m, 0).single().unwrap()
    }

    fn job(expr: &str) -> CronJob {
        CronJob::new("test", CronExpression::parse(expr).unwrap(), || async { Ok(()) })
    }

    #[test]
    fn claim_once_per_minute() {
        let job = job("* * * * *");
        assert!(job.try_claim(minute(10, 0)));
        assert!(!job.try_claim(minute(10, 0)));
        assert!(!job.try_claim(minute(9, 59)), "older minutes stay claimed");
        assert!(job.try_claim(minute(10, 1)));
        assert_eq!(job.state().last_run, Some(minute(10, 1)));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        for _ in 0..100 {
            let job = Arc::new(job("* * * * *"));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let job = Arc::clone(&job);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        job.try_claim(minute(12, 0))
                    })
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
            assert_eq!(job.state().last_run, Some(minute(12, 0)));
        }
    }

    #[test]
    fn failure_releases_claim_and_success_keeps_it() {
        let job = job("30 14 * * *");
        let m = minute(14, 30);

        assert!(job.try_claim(m));
        let next = job.finish(m, true, true);
        assert_eq!(job.state().last_run, Some(m));
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 5, 16, 14, 30, 0).single().unwrap()));

        job.finish(m, true, false);
        assert_eq!(job.state().last_run, None);
        assert_eq!(job.state().next_run, next);
        assert!(job.try_claim(m));
    }

    #[test]
    fn failure_leaves_newer_claim_alone() {
        let job = job("* * * * *");
        assert!(job.try_claim(minute(8, 0)));
        assert!(job.try_claim(minute(8, 1)));
        job.finish(minute(8, 0), true, false);
        assert_eq!(job.state().last_run, Some(minute(8, 1)));
    }

    #[test]
    fn unclaimed_failure_does_not_touch_last_run() {
        let job = job("* * * * *");
        assert!(job.try_claim(minute(8, 0)));
        job.finish(minute(8, 0), false, false);
        assert_eq!(job.state().last_run, Some(minute(8, 0)));
    }

    #[test]
    fn snapshot_reflects_state() {
        let job = job("0 18 * * 6");
        job.set_active(true);
        let next = job.refresh_next_run(minute(0, 0));
        let snap = job.snapshot();
        assert_eq!(snap.name, "test");
        assert_eq!(snap.schedule, "0 18 * * 6");
        assert!(snap.active);
        assert_eq!(snap.next_run, next);
        assert_eq!(snap.running, 0);
    }
}
