//! `cadence-scheduler`: minute-granularity cron scheduling on tokio.
//!
//! # Overview
//!
//! A [`JobScheduler`] owns a set of [`CronJob`]s. Once started it wakes at
//! every wall-clock minute boundary, claims each active job whose
//! [`CronExpression`] matches that minute, and runs the job's task on its own
//! tokio task. Claims are taken under a per-job lock, so a job runs at most
//! once per scheduled minute; a failed run releases its claim.
//!
//! # Expression syntax
//!
//! | Field   | Range | Notes        |
//! |---------|-------|--------------|
//! | minute  | 0-59  |              |
//! | hour    | 0-23  |              |
//! | day     | 1-31  |              |
//! | month   | 1-12  |              |
//! | weekday | 0-6   | 0 is Sunday  |
//!
//! Each field accepts `*`, `*/n`, `a-b`, `a-b/n`, `a,b,c` or a single value.

pub mod cron;
pub mod engine;
pub mod error;
pub mod job;

pub use cadence_core::OverlapPolicy;
pub use cron::{CronExpression, Field, FieldSet};
pub use engine::JobScheduler;
pub use error::{JobError, ParseError, Result, SchedulerError};
pub use job::{CronJob, JobSnapshot, JobState, JobTask};
