//! Retry engine: bounded attempts with exponential backoff and jitter.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Classify, ErrorKind, InvalidConfig, RetryError};

/// Upper bound of the random multiplier applied to each delay: `[1.0, 1.25)`.
const JITTER_SPREAD: f64 = 0.25;

/// Retry policy configuration.
///
/// Presets are plain values; [`RetryConfig::network`] and
/// [`RetryConfig::download`] only differ in tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Multiply each delay by a random factor in `[1.0, 1.25)`.
    pub jitter: bool,
    /// Error kinds treated as transient.
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryConfig {
    /// API calls: several quick attempts with gentle growth.
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: true,
            retryable_kinds: HashSet::from([
                ErrorKind::Connect,
                ErrorKind::Timeout,
                ErrorKind::Transport,
            ]),
        }
    }

    /// Large transfers: fewer attempts, longer pauses, and interrupted
    /// transfers count as transient.
    pub fn download() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: true,
            retryable_kinds: HashSet::from([
                ErrorKind::Connect,
                ErrorKind::Timeout,
                ErrorKind::Transport,
                ErrorKind::Io,
                ErrorKind::Interrupted,
            ]),
        }
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.max_attempts == 0 {
            return Err(InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.initial_delay.is_zero() {
            return Err(InvalidConfig("initial_delay must be positive".into()));
        }
        if self.max_delay < self.initial_delay {
            return Err(InvalidConfig(format!(
                "max_delay ({:?}) is below initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        if !(self.multiplier > 1.0 && self.multiplier.is_finite()) {
            return Err(InvalidConfig(format!(
                "multiplier must be a finite number above 1, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Whether `err` deserves another attempt under this config.
    ///
    /// A status code, when present, decides first: 429 and 5xx are transient,
    /// any other 4xx is permanent. Otherwise the error kind must be listed in
    /// `retryable_kinds`.
    pub fn is_retryable<E: Classify>(&self, err: &E) -> bool {
        match err.status() {
            Some(429) => true,
            Some(s) if (500..=599).contains(&s) => true,
            Some(s) if (400..=499).contains(&s) => false,
            _ => self.retryable_kinds.contains(&err.kind()),
        }
    }

    /// Pause after failed attempt `attempt` (1-indexed).
    ///
    /// `min(initial × multiplier^(attempt-1), max_delay)`, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            capped * jitter_factor()
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

fn jitter_factor() -> f64 {
    1.0 + fastrand::f64() * JITTER_SPREAD
}

/// Wraps fallible async operations with the configured retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
}

impl RetryPolicy {
    /// Build a policy. `name` only appears in log fields.
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, InvalidConfig> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
        })
    }

    pub fn network() -> Self {
        Self {
            name: "network".into(),
            config: RetryConfig::network(),
        }
    }

    pub fn download() -> Self {
        Self {
            name: "download".into(),
            config: RetryConfig::download(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// The backoff sleep only suspends the calling task.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max = self.config.max_attempts;

        for attempt in 1..=max {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(policy = %self.name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !self.config.is_retryable(&e) => {
                    warn!(
                        policy = %self.name,
                        attempt,
                        kind = ?e.kind(),
                        status = ?e.status(),
                        error = %e,
                        "non-retryable failure"
                    );
                    return Err(RetryError::NonRetryable(e));
                }
                Err(e) if attempt == max => {
                    warn!(policy = %self.name, attempts = max, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.config.delay_for(attempt);
                    warn!(
                        policy = %self.name,
                        attempt,
                        max,
                        error = %e,
                        retry_after_ms = delay.as_millis() as u64,
                        "operation failed, retrying with backoff"
                    );
                    sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1 is enforced by validate(), so the loop always returns.
        unreachable!("retry loop exited without returning")
    }
}

/// Serde helper: `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
