//! Circuit breaker: fail fast against a dependency that keeps failing.
//!
//! One breaker guards one external resource and is shared by every caller of
//! that resource. State lives behind a mutex that is only held for
//! bookkeeping, never across the protected call.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CircuitError, InvalidConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A single trial call decides between Closed and Open.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Quiet period after the last failure before a trial call is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.failure_threshold == 0 {
            return Err(InvalidConfig(
                "breaker failure_threshold must be at least 1".into(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(InvalidConfig(
                "breaker recovery_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set while the HalfOpen trial call is running.
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as last recorded. The Open → HalfOpen move happens
    /// lazily on the next call, so an expired Open breaker still reads Open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    /// Run `op` under breaker protection.
    ///
    /// Rejects with [`CircuitError::Open`] without invoking `op` while the
    /// circuit is open. Otherwise returns `op`'s value, or its error wrapped
    /// in [`CircuitError::Inner`], after updating the failure counters.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = match self.try_acquire() {
            Some(permit) => permit,
            None => {
                debug!(circuit = %self.name, "circuit open, rejecting call");
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                });
            }
        };

        let outcome = op().await;
        permit.settled = true;
        match outcome {
            Ok(value) => {
                self.record_success(permit.trial);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(permit.trial);
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when the
    /// recovery timeout has passed.
    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit::new(self, false)),
            CircuitState::Open => {
                let expired = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() > self.config.recovery_timeout);
                if !expired {
                    return None;
                }
                info!(circuit = %self.name, "circuit half-open, allowing trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Some(Permit::new(self, true))
            }
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(Permit::new(self, true))
            }
        }
    }

    /// `trial` marks the HalfOpen trial call. Only the trial decides the
    /// HalfOpen outcome; a call admitted earlier that settles late does not.
    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if !trial => {}
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                info!(circuit = %self.name, "circuit closed after successful trial");
            }
            // A call admitted before the circuit opened; the circuit stays open.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen if !trial => {}
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "circuit opened after consecutive failures"
                );
            }
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(circuit = %self.name, "circuit re-opened after failed trial");
            }
            CircuitState::Open => {}
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to run one call. A trial permit dropped before the call settles
/// (the caller's future was cancelled) frees the trial slot again.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        b.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("boom") }
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<u8, CircuitError<&'static str>> {
        b.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &'static str>(7) }
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&b, &calls).await, Err(CircuitError::Inner("boom"))));
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().failure_count, 3);

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "op must not run while open");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes_and_resets() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(succeed(&b, &calls).await.unwrap_err().is_open(), "timeout must be exceeded");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(2);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(fail(&b, &calls).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().failure_count, 3);
        assert!(succeed(&b, &calls).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_consecutive_count() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        succeed(&b, &calls).await.unwrap();
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_while_half_open() {
        let b = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        assert!(succeed(&b, &calls).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn zero_threshold_or_timeout_is_rejected() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let zero_threshold = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        let err = zero_threshold.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"), "{err}");

        let zero_timeout = CircuitBreakerConfig {
            recovery_timeout: Duration::ZERO,
            ..CircuitBreakerConfig::default()
        };
        let err = zero_timeout.validate().unwrap_err();
        assert!(err.to_string().contains("recovery_timeout"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn late_call_from_closed_does_not_settle_the_trial() {
        let b = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = slow_rx.await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = trial_rx.await;
                    Err::<(), _>("still down")
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        slow_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen, "only the trial may close");
        assert!(succeed(&b, &calls).await.unwrap_err().is_open(), "trial still in flight");

        trial_tx.send(()).unwrap();
        assert!(matches!(trial.await.unwrap(), Err(CircuitError::Inner("still down"))));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_frees_the_slot() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let pending = b.execute(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
