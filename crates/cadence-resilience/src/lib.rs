//! `cadence-resilience`: retry with exponential backoff and a circuit breaker
//! for calls to unreliable external services.
//!
//! The two compose: a job wraps its network call as
//! `retry.execute(|| breaker.execute(op))`. An open circuit classifies as
//! [`ErrorKind::CircuitOpen`], which no preset retries, so a tripped breaker
//! ends the retry loop immediately.

pub mod breaker;
pub mod error;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use error::{CircuitError, Classify, ErrorKind, InvalidConfig, RetryError};
pub use retry::{RetryConfig, RetryPolicy};
