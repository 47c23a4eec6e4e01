use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failed external call.
///
/// Retry presets list which kinds they consider transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote end could not be reached or dropped the connection.
    Connect,
    /// The call did not complete in time.
    Timeout,
    /// The remote end answered with an error status.
    Transport,
    /// Local or remote I/O failed mid-transfer.
    Io,
    /// The transfer was interrupted and can be restarted.
    Interrupted,
    /// A circuit breaker rejected the call without attempting it.
    CircuitOpen,
    /// The response arrived but could not be understood.
    Decode,
    Other,
}

/// Errors that a retry policy or circuit breaker can reason about.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Transport status code (e.g. HTTP status), when the failure carries one.
    fn status(&self) -> Option<u16> {
        None
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::Interrupted | Io::UnexpectedEof => ErrorKind::Interrupted,
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => ErrorKind::Connect,
            Io::InvalidData => ErrorKind::Decode,
            _ => ErrorKind::Io,
        }
    }
}

/// A retry or circuit breaker configuration failed validation.
#[derive(Debug, Error)]
#[error("invalid resilience config: {0}")]
pub struct InvalidConfig(pub String);

/// Returned by [`crate::RetryPolicy::execute`] when the operation never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was classified as permanent; no further attempts were made.
    #[error("non-retryable error")]
    NonRetryable(#[source] E),

    /// Every attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The last error returned by the wrapped operation.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::NonRetryable(e) => e,
            RetryError::Exhausted { source, .. } => source,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::NonRetryable(e) => e,
            RetryError::Exhausted { source, .. } => source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn kind(&self) -> ErrorKind {
        self.inner().kind()
    }

    fn status(&self) -> Option<u16> {
        self.inner().status()
    }
}

/// Returned by [`crate::CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The operation ran and failed; the error is passed through unchanged.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

impl<E: Classify> Classify for CircuitError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            CircuitError::Open { .. } => ErrorKind::CircuitOpen,
            CircuitError::Inner(e) => e.kind(),
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            CircuitError::Open { .. } => None,
            CircuitError::Inner(e) => e.status(),
        }
    }
}
