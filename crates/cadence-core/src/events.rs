//! Event sink contract: how the scheduler reports job outcomes to the outside
//! world (dashboard, log viewer, notifier) without knowing what listens.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity of a scheduler event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventLevel::Info => "info",
            EventLevel::Success => "success",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Receives human-readable scheduler events.
///
/// Implementations must return quickly: `emit` is called from the tick loop
/// and from job tasks, and must never wait on the sink's own I/O.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: EventLevel, message: &str);
}

/// Forwards events to `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, level: EventLevel, message: &str) {
        match level {
            EventLevel::Info => info!(target: "cadence::events", "{message}"),
            EventLevel::Success => info!(target: "cadence::events", outcome = "success", "{message}"),
            EventLevel::Warning => warn!(target: "cadence::events", "{message}"),
            EventLevel::Error => error!(target: "cadence::events", "{message}"),
        }
    }
}

/// A single emitted event, as delivered by [`ChannelSink`].
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Pushes events onto an mpsc channel for an external consumer.
///
/// Uses `try_send` so a slow consumer never stalls the caller; events that do
/// not fit are dropped with a warning.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end of a channel of `capacity`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, level: EventLevel, message: &str) {
        let event = Event {
            level,
            message: message.to_string(),
            at: Utc::now(),
        };
        if self.tx.try_send(event).is_err() {
            warn!(%level, "event channel full or closed, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.emit(EventLevel::Info, "scheduler started");
        sink.emit(EventLevel::Error, "job failed");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, EventLevel::Info);
        assert_eq!(first.message, "scheduler started");
        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, EventLevel::Error);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (sink, mut rx) = ChannelSink::channel(1);
        sink.emit(EventLevel::Info, "kept");
        sink.emit(EventLevel::Info, "dropped");

        assert_eq!(rx.try_recv().unwrap().message, "kept");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn level_display_matches_wire_names() {
        assert_eq!(EventLevel::Success.to_string(), "success");
        assert_eq!(EventLevel::Warning.to_string(), "warning");
    }
}
