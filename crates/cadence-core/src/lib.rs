//! `cadence-core`: configuration, shared error type and the event sink
//! contract used by the scheduler and the daemon.

pub mod config;
pub mod error;
pub mod events;

pub use config::{CadenceConfig, JobConfig, JobKind, OverlapPolicy};
pub use error::{CadenceError, Result};
pub use events::{ChannelSink, Event, EventLevel, EventSink, TracingSink};
