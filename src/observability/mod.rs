//! Observability subsystem
//!
//! - Structured logging (JSON lines)
//! - Counter metrics
//! - Typed lifecycle events
//!
//! Observability is read-only: it never changes recovery behavior.
//!
//! ```ignore
//! use shard_recovery::observability::{log_event, Event};
//!
//! log_event(Event::PullStart, &[("object", "foo"), ("from", "shard.2")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event at its own severity.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
