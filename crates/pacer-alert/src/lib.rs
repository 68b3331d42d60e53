//! Alerting for the coordinators: structured events, sinks, and payload redaction.

pub mod buffer;
pub mod event;
pub mod redact;
pub mod sink;

pub use buffer::*;
pub use event::*;
pub use redact::*;
pub use sink::*;
