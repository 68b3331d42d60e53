use std::sync::Arc;

use tracing::{error, info, warn};

use crate::event::AlertEvent;

/// Receives coordinator events. Implementations must not block for long.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &AlertEvent);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn emit(&self, event: &AlertEvent) {
        (**self).emit(event)
    }
}

/// Writes every event through `tracing` with structured fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn emit(&self, event: &AlertEvent) {
        match event {
            AlertEvent::Enqueued { session, record_id, kind, attempt_count, due_at_ms, payload_preview } => {
                info!(%session, %record_id, %kind, attempt = attempt_count, due_at_ms, payload = %payload_preview, "retry enqueued");
            }
            AlertEvent::Succeeded { session, record_id, kind, attempts } => {
                info!(%session, %record_id, %kind, attempts, "retry succeeded");
            }
            AlertEvent::Retrying { session, record_id, next_record_id, kind, attempt_count, due_at_ms, error } => {
                warn!(%session, %record_id, %next_record_id, %kind, attempt = attempt_count, due_at_ms, error = error.as_deref().unwrap_or(""), "retry scheduled");
            }
            AlertEvent::Failed { session, record_id, kind, attempts, class, payload_preview, error } => {
                error!(%session, %record_id, %kind, attempts, ?class, payload = %payload_preview, error = error.as_deref().unwrap_or(""), "retries exhausted, record discarded");
            }
            AlertEvent::BatchAborted { session, action, reason, pending } => {
                error!(%session, ?action, reason = reason.as_deref().unwrap_or(""), pending, "batch aborted by anti-bot signal");
            }
            AlertEvent::Throttled { session, action, reason, current_batch_size } => {
                warn!(%session, ?action, reason = reason.as_deref().unwrap_or(""), current_batch_size, "anti-bot signal, throttling");
            }
            AlertEvent::DetectorError { session, error } => {
                warn!(%session, %error, "anti-bot detector failed, continuing");
            }
            AlertEvent::StorageFault { session, unsaved, error } => {
                error!(%session, unsaved, %error, "retry store write failed");
            }
        }
    }
}

/// Forwards each event to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AlertSink for FanoutSink {
    fn emit(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
