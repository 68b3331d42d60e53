use pacer_core::{BlockAction, FailureClass, RecordId, SessionId, WorkKind};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

/// Something a coordinator wants the host to know about.
///
/// Payloads only ever travel as redacted previews.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    /// A failed item was written to the retry store.
    Enqueued {
        session: SessionId,
        record_id: RecordId,
        kind: WorkKind,
        attempt_count: u32,
        due_at_ms: i64,
        payload_preview: String,
    },
    Succeeded {
        session: SessionId,
        record_id: RecordId,
        kind: WorkKind,
        attempts: u32,
    },
    Retrying {
        session: SessionId,
        record_id: RecordId,
        next_record_id: RecordId,
        kind: WorkKind,
        attempt_count: u32,
        due_at_ms: i64,
        error: Option<String>,
    },
    /// Retries exhausted; the record was dropped.
    Failed {
        session: SessionId,
        record_id: RecordId,
        kind: WorkKind,
        attempts: u32,
        class: FailureClass,
        payload_preview: String,
        error: Option<String>,
    },
    BatchAborted {
        session: SessionId,
        action: BlockAction,
        reason: Option<String>,
        pending: usize,
    },
    Throttled {
        session: SessionId,
        action: BlockAction,
        reason: Option<String>,
        current_batch_size: usize,
    },
    DetectorError {
        session: SessionId,
        error: String,
    },
    /// Items that could not be written to the retry store.
    StorageFault {
        session: SessionId,
        unsaved: usize,
        error: String,
    },
}

impl AlertEvent {
    pub fn level(&self) -> AlertLevel {
        match self {
            AlertEvent::Enqueued { .. } | AlertEvent::Succeeded { .. } => AlertLevel::Info,
            AlertEvent::Retrying { .. } | AlertEvent::Throttled { .. } | AlertEvent::DetectorError { .. } => AlertLevel::Warn,
            AlertEvent::Failed { .. } | AlertEvent::BatchAborted { .. } | AlertEvent::StorageFault { .. } => AlertLevel::Error,
        }
    }

    pub fn session(&self) -> &SessionId {
        match self {
            AlertEvent::Enqueued { session, .. }
            | AlertEvent::Succeeded { session, .. }
            | AlertEvent::Retrying { session, .. }
            | AlertEvent::Failed { session, .. }
            | AlertEvent::BatchAborted { session, .. }
            | AlertEvent::Throttled { session, .. }
            | AlertEvent::DetectorError { session, .. }
            | AlertEvent::StorageFault { session, .. } => session,
        }
    }
}
