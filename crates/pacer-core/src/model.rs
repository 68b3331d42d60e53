use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{RecordId, SessionId};

/// Opaque, type-tagged data needed to redo a unit of work.
pub type Payload = serde_json::Value;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Navigation,
    Lookup,
    Extraction,
}

impl WorkKind {
    pub const ALL: [WorkKind; 3] = [WorkKind::Navigation, WorkKind::Lookup, WorkKind::Extraction];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Navigation => "navigation",
            WorkKind::Lookup => "lookup",
            WorkKind::Extraction => "extraction",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown work kind: {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for WorkKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigation" => Ok(WorkKind::Navigation),
            "lookup" => Ok(WorkKind::Lookup),
            "extraction" => Ok(WorkKind::Extraction),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A unit of work as seen by the coordinators: a kind tag plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkKind,
    pub payload: Payload,
}

impl WorkItem {
    pub fn new(kind: WorkKind, payload: Payload) -> Self {
        Self { kind, payload }
    }
}

/// A durable, replayable description of one failed unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    pub kind: WorkKind,
    pub payload: Payload,
    /// Number of failed attempts before this record was written.
    pub attempt_count: u32,
    pub due_at_ms: i64,
    pub created_at_ms: i64,
}

impl RetryRecord {
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.due_at_ms <= now_ms
    }

    pub fn to_work_item(&self) -> WorkItem {
        WorkItem::new(self.kind, self.payload.clone())
    }
}

/// Corrective action recommended by an anti-bot detector.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockAction {
    StopSession,
    PauseAndAlert,
    ReduceBatchSize,
    IncreaseDelay,
}

impl BlockAction {
    /// Actions that abort the batch without executing any item.
    pub fn aborts(&self) -> bool {
        matches!(self, BlockAction::StopSession | BlockAction::PauseAndAlert)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub blocked: bool,
    pub action: Option<BlockAction>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Detection {
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn blocked(action: BlockAction, reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            action: Some(action),
            reason: Some(reason.into()),
        }
    }
}

/// Classification of a failure, used to route it and to label alerts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Per-item failure, eligible for retry.
    TransientItemFailure,
    /// The target signalled throttling or blocking; affects the whole batch.
    BlockedBySource,
    /// Persistence layer unavailable.
    StorageFault,
    /// Terminal: the item used up its retries and was discarded.
    ExhaustedRetries,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_string_form_round_trips() {
        for kind in WorkKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkKind>().unwrap(), kind);
        }
        assert_eq!("scroll".parse::<WorkKind>(), Err(UnknownKind("scroll".into())));
    }

    #[test]
    fn only_stop_and_pause_abort() {
        assert!(BlockAction::StopSession.aborts());
        assert!(BlockAction::PauseAndAlert.aborts());
        assert!(!BlockAction::ReduceBatchSize.aborts());
        assert!(!BlockAction::IncreaseDelay.aborts());
    }

    #[test]
    fn block_action_uses_upstream_names() {
        let s = serde_json::to_string(&BlockAction::ReduceBatchSize).unwrap();
        assert_eq!(s, r#""REDUCE_BATCH_SIZE""#);
    }
}
