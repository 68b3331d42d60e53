use pacer_core::{Payload, RetryRecord, SessionId, WorkKind};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt retry record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("payload encoding failed")]
    Payload(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Backend(Box::new(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One row of the kind/attempt breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KindAttemptCount {
    pub kind: WorkKind,
    pub attempt_count: u32,
    pub count: u64,
}

/// Durable retry records for a single session.
///
/// Every operation is scoped to `session_id()`; records of other sessions
/// sharing the same backend are never visible. `dequeue_next_ready` must be an
/// indivisible select-and-remove: two concurrent callers never receive the
/// same record.
pub trait RetryStore: Send + Sync {
    fn session_id(&self) -> &SessionId;

    /// Persist a new record due at `now + backoff(attempt_count)`.
    fn enqueue(&self, kind: WorkKind, payload: Payload, attempt_count: u32) -> StorageResult<RetryRecord>;

    /// Remove and return the ready record with the earliest due time.
    fn dequeue_next_ready(&self) -> StorageResult<Option<RetryRecord>>;

    /// Same selection as `dequeue_next_ready`, without removing it.
    fn peek_next_ready(&self) -> StorageResult<Option<RetryRecord>>;

    fn count(&self) -> StorageResult<u64>;
    fn count_ready(&self) -> StorageResult<u64>;

    /// Remove every record of the session. Returns how many were removed.
    fn clear(&self) -> StorageResult<u64>;

    /// Record counts grouped by kind and attempt count, ordered by both.
    fn stats_by_kind_and_attempts(&self) -> StorageResult<Vec<KindAttemptCount>>;
}
