use pacer_core::RetryRecord;
use pacer_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The record was already taken out of the store when writing it back
    /// failed. It is handed back so the caller can persist or alert on it.
    #[error("retry record {} ({}) could not be written back after attempt {}", .record.id, .record.kind, .attempts)]
    Requeue {
        record: RetryRecord,
        attempts: u32,
        #[source]
        source: StorageError,
    },
}

impl RetryError {
    /// The record no longer held by any store, if this error lost one.
    pub fn unsaved(&self) -> Option<&RetryRecord> {
        match self {
            RetryError::Requeue { record, .. } => Some(record),
            RetryError::Storage(_) => None,
        }
    }
}
