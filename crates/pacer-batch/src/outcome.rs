use std::time::Duration;

use pacer_core::{BlockAction, RecordId, WorkItem};
use pacer_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batch config: {0}")]
    InvalidConfig(String),
    /// Failed items that could not be written to the retry store. They are
    /// handed back so the caller can persist them some other way.
    #[error("{} failed item(s) could not be stored for retry", .unsaved.len())]
    Storage {
        #[source]
        source: StorageError,
        unsaved: Vec<WorkItem>,
        report: BatchReport,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub error: Option<String>,
    /// Retry record written for the item, if the store accepted it.
    pub retry_record: Option<RecordId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub size: usize,
    pub successes: usize,
    pub failures: Vec<ItemFailure>,
    pub success_ratio: f64,
    /// Ceiling in force after this batch.
    pub current_batch_size: usize,
    pub rolling_success_rate: f64,
    /// Pause taken after the batch; `None` for a final batch.
    pub delay: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BatchOutcome {
    /// Nothing was pending.
    Empty,
    Completed(BatchReport),
    /// The anti-bot detector asked to stop or pause. No item was executed and
    /// the pending items are left in place.
    Aborted { action: BlockAction, reason: Option<String> },
}

impl BatchOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, BatchOutcome::Aborted { .. })
    }

    pub fn report(&self) -> Option<&BatchReport> {
        match self {
            BatchOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub total_batches_processed: u64,
    pub total_lookups_processed: u64,
    pub current_batch_size: usize,
    /// Items waiting for the next batch.
    pub current_batch_count: usize,
    pub rolling_success_rate: f64,
    pub last_batch_time: Option<i64>,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
}
