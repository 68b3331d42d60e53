use pacer_core::{RetryRecord, SessionId};
use pacer_storage::KindAttemptCount;
use serde::Serialize;

/// Result of one `process_one` step.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryResult {
    /// Nothing was ready.
    NoOp,
    Succeeded {
        record: RetryRecord,
        /// Total attempts including this one.
        attempts: u32,
    },
    /// Failed again and was written back with a later due time.
    Retrying {
        record: RetryRecord,
        next: RetryRecord,
        error: Option<String>,
    },
    /// Retries exhausted. The record is gone from the store and must be
    /// surfaced to whoever alerts on lost work.
    Failed {
        record: RetryRecord,
        attempts: u32,
        error: Option<String>,
    },
}

impl RetryResult {
    pub fn is_noop(&self) -> bool {
        matches!(self, RetryResult::NoOp)
    }

    pub fn record(&self) -> Option<&RetryRecord> {
        match self {
            RetryResult::NoOp => None,
            RetryResult::Succeeded { record, .. } | RetryResult::Retrying { record, .. } | RetryResult::Failed { record, .. } => {
                Some(record)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryStats {
    pub session: SessionId,
    pub total: u64,
    pub ready: u64,
    pub breakdown: Vec<KindAttemptCount>,
}
