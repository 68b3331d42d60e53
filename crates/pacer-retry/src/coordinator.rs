use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use pacer_alert::{mask_text, payload_preview, AlertEvent, AlertSink, TracingSink, DEFAULT_PREVIEW_CHARS};
use pacer_core::{FailureClass, RetryRecord, WorkItem};
use pacer_storage::{RetryStore, StorageResult};
use tracing::debug;

use crate::error::RetryError;
use crate::outcome::{RetryResult, RetryStats};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Drives the dequeue, execute, re-enqueue-or-discard cycle for one session.
///
/// Executor errors and panics count as failures. Storage errors are never
/// swallowed: they propagate to the caller, and a record that was dequeued but
/// could not be written back travels inside `RetryError::Requeue`.
pub struct RetryCoordinator {
    store: Arc<dyn RetryStore>,
    sink: Arc<dyn AlertSink>,
    max_retries: u32,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn RetryStore>) -> Self {
        Self {
            store,
            sink: Arc::new(TracingSink),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn store(&self) -> &Arc<dyn RetryStore> {
        &self.store
    }

    /// Record a first failure (attempt 0) for later retry.
    pub fn schedule(&self, item: &WorkItem) -> StorageResult<RetryRecord> {
        self.enqueue_with_alert(item, 0)
    }

    fn enqueue_with_alert(&self, item: &WorkItem, attempt_count: u32) -> StorageResult<RetryRecord> {
        let record = match self.store.enqueue(item.kind, item.payload.clone(), attempt_count) {
            Ok(record) => record,
            Err(err) => {
                self.sink.emit(&AlertEvent::StorageFault {
                    session: self.store.session_id().clone(),
                    unsaved: 1,
                    error: err.to_string(),
                });
                return Err(err);
            }
        };
        if attempt_count == 0 {
            self.sink.emit(&AlertEvent::Enqueued {
                session: record.session_id.clone(),
                record_id: record.id,
                kind: record.kind,
                attempt_count,
                due_at_ms: record.due_at_ms,
                payload_preview: payload_preview(&record.payload, DEFAULT_PREVIEW_CHARS),
            });
        }
        Ok(record)
    }

    /// Take the next ready record, if any, and run it through `execute`.
    pub fn process_one<F>(&self, mut execute: F) -> Result<RetryResult, RetryError>
    where
        F: FnMut(&RetryRecord) -> Result<bool>,
    {
        let Some(record) = self.store.dequeue_next_ready()? else {
            return Ok(RetryResult::NoOp);
        };
        let attempts = record.attempt_count + 1;
        debug!(session = %record.session_id, record_id = %record.id, kind = %record.kind, attempt = attempts, "executing retry");

        let error = match catch_unwind(AssertUnwindSafe(|| execute(&record))) {
            Ok(Ok(true)) => {
                self.sink.emit(&AlertEvent::Succeeded {
                    session: record.session_id.clone(),
                    record_id: record.id,
                    kind: record.kind,
                    attempts,
                });
                return Ok(RetryResult::Succeeded { record, attempts });
            }
            Ok(Ok(false)) => None,
            Ok(Err(err)) => Some(mask_text(&format!("{err:#}"))),
            Err(panic) => Some(mask_text(&panic_message(panic.as_ref()))),
        };

        if attempts < self.max_retries {
            let next = match self.enqueue_with_alert(&record.to_work_item(), attempts) {
                Ok(next) => next,
                Err(source) => return Err(RetryError::Requeue { record, attempts, source }),
            };
            self.sink.emit(&AlertEvent::Retrying {
                session: record.session_id.clone(),
                record_id: record.id,
                next_record_id: next.id,
                kind: record.kind,
                attempt_count: attempts,
                due_at_ms: next.due_at_ms,
                error: error.clone(),
            });
            return Ok(RetryResult::Retrying { record, next, error });
        }

        self.sink.emit(&AlertEvent::Failed {
            session: record.session_id.clone(),
            record_id: record.id,
            kind: record.kind,
            attempts,
            class: FailureClass::ExhaustedRetries,
            payload_preview: payload_preview(&record.payload, DEFAULT_PREVIEW_CHARS),
            error: error.clone(),
        });
        Ok(RetryResult::Failed { record, attempts, error })
    }

    /// Run `process_one` until nothing is ready. Records that become due while
    /// draining may or may not be picked up; the next drain gets them.
    pub fn process_all_ready<F>(&self, mut execute: F) -> Result<Vec<RetryResult>, RetryError>
    where
        F: FnMut(&RetryRecord) -> Result<bool>,
    {
        let mut results = vec![];
        loop {
            match self.process_one(&mut execute)? {
                RetryResult::NoOp => return Ok(results),
                result => results.push(result),
            }
        }
    }

    pub fn stats(&self) -> StorageResult<RetryStats> {
        Ok(RetryStats {
            session: self.store.session_id().clone(),
            total: self.store.count()?,
            ready: self.store.count_ready()?,
            breakdown: self.store.stats_by_kind_and_attempts()?,
        })
    }

    /// Drop every pending retry for the session (teardown).
    pub fn clear(&self) -> StorageResult<u64> {
        self.store.clear()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("executor panicked: {s}")
    } else {
        "executor panicked".to_string()
    }
}
