use std::sync::{Arc, Mutex, MutexGuard};

use pacer_core::{BackoffPolicy, Clock, Payload, RecordId, RetryRecord, SessionId, WorkKind};

use crate::traits::{KindAttemptCount, RetryStore, StorageError, StorageResult};

/// In-memory retry store for tests and ephemeral sessions. Not durable.
///
/// Handles created through `for_session` share the same records, so several
/// sessions can be exercised against one backend.
pub struct InMemoryRetryStore {
    session_id: SessionId,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    last_id: i64,
    records: Vec<RetryRecord>,
}

impl InMemoryRetryStore {
    pub fn new(session_id: SessionId, backoff: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            session_id,
            backoff,
            clock,
            shared: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn for_session(&self, session_id: SessionId) -> Self {
        Self {
            session_id,
            backoff: self.backoff,
            clock: self.clock.clone(),
            shared: self.shared.clone(),
        }
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.shared.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Index of the ready record with the smallest (due_at, id) in this session.
    fn next_ready_index(&self, inner: &Inner, now_ms: i64) -> Option<usize> {
        inner
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.session_id == self.session_id && r.is_ready(now_ms))
            .min_by_key(|(_, r)| (r.due_at_ms, r.id))
            .map(|(i, _)| i)
    }
}

impl RetryStore for InMemoryRetryStore {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn enqueue(&self, kind: WorkKind, payload: Payload, attempt_count: u32) -> StorageResult<RetryRecord> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        inner.last_id += 1;
        let record = RetryRecord {
            id: RecordId(inner.last_id),
            session_id: self.session_id.clone(),
            kind,
            payload,
            attempt_count,
            due_at_ms: self.backoff.due_at_ms(now, attempt_count),
            created_at_ms: now,
        };
        inner.records.push(record.clone());
        Ok(record)
    }

    fn dequeue_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        Ok(self.next_ready_index(&inner, now).map(|i| inner.records.remove(i)))
    }

    fn peek_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        let now = self.clock.now_ms();
        let inner = self.lock()?;
        Ok(self.next_ready_index(&inner, now).map(|i| inner.records[i].clone()))
    }

    fn count(&self) -> StorageResult<u64> {
        let inner = self.lock()?;
        Ok(inner.records.iter().filter(|r| r.session_id == self.session_id).count() as u64)
    }

    fn count_ready(&self) -> StorageResult<u64> {
        let now = self.clock.now_ms();
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.session_id == self.session_id && r.is_ready(now))
            .count() as u64)
    }

    fn clear(&self) -> StorageResult<u64> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner.records.retain(|r| r.session_id != self.session_id);
        Ok((before - inner.records.len()) as u64)
    }

    fn stats_by_kind_and_attempts(&self) -> StorageResult<Vec<KindAttemptCount>> {
        let inner = self.lock()?;
        let mut counts = std::collections::BTreeMap::<(WorkKind, u32), u64>::new();
        for r in inner.records.iter().filter(|r| r.session_id == self.session_id) {
            *counts.entry((r.kind, r.attempt_count)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((kind, attempt_count), count)| KindAttemptCount { kind, attempt_count, count })
            .collect())
    }
}
