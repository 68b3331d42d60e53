use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use pacer_core::{Clock, ManualClock, Payload, RetryRecord, SessionId, WorkKind};
use serde_json::json;

use crate::traits::{KindAttemptCount, RetryStore, StorageError, StorageResult};

/// Shared store contract suite. Runs against every `RetryStore` backend.
///
/// `open` must return stores for the given session that share one backend,
/// read time from `clock`, and use a 1000ms base delay.
pub fn run_retry_store_contract(clock: &ManualClock, open: &dyn Fn(&SessionId) -> Box<dyn RetryStore>) -> Result<()> {
    let session = SessionId::from_str("contract-a");
    let other = SessionId::from_str("contract-b");
    let store = open(&session);
    let neighbour = open(&other);
    store.clear()?;
    neighbour.clear()?;

    // Not due yet right after a first failure.
    let first = store.enqueue(WorkKind::Lookup, json!({"q": "first"}), 0)?;
    ensure!(first.due_at_ms == clock.now_ms() + 1_000, "due time must be now + base delay");
    ensure!(store.dequeue_next_ready()?.is_none(), "record must not be ready before its due time");
    ensure!(store.count()? == 1 && store.count_ready()? == 0, "counts before due time");

    clock.advance(Duration::from_millis(1_000));
    let peeked = store.peek_next_ready()?.ok_or_else(|| anyhow!("peek should see the due record"))?;
    ensure!(peeked.id == first.id, "peek returned a different record");
    ensure!(store.count()? == 1, "peek must not remove");
    let got = store.dequeue_next_ready()?.ok_or_else(|| anyhow!("record should be due"))?;
    ensure!(got == first, "dequeued record must equal the enqueued one");
    ensure!(store.count()? == 0, "dequeue must remove");

    // Earliest due time first, insertion order on ties.
    let late = store.enqueue(WorkKind::Navigation, json!("late"), 2)?;
    let tie_a = store.enqueue(WorkKind::Extraction, json!("tie-a"), 0)?;
    let tie_b = store.enqueue(WorkKind::Extraction, json!("tie-b"), 0)?;
    let mid = store.enqueue(WorkKind::Lookup, json!("mid"), 1)?;
    neighbour.enqueue(WorkKind::Lookup, json!("other session"), 0)?;

    clock.advance(Duration::from_millis(10_000));
    ensure!(store.count_ready()? == 4, "all four records are due");
    let order: Vec<_> = std::iter::from_fn(|| store.dequeue_next_ready().transpose())
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .map(|r| r.id)
        .collect();
    ensure!(order == vec![tie_a.id, tie_b.id, mid.id, late.id], "unexpected dequeue order {order:?}");

    // Session scoping.
    ensure!(neighbour.count()? == 1, "other session must keep its record");
    store.enqueue(WorkKind::Lookup, json!(1), 0)?;
    store.enqueue(WorkKind::Lookup, json!(2), 0)?;
    store.enqueue(WorkKind::Lookup, json!(3), 1)?;
    store.enqueue(WorkKind::Navigation, json!(4), 0)?;
    let stats = store.stats_by_kind_and_attempts()?;
    let expected = vec![
        KindAttemptCount { kind: WorkKind::Navigation, attempt_count: 0, count: 1 },
        KindAttemptCount { kind: WorkKind::Lookup, attempt_count: 0, count: 2 },
        KindAttemptCount { kind: WorkKind::Lookup, attempt_count: 1, count: 1 },
    ];
    ensure!(stats == expected, "unexpected breakdown {stats:?}");

    ensure!(store.clear()? == 4, "clear should report removed rows");
    ensure!(store.count()? == 0, "clear must empty the session");
    ensure!(neighbour.count()? == 1, "clear must not touch other sessions");
    neighbour.clear()?;
    Ok(())
}

/// Store wrapper whose writes can be switched to fail, for exercising
/// storage-fault paths in the coordinators. Reads always pass through.
pub struct FaultyRetryStore<S> {
    inner: S,
    fail_enqueue: AtomicBool,
}

impl<S: RetryStore> FaultyRetryStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_enqueue: AtomicBool::new(false),
        }
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }
}

impl<S: RetryStore> RetryStore for FaultyRetryStore<S> {
    fn session_id(&self) -> &SessionId {
        self.inner.session_id()
    }

    fn enqueue(&self, kind: WorkKind, payload: Payload, attempt_count: u32) -> StorageResult<RetryRecord> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(StorageError::backend(std::io::Error::other("disk I/O error")));
        }
        self.inner.enqueue(kind, payload, attempt_count)
    }

    fn dequeue_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        self.inner.dequeue_next_ready()
    }

    fn peek_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        self.inner.peek_next_ready()
    }

    fn count(&self) -> StorageResult<u64> {
        self.inner.count()
    }

    fn count_ready(&self) -> StorageResult<u64> {
        self.inner.count_ready()
    }

    fn clear(&self) -> StorageResult<u64> {
        self.inner.clear()
    }

    fn stats_by_kind_and_attempts(&self) -> StorageResult<Vec<KindAttemptCount>> {
        self.inner.stats_by_kind_and_attempts()
    }
}
