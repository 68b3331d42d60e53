use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pacer_core::{BackoffPolicy, ManualClock, SessionId, WorkItem, WorkKind};
use pacer_retry::{RetryCoordinator, RetryResult};
use pacer_storage::RetryStore;
use pacer_storage_sqlite::SqliteRetryStore;
use serde_json::json;
use tempfile::tempdir;

fn coordinator(db: &Path, clock: &ManualClock) -> RetryCoordinator {
    let store = SqliteRetryStore::open(db, SessionId::from_str("session-1"), BackoffPolicy::default(), Arc::new(clock.clone())).unwrap();
    RetryCoordinator::new(Arc::new(store))
}

#[test]
fn record_is_not_ready_until_base_delay_elapses() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    let retries = coordinator(&dir.path().join("pacer.db"), &clock);

    let record = retries.schedule(&WorkItem::new(WorkKind::Navigation, json!({"url": "https://example.com"}))).unwrap();
    assert!(retries.store().dequeue_next_ready().unwrap().is_none());

    clock.advance(Duration::from_millis(999));
    assert!(retries.store().dequeue_next_ready().unwrap().is_none());

    clock.advance(Duration::from_millis(1));
    let got = retries.store().dequeue_next_ready().unwrap().unwrap();
    assert_eq!(got.id, record.id);
    assert!(got.due_at_ms <= 1_700_000_001_000);
}

#[test]
fn pending_retries_survive_a_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("pacer.db");
    let clock = ManualClock::new(0);

    {
        let retries = coordinator(&db, &clock);
        retries.schedule(&WorkItem::new(WorkKind::Lookup, json!({"query": "bakery"}))).unwrap();
        clock.advance(Duration::from_secs(1));
        let res = retries.process_one(|_| Ok(false)).unwrap();
        assert!(matches!(res, RetryResult::Retrying { .. }));
    }

    let retries = coordinator(&db, &clock);
    assert_eq!(retries.stats().unwrap().total, 1);
    clock.advance(Duration::from_secs(2));
    let res = retries.process_one(|r| Ok(r.attempt_count == 1)).unwrap();
    assert!(matches!(res, RetryResult::Succeeded { attempts: 2, .. }));
    assert_eq!(retries.stats().unwrap().total, 0);
}

#[test]
fn three_failures_discard_the_record() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(0);
    let retries = coordinator(&dir.path().join("pacer.db"), &clock).with_max_retries(3);
    retries.schedule(&WorkItem::new(WorkKind::Extraction, json!({"place": 42}))).unwrap();

    let mut results = vec![];
    for _ in 0..3 {
        clock.advance(Duration::from_secs(30));
        results.extend(retries.process_all_ready(|_| Ok(false)).unwrap());
    }
    assert_eq!(results.len(), 3);
    assert!(matches!(results[2], RetryResult::Failed { attempts: 3, .. }));
    assert_eq!(retries.store().count().unwrap(), 0);
}
