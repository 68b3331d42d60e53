use std::sync::Arc;
use std::time::Duration;

use pacer_core::{BackoffPolicy, Clock, ManualClock, SessionId, WorkKind};
use pacer_storage::RetryStore;
use pacer_storage_sqlite::SqliteRetryStore;
use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn dequeue_is_ordered_and_never_early(
        steps in proptest::collection::vec((0u32..5, 0u64..2_500, any::<bool>()), 1..30)
    ) {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(1_000);
        let store = SqliteRetryStore::open(
            &dir.path().join("pacer.db"),
            SessionId::from_str("prop"),
            BackoffPolicy::from_millis(200),
            Arc::new(clock.clone()),
        ).unwrap();

        let mut last_due = i64::MIN;
        let mut enqueued = 0u64;
        let mut dequeued = 0u64;
        for (attempts, gap, drain) in steps {
            store.enqueue(WorkKind::Lookup, json!({"attempts": attempts}), attempts).unwrap();
            enqueued += 1;
            clock.advance(Duration::from_millis(gap));
            if drain {
                // Interleaved drains only see what is due; order holds within each drain.
                let mut drain_last = i64::MIN;
                while let Some(r) = store.dequeue_next_ready().unwrap() {
                    prop_assert!(r.due_at_ms <= clock.now_ms());
                    prop_assert!(r.due_at_ms >= drain_last);
                    drain_last = r.due_at_ms;
                    dequeued += 1;
                }
            }
        }

        clock.advance(Duration::from_secs(60));
        while let Some(r) = store.dequeue_next_ready().unwrap() {
            prop_assert!(r.due_at_ms >= last_due);
            last_due = r.due_at_ms;
            dequeued += 1;
        }
        prop_assert_eq!(enqueued, dequeued);
        prop_assert_eq!(store.count().unwrap(), 0);
    }
}
