use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pacer_alert::{mask_text, AlertEvent, AlertSink, TracingSink};
use pacer_core::{BlockAction, Clock, SessionId, SystemClock, WorkItem};
use pacer_retry::RetryCoordinator;
use pacer_storage::StorageError;
use tracing::{debug, info, warn};

use crate::config::{BatchConfig, DelayRange};
use crate::detector::DispatchContext;
use crate::outcome::{BatchError, BatchOutcome, BatchReport, BatchStatistics, ItemFailure};
use crate::pause::{Pause, ThreadPause};
use crate::window::RollingWindow;

/// Rolling success rate reported before any batch has completed.
const NO_HISTORY_SUCCESS_RATE: f64 = 1.0;

struct BatchState {
    pending: VecDeque<WorkItem>,
    current_max_size: usize,
    window: RollingWindow,
    batches_processed: u64,
    items_processed: u64,
    last_batch_at_ms: Option<i64>,
    widen_next_delay: bool,
}

impl BatchState {
    fn new(config: &BatchConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            current_max_size: config.max_batch_size,
            window: RollingWindow::new(config.rolling_window_size),
            batches_processed: 0,
            items_processed: 0,
            last_batch_at_ms: None,
            widen_next_delay: false,
        }
    }
}

/// Per-item result before failures are routed to the retry store.
type ItemResult = Result<(), Option<String>>;

/// Accumulates work items and dispatches them in bounded, adaptive batches.
///
/// The ceiling (`current_batch_size`) starts at `max_batch_size` and only ever
/// goes down, one step at a time, to `min_batch_size`: either because the
/// rolling success rate fell below the threshold or because the anti-bot
/// detector asked for it. Only `reset` raises it again.
///
/// Failed items are handed to the session's `RetryCoordinator` as first
/// failures.
pub struct AdaptiveBatchCoordinator {
    config: BatchConfig,
    session: SessionId,
    retries: Arc<RetryCoordinator>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    pause: Arc<dyn Pause>,
    state: BatchState,
}

impl AdaptiveBatchCoordinator {
    pub fn new(config: BatchConfig, retries: Arc<RetryCoordinator>) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            session: retries.store().session_id().clone(),
            state: BatchState::new(&config),
            config,
            retries,
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            pause: Arc::new(ThreadPause),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn add(&mut self, item: WorkItem) {
        self.state.pending.push_back(item);
    }

    pub fn is_full(&self) -> bool {
        self.state.pending.len() >= self.state.current_max_size
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending.len()
    }

    pub fn current_max_size(&self) -> usize {
        self.state.current_max_size
    }

    /// Dispatch one batch of at most `current_max_size` pending items.
    pub fn process_batch<E, H>(&mut self, executor: &E, ctx: &DispatchContext<'_, H>) -> Result<BatchOutcome, BatchError>
    where
        E: Fn(&WorkItem) -> Result<bool> + Sync,
        H: ?Sized,
    {
        self.dispatch(executor, ctx, false)
    }

    /// Dispatch batches until nothing is pending or the detector aborts.
    ///
    /// The batch that empties the queue is treated as final, so no pause
    /// follows it.
    pub fn process_pending<E, H>(&mut self, executor: &E, ctx: &DispatchContext<'_, H>) -> Result<Vec<BatchOutcome>, BatchError>
    where
        E: Fn(&WorkItem) -> Result<bool> + Sync,
        H: ?Sized,
    {
        let mut outcomes = vec![];
        while !self.state.pending.is_empty() {
            let outcome = self.dispatch(executor, ctx, true)?;
            let stop = outcome.is_aborted();
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }

    fn dispatch<E, H>(&mut self, executor: &E, ctx: &DispatchContext<'_, H>, drain: bool) -> Result<BatchOutcome, BatchError>
    where
        E: Fn(&WorkItem) -> Result<bool> + Sync,
        H: ?Sized,
    {
        if self.state.pending.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        if let Some((handle, detector)) = ctx.detection {
            match detector.detect(handle) {
                Ok(detection) if detection.blocked => match detection.action {
                    Some(action) if action.aborts() => {
                        self.sink.emit(&AlertEvent::BatchAborted {
                            session: self.session.clone(),
                            action,
                            reason: detection.reason.clone(),
                            pending: self.state.pending.len(),
                        });
                        return Ok(BatchOutcome::Aborted { action, reason: detection.reason });
                    }
                    Some(action) => {
                        if action == BlockAction::ReduceBatchSize {
                            self.reduce_ceiling("anti-bot signal");
                        } else {
                            self.state.widen_next_delay = true;
                        }
                        self.sink.emit(&AlertEvent::Throttled {
                            session: self.session.clone(),
                            action,
                            reason: detection.reason,
                            current_batch_size: self.state.current_max_size,
                        });
                    }
                    None => warn!(session = %self.session, reason = ?detection.reason, "detector reported a block without an action"),
                },
                Ok(_) => {}
                Err(err) => self.sink.emit(&AlertEvent::DetectorError {
                    session: self.session.clone(),
                    error: mask_text(&format!("{err:#}")),
                }),
            }
        }

        let take = self.state.current_max_size.min(self.state.pending.len());
        debug_assert!(take <= self.config.max_batch_size);
        let batch: Vec<WorkItem> = self.state.pending.drain(..take).collect();
        let last = ctx.is_final() || (drain && self.state.pending.is_empty());
        debug!(session = %self.session, size = batch.len(), ceiling = self.state.current_max_size, "dispatching batch");

        let results = self.execute_all(executor, &batch);

        let mut failures = vec![];
        let mut unsaved = vec![];
        let mut storage_error: Option<StorageError> = None;
        for (item, result) in batch.iter().zip(results) {
            let Err(error) = result else { continue };
            let retry_record = match self.retries.schedule(item) {
                Ok(record) => Some(record.id),
                Err(err) => {
                    unsaved.push(item.clone());
                    storage_error.get_or_insert(err);
                    None
                }
            };
            failures.push(ItemFailure {
                item: item.clone(),
                error,
                retry_record,
            });
        }

        let size = batch.len();
        let successes = size - failures.len();
        let success_ratio = successes as f64 / size as f64;
        self.state.window.push(success_ratio);
        let rolling = self.state.window.average().unwrap_or(NO_HISTORY_SUCCESS_RATE);
        if rolling < self.config.success_rate_threshold && success_ratio < self.config.success_rate_threshold {
            self.reduce_ceiling("rolling success rate below threshold");
        }

        self.state.batches_processed += 1;
        self.state.items_processed += size as u64;
        self.state.last_batch_at_ms = Some(self.clock.now_ms());
        info!(
            session = %self.session,
            size,
            successes,
            rolling_success_rate = rolling,
            ceiling = self.state.current_max_size,
            "batch complete"
        );

        let mut report = BatchReport {
            size,
            successes,
            failures,
            success_ratio,
            current_batch_size: self.state.current_max_size,
            rolling_success_rate: rolling,
            delay: None,
        };

        if let Some(source) = storage_error {
            self.sink.emit(&AlertEvent::StorageFault {
                session: self.session.clone(),
                unsaved: unsaved.len(),
                error: source.to_string(),
            });
            return Err(BatchError::Storage { source, unsaved, report });
        }

        if !last {
            let delay = self.next_delay();
            self.pause.pause(delay);
            report.delay = Some(delay);
        }
        Ok(BatchOutcome::Completed(report))
    }

    fn execute_all<E>(&self, executor: &E, batch: &[WorkItem]) -> Vec<ItemResult>
    where
        E: Fn(&WorkItem) -> Result<bool> + Sync,
    {
        if !self.config.parallel_items || batch.len() == 1 {
            return batch
                .iter()
                .map(|item| match catch_unwind(AssertUnwindSafe(|| executor(item))) {
                    Ok(result) => item_result(result),
                    Err(panic) => Err(Some(mask_text(&panic_message(panic.as_ref())))),
                })
                .collect();
        }
        std::thread::scope(|s| {
            let handles: Vec<_> = batch.iter().map(|item| s.spawn(move || executor(item))).collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => item_result(result),
                    Err(panic) => Err(Some(mask_text(&panic_message(panic.as_ref())))),
                })
                .collect()
        })
    }

    fn next_delay(&mut self) -> Duration {
        let range: DelayRange = if std::mem::take(&mut self.state.widen_next_delay) {
            self.config.inter_batch_delay.widened(self.config.delay_widen_factor)
        } else {
            self.config.inter_batch_delay
        };
        range.sample()
    }

    fn reduce_ceiling(&mut self, why: &str) {
        let before = self.state.current_max_size;
        self.state.current_max_size = before.saturating_sub(1).max(self.config.min_batch_size);
        if self.state.current_max_size != before {
            info!(session = %self.session, from = before, to = self.state.current_max_size, why, "reducing batch size");
        }
    }

    pub fn statistics(&self) -> BatchStatistics {
        BatchStatistics {
            total_batches_processed: self.state.batches_processed,
            total_lookups_processed: self.state.items_processed,
            current_batch_size: self.state.current_max_size,
            current_batch_count: self.state.pending.len(),
            rolling_success_rate: self.state.window.average().unwrap_or(NO_HISTORY_SUCCESS_RATE),
            last_batch_time: self.state.last_batch_at_ms,
            min_batch_size: self.config.min_batch_size,
            max_batch_size: self.config.max_batch_size,
        }
    }

    /// Back to a fresh state with the ceiling at `max_batch_size`. Pending items
    /// are dropped; retry records already in the store are not touched.
    pub fn reset(&mut self) {
        self.state = BatchState::new(&self.config);
    }
}

fn item_result(result: Result<bool>) -> ItemResult {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => Err(None),
        Err(err) => Err(Some(mask_text(&format!("{err:#}")))),
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

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pacer_alert::ErrorBuffer;
    use pacer_core::{BackoffPolicy, Detection, ManualClock, WorkKind};
    use pacer_storage::contract::FaultyRetryStore;
    use pacer_storage::{InMemoryRetryStore, RetryStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPause(Mutex<Vec<Duration>>);

    impl Pause for RecordingPause {
        fn pause(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    struct Fixture {
        batches: AdaptiveBatchCoordinator,
        retries: Arc<RetryCoordinator>,
        store: Arc<FaultyRetryStore<InMemoryRetryStore>>,
        pauses: Arc<RecordingPause>,
        alerts: Arc<ErrorBuffer>,
    }

    fn fixture(config: BatchConfig) -> Fixture {
        let clock = ManualClock::new(5_000);
        let inner = InMemoryRetryStore::new(SessionId::from_str("s1"), BackoffPolicy::default(), Arc::new(clock.clone()));
        let store = Arc::new(FaultyRetryStore::new(inner));
        let retries = Arc::new(RetryCoordinator::new(store.clone()));
        let pauses = Arc::new(RecordingPause::default());
        let alerts = Arc::new(ErrorBuffer::new(32));
        let batches = AdaptiveBatchCoordinator::new(config, retries.clone())
            .unwrap()
            .with_clock(Arc::new(clock))
            .with_pause(pauses.clone())
            .with_sink(alerts.clone());
        Fixture { batches, retries, store, pauses, alerts }
    }

    fn quiet() -> BatchConfig {
        BatchConfig {
            inter_batch_delay: DelayRange::new(0, 0),
            ..BatchConfig::default()
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n).map(|i| WorkItem::new(WorkKind::Lookup, json!({"n": i}))).collect()
    }

    fn ok(_: &WorkItem) -> Result<bool> {
        Ok(true)
    }

    fn exec_fail(_: &WorkItem) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn is_full_tracks_the_ceiling() {
        let mut f = fixture(quiet());
        for item in items(4) {
            f.batches.add(item);
        }
        assert!(!f.batches.is_full());
        f.batches.add(items(1).remove(0));
        assert!(f.batches.is_full());
    }

    #[test]
    fn seven_items_make_batches_of_five_and_two() {
        let mut f = fixture(quiet());
        for item in items(7) {
            f.batches.add(item);
        }
        let outcomes = f.batches.process_pending(&ok, &DispatchContext::none()).unwrap();
        let sizes: Vec<_> = outcomes.iter().map(|o| o.report().unwrap().size).collect();
        assert_eq!(sizes, vec![5, 2]);
        let stats = f.batches.statistics();
        assert_eq!(stats.total_batches_processed, 2);
        assert_eq!(stats.total_lookups_processed, 7);
        assert_eq!(stats.current_batch_count, 0);
        assert_eq!(stats.last_batch_time, Some(5_000));
        // only the non-final batch pauses
        assert_eq!(f.pauses.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_queue_is_a_distinct_outcome() {
        let mut f = fixture(quiet());
        assert_eq!(f.batches.process_batch(&ok, &DispatchContext::none()).unwrap(), BatchOutcome::Empty);
    }

    #[test]
    fn failures_do_not_abort_siblings_and_go_to_retry_store() {
        let mut f = fixture(quiet());
        for item in items(5) {
            f.batches.add(item);
        }
        let calls = AtomicUsize::new(0);
        let exec = |item: &WorkItem| -> Result<bool> {
            calls.fetch_add(1, Ordering::SeqCst);
            match item.payload["n"].as_u64() {
                Some(1) => Err(anyhow!("timeout")),
                Some(3) => panic!("detached frame"),
                _ => Ok(true),
            }
        };
        let outcome = f.batches.process_batch(&exec, &DispatchContext::none().final_batch(true)).unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(report.successes, 3);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.retry_record.is_some()));
        assert_eq!(report.delay, None);

        let store = f.retries.store();
        assert_eq!(store.count().unwrap(), 2);
        let stats = store.stats_by_kind_and_attempts().unwrap();
        assert_eq!(stats[0].attempt_count, 0);
        assert_eq!(stats[0].count, 2);
    }

    #[test]
    fn stop_session_executes_nothing() {
        let mut f = fixture(quiet());
        for item in items(3) {
            f.batches.add(item);
        }
        let detector = |_: &str| -> Result<Detection> { Ok(Detection::blocked(BlockAction::StopSession, "captcha page")) };
        let calls = AtomicUsize::new(0);
        let exec = |_: &WorkItem| -> Result<bool> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        };
        let outcome = f.batches.process_batch(&exec, &DispatchContext::with_detector("page-1", &detector)).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Aborted {
                action: BlockAction::StopSession,
                reason: Some("captcha page".into())
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.batches.pending_len(), 3);
        assert_eq!(f.batches.statistics().total_batches_processed, 0);
        assert!(matches!(f.alerts.recent(1)[0].event, AlertEvent::BatchAborted { .. }));
    }

    #[test]
    fn reduce_signal_lowers_ceiling_without_dropping_items() {
        let mut f = fixture(quiet());
        for item in items(6) {
            f.batches.add(item);
        }
        let detector = |_: &()| -> Result<Detection> { Ok(Detection::blocked(BlockAction::ReduceBatchSize, "429")) };
        let ctx = DispatchContext::with_detector(&(), &detector);
        let report = f.batches.process_batch(&ok, &ctx).unwrap().report().cloned().unwrap();
        assert_eq!(report.size, 4);
        assert_eq!(f.batches.pending_len(), 2);

        for _ in 0..5 {
            f.batches.add(items(1).remove(0));
            f.batches.process_batch(&ok, &ctx).unwrap();
        }
        assert_eq!(f.batches.current_max_size(), 3);
    }

    #[test]
    fn increase_delay_widens_only_the_next_pause() {
        let config = BatchConfig {
            inter_batch_delay: DelayRange::new(100, 100),
            ..BatchConfig::default()
        };
        let mut f = fixture(config);
        let detector = |_: &()| -> Result<Detection> { Ok(Detection::blocked(BlockAction::IncreaseDelay, "slow responses")) };
        f.batches.add(items(1).remove(0));
        f.batches.process_batch(&ok, &DispatchContext::with_detector(&(), &detector)).unwrap();
        f.batches.add(items(1).remove(0));
        f.batches.process_batch(&ok, &DispatchContext::none()).unwrap();
        let pauses = f.pauses.0.lock().unwrap().clone();
        assert_eq!(pauses, vec![Duration::from_millis(200), Duration::from_millis(100)]);
    }

    #[test]
    fn detector_errors_are_swallowed() {
        let mut f = fixture(quiet());
        for item in items(2) {
            f.batches.add(item);
        }
        let detector = |_: &()| -> Result<Detection> { Err(anyhow!("page crashed")) };
        let outcome = f.batches.process_batch(&ok, &DispatchContext::with_detector(&(), &detector)).unwrap();
        assert_eq!(outcome.report().unwrap().successes, 2);
        assert!(matches!(f.alerts.recent(1)[0].event, AlertEvent::DetectorError { .. }));
    }

    #[test]
    fn low_success_rate_reduces_once_and_never_recovers() {
        let mut f = fixture(quiet());
        let run = |f: &mut Fixture, succeed: bool| {
            for item in items(f.batches.current_max_size()) {
                f.batches.add(item);
            }
            let exec = move |_: &WorkItem| -> Result<bool> { Ok(succeed) };
            f.batches.process_batch(&exec, &DispatchContext::none()).unwrap();
            f.batches.current_max_size()
        };
        for _ in 0..5 {
            assert_eq!(run(&mut f, true), 5);
        }
        // window [1,1,1,1,1,0,0,0,0,0] averages exactly 0.5: not below
        for _ in 0..5 {
            assert_eq!(run(&mut f, false), 5);
        }
        // an eleventh batch evicts a success: 0.4 < 0.5
        assert_eq!(run(&mut f, false), 4);
        for _ in 0..10 {
            assert_eq!(run(&mut f, true), 4);
        }
        f.batches.reset();
        assert_eq!(f.batches.current_max_size(), 5);
    }

    #[test]
    fn reset_twice_equals_reset_once() {
        let mut f = fixture(quiet());
        for item in items(9) {
            f.batches.add(item);
        }
        let fail = |_: &WorkItem| -> Result<bool> { Ok(false) };
        f.batches.process_batch(&fail, &DispatchContext::none()).unwrap();
        f.batches.reset();
        let once = f.batches.statistics();
        f.batches.reset();
        assert_eq!(f.batches.statistics(), once);
        assert_eq!(once.current_batch_size, 5);
        assert_eq!(once.total_batches_processed, 0);
        assert_eq!(once.current_batch_count, 0);
        assert_eq!(once.rolling_success_rate, 1.0);
        // retry records outlive a reset
        assert_eq!(f.retries.store().count().unwrap(), 5);
    }

    #[test]
    fn sequential_mode_still_isolates_panics() {
        let mut f = fixture(BatchConfig {
            parallel_items: false,
            ..quiet()
        });
        for item in items(3) {
            f.batches.add(item);
        }
        let exec = |item: &WorkItem| -> Result<bool> {
            if item.payload["n"] == 0 {
                panic!("boom");
            }
            Ok(true)
        };
        let report = f.batches.process_batch(&exec, &DispatchContext::none()).unwrap().report().cloned().unwrap();
        assert_eq!(report.successes, 2);
        assert!(report.failures[0].error.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn storage_fault_hands_back_every_unsaved_item() {
        let mut f = fixture(BatchConfig {
            inter_batch_delay: DelayRange::new(100, 100),
            ..BatchConfig::default()
        });
        for item in items(7) {
            f.batches.add(item);
        }
        f.store.fail_enqueue(true);
        let exec = |item: &WorkItem| -> Result<bool> { Ok(item.payload["n"].as_u64().is_some_and(|n| n % 2 == 0)) };

        let err = f.batches.process_batch(&exec, &DispatchContext::none()).unwrap_err();
        let BatchError::Storage { source, unsaved, report } = err else { panic!("expected storage error, got {err:?}") };
        assert!(matches!(source, StorageError::Backend(_)));
        assert_eq!(unsaved, vec![items(5).remove(1), items(5).remove(3)]);
        assert_eq!(report.size, 5);
        assert_eq!(report.successes, 3);
        assert!(report.failures.iter().all(|failure| failure.retry_record.is_none()));
        assert_eq!(report.delay, None);

        // no pause after a faulted batch, counters still move, the rest stays queued
        assert!(f.pauses.0.lock().unwrap().is_empty());
        assert_eq!(f.batches.statistics().total_batches_processed, 1);
        assert_eq!(f.batches.pending_len(), 2);
        assert_eq!(f.store.count().unwrap(), 0);
        let alert = &f.alerts.recent(1)[0].event;
        assert!(matches!(alert, AlertEvent::StorageFault { unsaved: 2, .. }));
    }

    #[test]
    fn store_recovers_for_the_next_batch() {
        let mut f = fixture(quiet());
        for item in items(3) {
            f.batches.add(item);
        }
        let store = f.store.clone();
        let exec = move |item: &WorkItem| -> Result<bool> {
            // store goes down mid-batch; failures are written after execution
            if item.payload["n"] == 2 {
                store.fail_enqueue(true);
            }
            Ok(false)
        };
        let err = f.batches.process_batch(&exec, &DispatchContext::none().final_batch(true)).unwrap_err();
        let BatchError::Storage { unsaved, report, .. } = err else { panic!("expected storage error, got {err:?}") };
        assert_eq!(unsaved.len(), 3);
        assert_eq!(report.failures.len(), 3);

        f.store.fail_enqueue(false);
        for item in items(2) {
            f.batches.add(item);
        }
        let outcome = f.batches.process_batch(&exec_fail, &DispatchContext::none().final_batch(true)).unwrap();
        assert!(outcome.report().unwrap().failures.iter().all(|failure| failure.retry_record.is_some()));
        assert_eq!(f.retries.store().count().unwrap(), 2);
    }

    #[test]
    fn item_errors_are_masked_in_the_report() {
        let mut f = fixture(BatchConfig {
            parallel_items: false,
            ..quiet()
        });
        f.batches.add(items(1).remove(0));
        let exec = |_: &WorkItem| -> Result<bool> { Err(anyhow!("profile page for (415) 555-0100 timed out")) };
        let report = f.batches.process_batch(&exec, &DispatchContext::none()).unwrap().report().cloned().unwrap();
        assert_eq!(report.failures[0].error.as_deref(), Some("profile page for *** timed out"));
    }
}
