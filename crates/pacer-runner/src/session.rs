use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pacer_alert::{AlertSink, ErrorBuffer, FanoutSink, TracingSink};
use pacer_batch::AdaptiveBatchCoordinator;
use pacer_core::{Clock, SessionId, SystemClock};
use pacer_retry::RetryCoordinator;
use pacer_storage::RetryStore;
use pacer_storage_sqlite::SqliteRetryStore;
use tracing::info;

use crate::Config;

/// One scraping session's coordination state, wired from `pacer.toml`.
///
/// Both coordinators share the session's retry store and alert sinks. Alerts
/// go to `tracing` and to a bounded in-memory buffer the host can poll.
pub struct Session {
    pub root: PathBuf,
    pub cfg: Config,
    pub id: SessionId,
    pub retries: Arc<RetryCoordinator>,
    pub batches: AdaptiveBatchCoordinator,
    pub alerts: Arc<ErrorBuffer>,
}

impl Session {
    pub fn open(root: &Path, id: SessionId) -> Result<Self> {
        let cfg = Config::load_or_init(root)?;
        Self::with_config(root, cfg, id, Arc::new(SystemClock))
    }

    pub fn with_config(root: &Path, cfg: Config, id: SessionId, clock: Arc<dyn Clock>) -> Result<Self> {
        let db_path = cfg.store_path(root);
        let store = SqliteRetryStore::open(&db_path, id.clone(), cfg.retry.backoff(), clock.clone())
            .with_context(|| format!("open retry store for session {id}"))?;

        let alerts = Arc::new(ErrorBuffer::new(cfg.alerts.buffer_capacity));
        let sink: Arc<dyn AlertSink> = Arc::new(FanoutSink::new().with(Arc::new(TracingSink)).with(alerts.clone()));

        let retries = Arc::new(
            RetryCoordinator::new(Arc::new(store))
                .with_sink(sink.clone())
                .with_max_retries(cfg.retry.max_retries),
        );
        let batches = AdaptiveBatchCoordinator::new(cfg.batch.clone(), retries.clone())
            .with_context(|| "build batch coordinator")?
            .with_sink(sink)
            .with_clock(clock);

        info!(session = %id, db = %db_path.display(), "session opened");
        Ok(Self {
            root: root.to_path_buf(),
            cfg,
            id,
            retries,
            batches,
            alerts,
        })
    }

    /// Create `.pacer/pacer.toml` and the database if they do not exist yet.
    pub fn init_root(root: &Path) -> Result<PathBuf> {
        let cfg = Config::load_or_init(root)?;
        let db_path = cfg.store_path(root);
        let _ = SqliteRetryStore::open(&db_path, SessionId::from_str("init"), cfg.retry.backoff(), Arc::new(SystemClock))?;
        Ok(db_path)
    }

    pub fn store(&self) -> &Arc<dyn RetryStore> {
        self.retries.store()
    }

    /// End of session: drop every retry record it still owns. Returns how many
    /// were removed.
    pub fn teardown(self) -> Result<u64> {
        let removed = self.retries.clear().with_context(|| format!("clear retry records for session {}", self.id))?;
        info!(session = %self.id, removed, "session torn down");
        Ok(removed)
    }
}
