use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::Config;
use pacer_core::{SessionId, SystemClock};
use pacer_storage::RetryStore;
use pacer_storage_sqlite::SqliteRetryStore;

/// Check `root` without creating anything: a missing config is reported, not written.
pub fn doctor_root(root: &Path) -> Result<()> {
    let cfg_path = Config::config_path(root);
    let cfg = if cfg_path.exists() { Config::load_from(&cfg_path)? } else { Config::default() };
    doctor(root, &cfg)
}

pub fn doctor(root: &Path, cfg: &Config) -> Result<()> {
    // must be initialized
    let cfg_path = Config::config_path(root);
    if !cfg_path.exists() {
        return Err(anyhow!("{} not found; run `pacer init` first", cfg_path.display()));
    }

    cfg.batch.validate().map_err(|e| anyhow!("[batch] {e}"))?;
    if cfg.retry.base_delay_ms == 0 {
        return Err(anyhow!("[retry] base_delay_ms must be positive"));
    }
    if cfg.alerts.buffer_capacity == 0 {
        return Err(anyhow!("[alerts] buffer_capacity must be at least 1"));
    }

    // store opens, migrates and answers a query
    let db_path = cfg.store_path(root);
    if !db_path.exists() {
        return Err(anyhow!("retry store {} does not exist", db_path.display()));
    }
    let store = SqliteRetryStore::open(&db_path, SessionId::from_str("doctor"), cfg.retry.backoff(), Arc::new(SystemClock))?;
    store.count().with_context(|| format!("query {}", db_path.display()))?;
    Ok(())
}
