//! Retention sweep over cached files and side-store records.
//!
//! A run snapshots everything it will look at up front and processes each
//! item exactly once:
//! - cache files idle (by access time) past the file retention window are
//!   evicted together with every record under the same key
//! - validator records with no cache file, untouched for that same window
//! - key/value records whose `updated_at` is past the record retention
//!   window, regardless of access time
//!
//! A failing item is logged and counted; it never aborts the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use edgecache_config::{log_evict_debug, log_evict_error, log_evict_info, log_evict_warn};
use edgecache_store::{unix_now, CacheKey, CacheStore, ConcurrencyGuard, RecordNamespace, StoreError};

#[derive(Error, Debug)]
pub enum EvictionError {
    #[error("An eviction sweep is already running")]
    AlreadyRunning,

    #[error("Failed to enumerate cache entries: {0}")]
    Enumerate(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EvictionSettings {
    pub file_retention: Duration,
    pub record_retention: Duration,
}

impl Default for EvictionSettings {
    fn default() -> Self {
        Self {
            file_retention: Duration::from_secs(7 * 24 * 3600),
            record_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl From<&edgecache_config::EvictionConfig> for EvictionSettings {
    fn from(cfg: &edgecache_config::EvictionConfig) -> Self {
        Self {
            file_retention: Duration::from_secs(cfg.file_retention_secs),
            record_retention: Duration::from_secs(cfg.record_retention_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Items snapshotted at the start of the run.
    pub enumerated: u64,
    pub processed: u64,
    /// Cache files removed.
    pub evicted: u64,
    pub failed: u64,
    /// Side-store records removed without a file.
    pub records_evicted: u64,
}

impl SweepReport {
    pub fn is_complete(&self) -> bool {
        self.processed == self.enumerated
    }
}

/// Clears the running flag when a sweep ends, however it ends.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Item {
    File(CacheKey),
    OrphanValidator(CacheKey, u64),
    Record(RecordNamespace, CacheKey, u64),
}

pub struct EvictionJob {
    store: Arc<CacheStore>,
    guard: Arc<ConcurrencyGuard>,
    settings: EvictionSettings,
    running: AtomicBool,
}

impl EvictionJob {
    pub fn new(
        store: Arc<CacheStore>,
        guard: Arc<ConcurrencyGuard>,
        settings: EvictionSettings,
    ) -> Self {
        Self {
            store,
            guard,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one sweep. Fails fast with `AlreadyRunning` if another is active.
    pub fn run_once(&self) -> Result<SweepReport, EvictionError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EvictionError::AlreadyRunning);
        }
        let _flag = RunningFlag(&self.running);

        let items = self.snapshot()?;
        Ok(self.sweep(items))
    }

    fn sweep(&self, items: Vec<Item>) -> SweepReport {
        let mut report = SweepReport {
            enumerated: items.len() as u64,
            ..Default::default()
        };
        log_evict_info!(items = report.enumerated, "Eviction sweep started");

        let now = unix_now();
        let now_sys = SystemTime::now();
        for item in items {
            report.processed += 1;
            match self.process(&item, now, now_sys) {
                Ok(Outcome::Kept) => {}
                Ok(Outcome::FileEvicted) => report.evicted += 1,
                Ok(Outcome::RecordEvicted) => report.records_evicted += 1,
                Err(e) => {
                    report.failed += 1;
                    log_evict_warn!(key = %item.key(), error = %e, "Failed to evict item");
                }
            }
        }

        log_evict_info!(
            enumerated = report.enumerated,
            processed = report.processed,
            evicted = report.evicted,
            records_evicted = report.records_evicted,
            failed = report.failed,
            "Eviction sweep finished"
        );
        report
    }

    fn snapshot(&self) -> Result<Vec<Item>, StoreError> {
        let entries = self.store.entries()?;
        let cached: HashSet<CacheKey> = entries.iter().map(|e| e.key).collect();

        let mut items: Vec<Item> = entries.into_iter().map(|e| Item::File(e.key)).collect();
        for (key, record) in self.store.meta().validators()? {
            if !cached.contains(&key) {
                items.push(Item::OrphanValidator(key, record.updated_at));
            }
        }
        for ns in RecordNamespace::ALL {
            for (key, record) in self.store.meta().records(ns)? {
                items.push(Item::Record(ns, key, record.updated_at));
            }
        }
        Ok(items)
    }

    fn process(&self, item: &Item, now: u64, now_sys: SystemTime) -> Result<Outcome, StoreError> {
        match *item {
            Item::File(key) => {
                let Some(accessed) = self.store.last_access_time(&key) else {
                    // Removed since the snapshot.
                    return Ok(Outcome::Kept);
                };
                let idle = now_sys.duration_since(accessed).unwrap_or_default();
                if idle < self.settings.file_retention {
                    return Ok(Outcome::Kept);
                }
                let Some(_claim) = self.guard.try_claim(key) else {
                    log_evict_debug!(key = %key, "Skipping entry with a fetch in flight");
                    return Ok(Outcome::Kept);
                };
                self.store.evict(&key)?;
                for ns in RecordNamespace::ALL {
                    self.store.meta().delete_record(ns, &key)?;
                }
                log_evict_debug!(key = %key, idle_secs = idle.as_secs(), "Evicted idle entry");
                Ok(Outcome::FileEvicted)
            }
            Item::OrphanValidator(key, updated_at) => {
                if !expired(now, updated_at, self.settings.file_retention)
                    || self.guard.is_processing(&key)
                    || self.store.is_cached(&key)
                {
                    return Ok(Outcome::Kept);
                }
                self.store.meta().remove_validator(&key)?;
                Ok(Outcome::RecordEvicted)
            }
            Item::Record(ns, key, updated_at) => {
                if !expired(now, updated_at, self.settings.record_retention) {
                    return Ok(Outcome::Kept);
                }
                self.store.meta().delete_record(ns, &key)?;
                log_evict_debug!(key = %key, namespace = ns.as_str(), "Evicted expired record");
                Ok(Outcome::RecordEvicted)
            }
        }
    }

    /// Sweep every `interval` on a blocking worker. The first sweep runs
    /// one interval after start.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let job = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || job.run_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(EvictionError::AlreadyRunning)) => {
                        log_evict_debug!("Previous sweep still running, skipping tick");
                    }
                    Ok(Err(e)) => log_evict_error!(error = %e, "Eviction sweep failed"),
                    Err(e) => log_evict_error!(error = %e, "Eviction task panicked"),
                }
            }
        })
    }
}

enum Outcome {
    Kept,
    FileEvicted,
    RecordEvicted,
}

impl Item {
    fn key(&self) -> &CacheKey {
        match self {
            Item::File(key) | Item::OrphanValidator(key, _) | Item::Record(_, key, _) => key,
        }
    }
}

fn expired(now: u64, updated_at: u64, retention: Duration) -> bool {
    now.saturating_sub(updated_at) >= retention.as_secs()
}
