//! Invalidation listener.
//!
//! Keeps the table of registered paths, turns push messages into cache
//! invalidations and publishes a debounced online/offline status.
//!
//! Resync policy: a full invalidation of every validator record happens
//! when a heartbeat carries a sequence newer than the last one applied, and
//! on every reconnect after the first connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;

use edgecache_config::{log_push_debug, log_push_info, log_push_warn};
use edgecache_fetch::PathWatch;
use edgecache_store::{CacheKey, CacheStore, ConcurrencyGuard, StorageObject};

use crate::channel::{ChannelHandler, Outbox};
use crate::messages::{PushMessage, StorageUpdate};

/// A (company, path) pair the service has been asked to watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisteredPath {
    pub company_id: String,
    pub path: String,
}

impl RegisteredPath {
    fn message(&self) -> PushMessage {
        PushMessage::register_path(self.company_id.as_str(), self.path.as_str())
    }
}

/// Externally reported connectivity, debounced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Debounced status shared with the offline timer task.
struct StatusBoard {
    tx: watch::Sender<ConnectionStatus>,
    /// Bumped on every transition; a pending offline report only fires if
    /// nothing happened since it was scheduled.
    generation: AtomicU64,
}

pub struct InvalidationListener {
    store: Arc<CacheStore>,
    guard: Arc<ConcurrencyGuard>,
    outbox: Outbox,
    display_id: Option<String>,
    offline_grace: Duration,
    registrations: DashSet<RegisteredPath>,
    last_sequence: AtomicU64,
    resyncs: AtomicU64,
    status: Arc<StatusBoard>,
}

impl InvalidationListener {
    pub fn new(
        store: Arc<CacheStore>,
        guard: Arc<ConcurrencyGuard>,
        outbox: Outbox,
        display_id: Option<String>,
        offline_grace: Duration,
    ) -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Offline);
        Self {
            store,
            guard,
            outbox,
            display_id,
            offline_grace,
            registrations: DashSet::new(),
            last_sequence: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            status: Arc::new(StatusBoard {
                tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Watch `path` for `company_id`. Returns true if it was not yet
    /// registered. The message is sent now if connected, and replayed on
    /// every future connection either way.
    pub fn register_path(&self, company_id: &str, path: &str) -> bool {
        let registration = RegisteredPath {
            company_id: company_id.to_string(),
            path: path.to_string(),
        };
        if !self.registrations.insert(registration.clone()) {
            return false;
        }
        log_push_debug!(company_id, path, "Registered path");
        self.outbox.send(registration.message());
        true
    }

    pub fn registrations(&self) -> Vec<RegisteredPath> {
        let mut all: Vec<_> = self.registrations.iter().map(|r| r.key().clone()).collect();
        all.sort();
        all
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.tx.subscribe()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Full resyncs performed so far.
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::SeqCst)
    }

    /// Apply one inbound message.
    pub fn apply(&self, msg: PushMessage) {
        match msg {
            PushMessage::StorageUpdate(update) => self.apply_update(&update),
            PushMessage::Heartbeat {
                display_id,
                last_message_time,
            } => self.apply_heartbeat(display_id.as_deref(), last_message_time),
            PushMessage::RegisterPath { .. } | PushMessage::Unknown => {}
        }
    }

    fn apply_update(&self, update: &StorageUpdate) {
        if let Some(time) = update.message_time {
            self.last_sequence.fetch_max(time, Ordering::SeqCst);
        }
        let Some(object) = update.object() else {
            log_push_debug!(resource = %update.resource, "Update names no bucket or company");
            return;
        };

        let key = object.key();
        if update.kind.removes_content() {
            self.evict(key, &object);
        } else {
            self.invalidate(key, &object);
        }

        // Folder listings that include the object are stale too.
        if let Some(parent) = object.parent_folder() {
            self.invalidate(parent.key(), &parent);
        }
    }

    fn invalidate(&self, key: CacheKey, object: &StorageObject) {
        match self.store.meta().invalidate(&key) {
            Ok(true) => log_push_debug!(object = %object.identity(), "Invalidated"),
            Ok(false) => {}
            Err(e) => log_push_warn!(key = %key, error = %e, "Failed to invalidate"),
        }
    }

    fn evict(&self, key: CacheKey, object: &StorageObject) {
        match self.guard.try_claim(key) {
            Some(_claim) => {
                if let Err(e) = self.store.evict(&key) {
                    log_push_warn!(key = %key, error = %e, "Failed to evict");
                } else {
                    log_push_debug!(object = %object.identity(), "Evicted");
                }
            }
            None => {
                // A fetch is writing this key; evict once it lets go.
                self.invalidate(key, object);
                let store = Arc::clone(&self.store);
                let guard = Arc::clone(&self.guard);
                tokio::spawn(async move {
                    let _claim = guard.claim(key).await;
                    if let Err(e) = store.evict(&key) {
                        log_push_warn!(key = %key, error = %e, "Deferred eviction failed");
                    }
                });
            }
        }
    }

    fn apply_heartbeat(&self, display_id: Option<&str>, sequence: u64) {
        if let (Some(ours), Some(theirs)) = (self.display_id.as_deref(), display_id) {
            if ours != theirs {
                return;
            }
        }
        let previous = self.last_sequence.fetch_max(sequence, Ordering::SeqCst);
        if sequence > previous {
            self.resync("heartbeat sequence advanced");
        }
    }

    /// Invalidate every validator record.
    pub fn resync(&self, reason: &str) {
        match self.store.meta().invalidate_all() {
            Ok(count) => {
                self.resyncs.fetch_add(1, Ordering::SeqCst);
                log_push_info!(reason, records = count, "Full resync");
            }
            Err(e) => log_push_warn!(reason, error = %e, "Full resync failed"),
        }
    }

    fn replay_registrations(&self) {
        let registrations = self.registrations();
        for registration in &registrations {
            self.outbox.send(registration.message());
        }
        if !registrations.is_empty() {
            log_push_debug!(count = registrations.len(), "Replayed registrations");
        }
    }
}

impl ChannelHandler for InvalidationListener {
    fn on_connected(&self, reconnect: bool) {
        self.status.generation.fetch_add(1, Ordering::SeqCst);
        self.status.tx.send_replace(ConnectionStatus::Online);

        self.replay_registrations();
        if reconnect {
            self.resync("reconnected");
        }
    }

    fn on_message(&self, msg: PushMessage) {
        self.apply(msg);
    }

    fn on_disconnected(&self) {
        let generation = self.status.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let board = Arc::clone(&self.status);
        let grace = self.offline_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if board.generation.load(Ordering::SeqCst) == generation {
                board.tx.send_replace(ConnectionStatus::Offline);
                log_push_info!("Push channel offline");
            }
        });
    }
}

impl PathWatch for InvalidationListener {
    fn watch(&self, object: &StorageObject) {
        if let Some(company_id) = object.company_id() {
            self.register_path(company_id, &object.path);
        }
    }
}
