//! Per-key mutual exclusion for fetches, plus the no-space cooldown set.
//!
//! A [`Claim`] is the right to fetch one key. It is released when dropped,
//! so every exit path of a fetch (success, denial, stream error, timeout,
//! task cancellation) gives it back. Callers that find a key busy get a
//! [`ClaimWaiter`] that resolves once the holder lets go, carrying the
//! [`ClaimOutcome`] the holder published, if any.

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::key::CacheKey;

/// How a holder finished, as seen by the callers that waited on it.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The cache entry for the key is current.
    Completed,
    /// The holder's fetch failed with this error.
    Failed(Arc<dyn Error + Send + Sync>),
}

struct Holder {
    id: u64,
    released: watch::Sender<Option<ClaimOutcome>>,
}

#[derive(Default)]
pub struct ConcurrencyGuard {
    processing: DashMap<CacheKey, Holder>,
    no_space: DashMap<CacheKey, Instant>,
    /// `None` keeps keys in the cooldown set until cleared.
    cooldown: Option<Duration>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("processing", &self.processing.len())
            .field("no_space", &self.no_space.len())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

pub enum ClaimAttempt {
    Acquired(Claim),
    Busy(ClaimWaiter),
}

impl ConcurrencyGuard {
    pub fn new(cooldown: Option<Duration>) -> Self {
        Self {
            cooldown,
            ..Default::default()
        }
    }

    /// Claim `key`, or get a handle to wait on the current holder.
    pub fn claim_or_wait(self: &Arc<Self>, key: CacheKey) -> ClaimAttempt {
        match self.processing.entry(key) {
            Entry::Occupied(held) => ClaimAttempt::Busy(ClaimWaiter {
                released: held.get().released.subscribe(),
            }),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (released, _) = watch::channel(None);
                slot.insert(Holder { id, released });
                ClaimAttempt::Acquired(Claim {
                    guard: Arc::clone(self),
                    key,
                    id,
                })
            }
        }
    }

    /// Test-and-set membership in the processing set.
    pub fn try_claim(self: &Arc<Self>, key: CacheKey) -> Option<Claim> {
        match self.claim_or_wait(key) {
            ClaimAttempt::Acquired(claim) => Some(claim),
            ClaimAttempt::Busy(_) => None,
        }
    }

    /// Wait until `key` is free and claim it.
    pub async fn claim(self: &Arc<Self>, key: CacheKey) -> Claim {
        loop {
            match self.claim_or_wait(key) {
                ClaimAttempt::Acquired(claim) => return claim,
                ClaimAttempt::Busy(waiter) => {
                    waiter.outcome().await;
                }
            }
        }
    }

    pub fn is_processing(&self, key: &CacheKey) -> bool {
        self.processing.contains_key(key)
    }

    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    fn publish(&self, key: &CacheKey, id: u64, outcome: ClaimOutcome) {
        if let Some(holder) = self.processing.get(key) {
            if holder.id == id {
                holder.released.send_replace(Some(outcome));
            }
        }
    }

    fn release(&self, key: &CacheKey, id: u64) {
        // Only the holder that inserted the entry may remove it. Dropping
        // the sender wakes every waiter.
        self.processing.remove_if(key, |_, h| h.id == id);
    }

    /// Remember that admission was denied for `key`.
    pub fn mark_no_space(&self, key: CacheKey) {
        self.no_space.insert(key, Instant::now());
    }

    /// Whether `key` was denied for space and its cooldown has not expired.
    pub fn has_no_available_space(&self, key: &CacheKey) -> bool {
        let Some(since) = self.no_space.get(key).map(|e| *e.value()) else {
            return false;
        };
        match self.cooldown {
            Some(cooldown) if since.elapsed() >= cooldown => {
                self.no_space.remove_if(key, |_, t| *t == since);
                false
            }
            _ => true,
        }
    }

    pub fn clear_no_space(&self, key: &CacheKey) {
        self.no_space.remove(key);
    }
}

/// Exclusive right to fetch one key. Released on drop.
pub struct Claim {
    guard: Arc<ConcurrencyGuard>,
    key: CacheKey,
    id: u64,
}

impl Claim {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Explicit release; equivalent to dropping the claim.
    pub fn release(self) {}

    /// Release the claim, telling waiters how the work ended.
    pub fn finish(self, outcome: ClaimOutcome) {
        self.guard.publish(&self.key, self.id, outcome);
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim").field("key", &self.key).finish()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.guard.release(&self.key, self.id);
    }
}

/// Handle on another caller's claim.
pub struct ClaimWaiter {
    released: watch::Receiver<Option<ClaimOutcome>>,
}

impl ClaimWaiter {
    /// Resolves once the holder's claim is dropped, with the outcome it
    /// published. `None` means it let go without reporting one.
    pub async fn outcome(mut self) -> Option<ClaimOutcome> {
        while self.released.changed().await.is_ok() {}
        let outcome = self.released.borrow().clone();
        outcome
    }
}
