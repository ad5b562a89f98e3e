//! # edgecache-store
//!
//! Storage half of the caching proxy:
//!
//! - [`key`]: canonical resource identity and [`CacheKey`] derivation
//! - [`store`]: cache and staging directories with atomic commit
//! - [`meta`]: LMDB side-stores for validators and feed records
//! - [`admission`]: free-space gating with in-flight accounting
//! - [`guard`]: per-key exclusive processing and the no-space cooldown set

pub mod admission;
pub mod guard;
pub mod key;
pub mod meta;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use admission::{DiskAdmission, FixedSpace, Reservation, SpaceProbe, StatvfsProbe};
pub use guard::{Claim, ClaimAttempt, ClaimOutcome, ClaimWaiter, ConcurrencyGuard};
pub use key::{identify, resolve, CacheKey, IdentityError, ResourceIdentity, StorageObject};
pub use meta::{HttpValidators, KeyValueRecord, MetaStore, RecordNamespace, ValidatorRecord};
pub use store::{CacheEntry, CacheStore, StorePaths, StoreStats};

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("Entry not found: {0}")]
    NotFound(CacheKey),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Current time in whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
