//! LMDB-backed side-stores keyed by [`CacheKey`].
//!
//! One environment holds several named databases:
//! - `validators`: HTTP validators and timestamps per cached resource
//! - `financial`, `spreadsheet`, `rss`: plain key/value payload records
//!
//! The validator records drive staleness decisions; the key/value records
//! have no backing file and are swept purely by age.

use std::path::Path;

use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use edgecache_config::log_store_debug;

use crate::key::CacheKey;
use crate::Result;

/// Conditional-request tokens returned by the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl HttpValidators {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Per-key validator state. `updated_at` drives the staleness window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub validators: HttpValidators,
    /// Unix seconds
    pub created_at: u64,
    /// Unix seconds; 0 means "revalidate on next request"
    pub updated_at: u64,
}

impl ValidatorRecord {
    /// Whether the record was validated within `window_secs` of `now`.
    pub fn is_fresh(&self, now: u64, window_secs: u64) -> bool {
        self.updated_at > 0 && now.saturating_sub(self.updated_at) < window_secs
    }

    fn invalidate(&mut self) {
        self.validators = HttpValidators::default();
        self.updated_at = 0;
    }
}

/// Generic upsert record for feed payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    pub value: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Key/value namespaces sharing the eviction cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordNamespace {
    Financial,
    Spreadsheet,
    Rss,
}

impl RecordNamespace {
    pub const ALL: [RecordNamespace; 3] = [
        RecordNamespace::Financial,
        RecordNamespace::Spreadsheet,
        RecordNamespace::Rss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordNamespace::Financial => "financial",
            RecordNamespace::Spreadsheet => "spreadsheet",
            RecordNamespace::Rss => "rss",
        }
    }
}

type ValidatorDb = Database<Bytes, SerdeBincode<ValidatorRecord>>;
type RecordDb = Database<Bytes, SerdeBincode<KeyValueRecord>>;

pub struct MetaStore {
    env: Env,
    validators: ValidatorDb,
    financial: RecordDb,
    spreadsheet: RecordDb,
    rss: RecordDb,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl MetaStore {
    /// Side-stores are small; 256MB of address space is plenty.
    const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;

    const MAX_DBS: u32 = 4;

    /// Open or create the side-store environment in `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_dbs(Self::MAX_DBS)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let validators = env.create_database(&mut wtxn, Some("validators"))?;
        let financial = env.create_database(&mut wtxn, Some(RecordNamespace::Financial.as_str()))?;
        let spreadsheet =
            env.create_database(&mut wtxn, Some(RecordNamespace::Spreadsheet.as_str()))?;
        let rss = env.create_database(&mut wtxn, Some(RecordNamespace::Rss.as_str()))?;
        wtxn.commit()?;

        log_store_debug!(path = %path.display(), "Opened side-store");

        Ok(Self {
            env,
            validators,
            financial,
            spreadsheet,
            rss,
        })
    }

    fn records_db(&self, ns: RecordNamespace) -> &RecordDb {
        match ns {
            RecordNamespace::Financial => &self.financial,
            RecordNamespace::Spreadsheet => &self.spreadsheet,
            RecordNamespace::Rss => &self.rss,
        }
    }

    // ========================================================================
    // Validator records
    // ========================================================================

    pub fn validator(&self, key: &CacheKey) -> Result<Option<ValidatorRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.validators.get(&rtxn, key.as_bytes())?)
    }

    /// Store fresh validators for `key`, keeping the original `created_at`.
    pub fn save_validators(
        &self,
        key: &CacheKey,
        validators: HttpValidators,
        now: u64,
    ) -> Result<ValidatorRecord> {
        let mut wtxn = self.env.write_txn()?;
        let created_at = self
            .validators
            .get(&wtxn, key.as_bytes())?
            .map(|r| r.created_at)
            .unwrap_or(now);
        let record = ValidatorRecord {
            validators,
            created_at,
            updated_at: now,
        };
        self.validators.put(&mut wtxn, key.as_bytes(), &record)?;
        wtxn.commit()?;
        Ok(record)
    }

    /// Refresh `updated_at` only. Returns false if no record exists.
    pub fn touch_validator(&self, key: &CacheKey, now: u64) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let Some(mut record) = self.validators.get(&wtxn, key.as_bytes())? else {
            return Ok(false);
        };
        record.updated_at = now;
        self.validators.put(&mut wtxn, key.as_bytes(), &record)?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Drop validators so the next request for `key` goes to the origin.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let Some(mut record) = self.validators.get(&wtxn, key.as_bytes())? else {
            return Ok(false);
        };
        record.invalidate();
        self.validators.put(&mut wtxn, key.as_bytes(), &record)?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Invalidate every validator record in one transaction.
    pub fn invalidate_all(&self) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let entries = self
            .validators
            .iter(&wtxn)?
            .map(|item| item.map(|(k, v)| (k.to_vec(), v)))
            .collect::<heed::Result<Vec<_>>>()?;

        let count = entries.len();
        for (key, mut record) in entries {
            record.invalidate();
            self.validators.put(&mut wtxn, &key, &record)?;
        }
        wtxn.commit()?;
        Ok(count)
    }

    pub fn remove_validator(&self, key: &CacheKey) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.validators.delete(&mut wtxn, key.as_bytes())?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Snapshot of all validator records.
    pub fn validators(&self) -> Result<Vec<(CacheKey, ValidatorRecord)>> {
        let rtxn = self.env.read_txn()?;
        let mut result = Vec::new();
        for item in self.validators.iter(&rtxn)? {
            let (bytes, record) = item?;
            if let Some(key) = CacheKey::from_bytes(bytes) {
                result.push((key, record));
            }
        }
        Ok(result)
    }

    // ========================================================================
    // Key/value records
    // ========================================================================

    /// Upsert a record, keeping the original `created_at`.
    pub fn put_record(
        &self,
        ns: RecordNamespace,
        key: &CacheKey,
        value: impl Into<String>,
        now: u64,
    ) -> Result<KeyValueRecord> {
        let db = self.records_db(ns);
        let mut wtxn = self.env.write_txn()?;
        let created_at = db
            .get(&wtxn, key.as_bytes())?
            .map(|r| r.created_at)
            .unwrap_or(now);
        let record = KeyValueRecord {
            value: value.into(),
            created_at,
            updated_at: now,
        };
        db.put(&mut wtxn, key.as_bytes(), &record)?;
        wtxn.commit()?;
        Ok(record)
    }

    pub fn record(&self, ns: RecordNamespace, key: &CacheKey) -> Result<Option<KeyValueRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records_db(ns).get(&rtxn, key.as_bytes())?)
    }

    pub fn delete_record(&self, ns: RecordNamespace, key: &CacheKey) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.records_db(ns).delete(&mut wtxn, key.as_bytes())?;
        wtxn.commit()?;
        Ok(removed)
    }

    pub fn records(&self, ns: RecordNamespace) -> Result<Vec<(CacheKey, KeyValueRecord)>> {
        let rtxn = self.env.read_txn()?;
        let mut result = Vec::new();
        for item in self.records_db(ns).iter(&rtxn)? {
            let (bytes, record) = item?;
            if let Some(key) = CacheKey::from_bytes(bytes) {
                result.push((key, record));
            }
        }
        Ok(result)
    }

    /// Flush the environment to disk.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
