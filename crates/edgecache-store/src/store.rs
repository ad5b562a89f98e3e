//! Cache and staging directories.
//!
//! Layout, one file per key in each directory:
//!
//! ```text
//! staging/<32-hex-key>   in-progress download, never served
//! cache/<32-hex-key>     committed entry
//! meta/                  LMDB side-stores (see `meta`)
//! ```
//!
//! Downloads always land in staging first; [`CacheStore::commit`] renames
//! them into the cache directory so a partial file is never visible under a
//! cache path.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use edgecache_config::{log_store_debug, log_store_info, log_store_warn};
use filetime::FileTime;
use walkdir::WalkDir;

use crate::key::CacheKey;
use crate::meta::MetaStore;
use crate::{Result, StoreError};

/// Suffix of temp files produced by the cross-device commit fallback.
const TMP_SUFFIX: &str = "tmp";

/// Directories backing a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub meta_dir: PathBuf,
}

impl From<&edgecache_config::CacheConfig> for StorePaths {
    fn from(cfg: &edgecache_config::CacheConfig) -> Self {
        Self {
            cache_dir: cfg.cache_dir.clone(),
            staging_dir: cfg.staging_dir.clone(),
            meta_dir: cfg.meta_dir.clone(),
        }
    }
}

/// A committed file in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub staging_count: u64,
}

#[derive(Debug)]
pub struct CacheStore {
    cache_dir: PathBuf,
    staging_dir: PathBuf,
    meta: MetaStore,
}

impl CacheStore {
    /// Open the store, creating any missing directories.
    pub fn open(paths: &StorePaths) -> Result<Self> {
        fs::create_dir_all(&paths.cache_dir)?;
        fs::create_dir_all(&paths.staging_dir)?;
        let meta = MetaStore::open(&paths.meta_dir)?;

        Ok(Self {
            cache_dir: paths.cache_dir.clone(),
            staging_dir: paths.staging_dir.clone(),
            meta,
        })
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn path_in_staging(&self, key: &CacheKey) -> PathBuf {
        self.staging_dir.join(key.to_hex())
    }

    pub fn path_in_cache(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.to_hex())
    }

    /// Whether a committed file exists. The empty key is never cached.
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        !key.is_none() && self.path_in_cache(key).is_file()
    }

    pub fn is_staging(&self, key: &CacheKey) -> bool {
        !key.is_none() && self.path_in_staging(key).is_file()
    }

    pub fn cached_size(&self, key: &CacheKey) -> Option<u64> {
        if key.is_none() {
            return None;
        }
        fs::metadata(self.path_in_cache(key)).ok().map(|m| m.len())
    }

    /// Filesystem access time of the cached file.
    ///
    /// Advisory only: `noatime` mounts never move it, and `relatime` moves it
    /// at most once a day. Serving paths call [`CacheStore::touch`] so the
    /// value stays meaningful regardless of mount options.
    pub fn last_access_time(&self, key: &CacheKey) -> Option<SystemTime> {
        if key.is_none() {
            return None;
        }
        fs::metadata(self.path_in_cache(key))
            .and_then(|m| m.accessed())
            .ok()
    }

    /// Stamp the access time of a cached file with the current time.
    pub fn touch(&self, key: &CacheKey) -> Result<()> {
        let path = self.path_in_cache(key);
        filetime::set_file_atime(&path, FileTime::now()).map_err(|e| not_found_or_io(e, key))
    }

    /// Move the staging file for `key` into the cache directory, replacing
    /// any existing entry. Returns the committed size.
    ///
    /// On failure the staging file is removed.
    pub fn commit(&self, key: &CacheKey) -> Result<u64> {
        if key.is_none() {
            return Err(StoreError::NotFound(*key));
        }
        let staging = self.path_in_staging(key);
        let target = self.path_in_cache(key);

        let size = match fs::metadata(&staging) {
            Ok(m) => m.len(),
            Err(e) => return Err(not_found_or_io(e, key)),
        };

        match fs::rename(&staging, &target) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                log_store_debug!(key = %key, "Staging and cache on different devices, copying");
                let copied = self.copy_into_cache(&staging, &target);
                let _ = fs::remove_file(&staging);
                copied?;
            }
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(StoreError::Io(e));
            }
        }

        log_store_debug!(key = %key, size, "Committed entry");
        Ok(size)
    }

    /// Copy to a temp name beside the target, then rename it in place.
    fn copy_into_cache(&self, staging: &Path, target: &Path) -> Result<()> {
        let temp_path = target.with_extension(format!("{}.{}", std::process::id(), TMP_SUFFIX));
        let copied = fs::copy(staging, &temp_path)
            .and_then(|_| File::open(&temp_path)?.sync_all())
            .and_then(|_| fs::rename(&temp_path, target));
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    /// Remove a partially written staging file. Missing files are fine.
    pub fn discard_staging(&self, key: &CacheKey) -> Result<()> {
        remove_if_exists(&self.path_in_staging(key))
    }

    /// Remove the cache file only, leaving the validator record.
    pub fn remove_file(&self, key: &CacheKey) -> Result<bool> {
        match fs::remove_file(self.path_in_cache(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Remove the cache file and its validator record.
    /// Returns true if either existed.
    pub fn evict(&self, key: &CacheKey) -> Result<bool> {
        let file_removed = self.remove_file(key)?;
        let record_removed = self.meta.remove_validator(key)?;
        if file_removed || record_removed {
            log_store_debug!(key = %key, file_removed, record_removed, "Evicted entry");
        }
        Ok(file_removed || record_removed)
    }

    /// Read a whole cached file.
    pub fn read(&self, key: &CacheKey) -> Result<Vec<u8>> {
        fs::read(self.path_in_cache(key)).map_err(|e| not_found_or_io(e, key))
    }

    /// Read `len` bytes starting at `offset` from a cached file.
    pub fn read_range(&self, key: &CacheKey, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.path_in_cache(key)).map_err(|e| not_found_or_io(e, key))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::new();
        file.take(len).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Enumerate committed entries. Temp files and foreign names are skipped.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for item in WalkDir::new(&self.cache_dir).min_depth(1).max_depth(1) {
            let item = match item {
                Ok(item) => item,
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => return Err(StoreError::Io(e.into())),
            };
            if !item.file_type().is_file() {
                continue;
            }
            let Some(key) = item.file_name().to_str().and_then(CacheKey::from_hex) else {
                continue;
            };
            // Deleted between listing and stat: a concurrent eviction won.
            let Ok(metadata) = item.metadata() else {
                continue;
            };
            entries.push(CacheEntry {
                key,
                path: item.path().to_path_buf(),
                size: metadata.len(),
            });
        }
        Ok(entries)
    }

    /// Remove staging files (and commit temp files) older than `max_age`.
    ///
    /// Such files are left behind only by a crash mid-download.
    pub fn clean_staging(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        let staging = WalkDir::new(&self.staging_dir).min_depth(1).max_depth(1);
        let temps = WalkDir::new(&self.cache_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == TMP_SUFFIX));

        for item in staging.into_iter().flatten().chain(temps) {
            if !item.file_type().is_file() {
                continue;
            }
            let age = item
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_file(item.path()) {
                Ok(()) => removed += 1,
                Err(e) => log_store_warn!(path = ?item.path(), error = %e, "Failed to remove orphan"),
            }
        }

        if removed > 0 {
            log_store_info!(removed, "Cleaned orphaned staging files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let entries = self.entries()?;
        let staging_count = fs::read_dir(&self.staging_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count() as u64;

        Ok(StoreStats {
            entry_count: entries.len() as u64,
            total_bytes: entries.iter().map(|e| e.size).sum(),
            staging_count,
        })
    }
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}

fn not_found_or_io(e: io::Error, key: &CacheKey) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(*key)
    } else {
        StoreError::Io(e)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(e)),
    }
}
