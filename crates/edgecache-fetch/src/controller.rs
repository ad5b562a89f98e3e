//! Download and revalidation of a single resource.
//!
//! Per request:
//!
//! ```text
//! resolve key ─► range on cached file? ─► serve (no network)
//!             ─► validated within staleness window? ─► serve
//!             ─► denied for space recently? ─► fallback / fail
//!             ─► claim key (or wait for the holder, then start over)
//!             ─► conditional GET ─► 304: touch record, serve
//!                                ─► 2xx: reserve space, stream to staging,
//!                                        commit, save validators, serve
//!                                ─► error: serve cached copy or fail
//! ```
//!
//! `request_timeout` bounds the wait for response headers and each gap
//! between body chunks, never the transfer as a whole: a slow body that
//! keeps arriving is not cut off. When it fires the partial staging file is
//! removed and the reservation released before the claim goes away.
//!
//! Callers that find the key claimed wait for the holder and take its
//! result: a completed fetch is served from the cache, a failed one is
//! answered with the cached copy or the same error, without another origin
//! request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use edgecache_config::{log_fetch_debug, log_fetch_info, log_fetch_warn};
use edgecache_store::{
    identify, unix_now, CacheKey, CacheStore, ClaimAttempt, ClaimOutcome, ConcurrencyGuard,
    DiskAdmission, Reservation, StorageObject,
};

use crate::origin::{Origin, OriginError, OriginResponse};
use crate::range::{parse_range, ByteRange};
use crate::FetchError;

/// Unknown-length downloads re-check headroom after this many bytes.
const GROWTH_STEP: u64 = 8 * 1024 * 1024;

/// Per-controller tunables, built from `[cache]` config by the caller.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Free space that must remain after admitting a download.
    pub threshold_bytes: u64,
    /// Entries validated more recently than this are served without network.
    pub staleness: Duration,
    /// Limit on the wait for response headers and on each gap between
    /// body chunks.
    pub request_timeout: Duration,
    /// Stamp the cache file's access time on every serve.
    pub stamp_access_time: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 512 * 1024 * 1024,
            staleness: Duration::from_secs(300),
            request_timeout: Duration::from_secs(120),
            stamp_access_time: true,
        }
    }
}

impl From<&edgecache_config::CacheConfig> for FetchSettings {
    fn from(cfg: &edgecache_config::CacheConfig) -> Self {
        Self {
            threshold_bytes: cfg.disk_threshold_bytes,
            staleness: cfg.staleness(),
            request_timeout: cfg.request_timeout(),
            stamp_access_time: cfg.stamp_access_time,
        }
    }
}

/// Receives storage objects as they are requested so changes to them can
/// be pushed back as invalidations.
pub trait PathWatch: Send + Sync {
    fn watch(&self, object: &StorageObject);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub url: String,
    /// Raw `Range` header, if the client sent one.
    pub range: Option<String>,
}

impl CacheRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// A cached file ready to be streamed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub key: CacheKey,
    pub path: PathBuf,
    /// Full size of the cached file.
    pub size: u64,
    /// Set for partial-content responses.
    pub range: Option<ByteRange>,
}

impl Served {
    /// Number of bytes the response body carries.
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.size, |r| r.len())
    }

    /// Read the served bytes.
    ///
    /// The file may be evicted between the decision and the read; callers
    /// treat `NotFound` here as a miss and retry the request.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let mut data = Vec::new();
        match self.range {
            Some(range) => {
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                file.take(range.len()).read_to_end(&mut data).await?;
            }
            None => {
                file.read_to_end(&mut data).await?;
            }
        }
        Ok(data)
    }
}

/// Result of one request, in place of event callbacks.
#[derive(Debug)]
pub enum CacheOutcome {
    /// Served from cache without contacting the origin.
    Cached(Served),
    /// The origin answered 304; the cached copy was served.
    Revalidated(Served),
    /// A new body was downloaded and committed.
    Fetched(Served),
    /// The origin failed; the last good copy was served.
    Fallback { served: Served, cause: FetchError },
    Failed(FetchError),
}

impl CacheOutcome {
    pub fn served(&self) -> Option<&Served> {
        match self {
            CacheOutcome::Cached(s)
            | CacheOutcome::Revalidated(s)
            | CacheOutcome::Fetched(s)
            | CacheOutcome::Fallback { served: s, .. } => Some(s),
            CacheOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            CacheOutcome::Fallback { cause, .. } => Some(cause),
            CacheOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// HTTP status a route layer would answer with.
    pub fn status_code(&self) -> u16 {
        match (self.served(), self) {
            (Some(s), _) if s.range.is_some() => 206,
            (Some(_), _) => 200,
            (None, CacheOutcome::Failed(e)) => e.status_code(),
            (None, _) => 500,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CacheOutcome::Cached(_) => "cached",
            CacheOutcome::Revalidated(_) => "revalidated",
            CacheOutcome::Fetched(_) => "fetched",
            CacheOutcome::Fallback { .. } => "fallback",
            CacheOutcome::Failed(_) => "failed",
        }
    }
}

/// What the origin exchange left in the cache.
enum Exchange {
    NotModified,
    Stored { size: u64 },
}

pub struct CacheController {
    store: Arc<CacheStore>,
    admission: Arc<DiskAdmission>,
    guard: Arc<ConcurrencyGuard>,
    origin: Arc<dyn Origin>,
    settings: FetchSettings,
    watch: Option<Arc<dyn PathWatch>>,
}

impl CacheController {
    pub fn new(
        store: Arc<CacheStore>,
        admission: Arc<DiskAdmission>,
        guard: Arc<ConcurrencyGuard>,
        origin: Arc<dyn Origin>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            store,
            admission,
            guard,
            origin,
            settings,
            watch: None,
        }
    }

    pub fn with_path_watch(mut self, watch: Arc<dyn PathWatch>) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Serve one request.
    pub async fn fetch(&self, request: &CacheRequest) -> CacheOutcome {
        let identity = match identify(&request.url) {
            Ok(identity) => identity,
            Err(e) => return CacheOutcome::Failed(FetchError::Identity(e)),
        };
        let key = identity.key;

        if let (Some(watch), Some(object)) = (&self.watch, &identity.storage) {
            watch.watch(object);
        }

        // Partial content comes straight from disk.
        if request.range.is_some() && self.store.is_cached(&key) {
            return self.serve_or_fail(key, request, CacheOutcome::Cached);
        }

        loop {
            if self.is_fresh(&key) {
                log_fetch_debug!(key = %key, "Serving fresh entry");
                return self.serve_or_fail(key, request, CacheOutcome::Cached);
            }

            if self.guard.has_no_available_space(&key) {
                let cause = FetchError::AdmissionDenied { key, size: None };
                return self.fallback(key, request, cause);
            }

            match self.guard.claim_or_wait(key) {
                ClaimAttempt::Acquired(claim) => {
                    let result = self.exchange(&key, &request.url).await;
                    let published = match &result {
                        Ok(_) => ClaimOutcome::Completed,
                        Err(cause) => ClaimOutcome::Failed(Arc::new(cause.to_shared())),
                    };
                    let outcome = match result {
                        Ok(Exchange::NotModified) => {
                            self.serve_or_fail(key, request, CacheOutcome::Revalidated)
                        }
                        Ok(Exchange::Stored { size }) => {
                            log_fetch_info!(key = %key, url = %request.url, size, "Fetched and cached");
                            self.serve_or_fail(key, request, CacheOutcome::Fetched)
                        }
                        Err(cause) => self.fallback(key, request, cause),
                    };
                    claim.finish(published);
                    return outcome;
                }
                ClaimAttempt::Busy(waiter) => {
                    log_fetch_debug!(key = %key, "Fetch already in flight, waiting");
                    match waiter.outcome().await {
                        Some(ClaimOutcome::Completed) if self.store.is_cached(&key) => {
                            return self.serve_or_fail(key, request, CacheOutcome::Cached);
                        }
                        Some(ClaimOutcome::Failed(err)) => {
                            if let Some(cause) = err.downcast_ref::<FetchError>() {
                                return self.fallback(key, request, cause.to_shared());
                            }
                        }
                        // Released without a result (eviction, cancellation): start over.
                        _ => {}
                    }
                }
            }
        }
    }

    fn is_fresh(&self, key: &CacheKey) -> bool {
        if !self.store.is_cached(key) {
            return false;
        }
        match self.store.meta().validator(key) {
            Ok(Some(record)) => record.is_fresh(unix_now(), self.settings.staleness.as_secs()),
            Ok(None) => false,
            Err(e) => {
                log_fetch_warn!(key = %key, error = %e, "Failed to read validator record");
                false
            }
        }
    }

    async fn exchange(&self, key: &CacheKey, url: &str) -> Result<Exchange, FetchError> {
        let mut conditional = true;
        loop {
            let validators = if conditional && self.store.is_cached(key) {
                self.store
                    .meta()
                    .validator(key)?
                    .map(|r| r.validators)
                    .filter(|v| !v.is_empty())
            } else {
                None
            };

            let timeout = self.settings.request_timeout;
            let response = tokio::time::timeout(timeout, self.origin.get(url, validators.as_ref()))
                .await
                .map_err(|_| OriginError::Timeout(timeout))??;
            match response.status {
                304 if validators.is_some() => {
                    if !self.store.is_cached(key) {
                        if !conditional {
                            return Err(FetchError::OriginStatus(304));
                        }
                        // Evicted while we were asking; fetch the body instead.
                        log_fetch_debug!(key = %key, "Cached copy vanished during revalidation, refetching");
                        conditional = false;
                        continue;
                    }
                    self.store.meta().touch_validator(key, unix_now())?;
                    return Ok(Exchange::NotModified);
                }
                _ if response.is_success() => {
                    let size = self.download(key, url, response).await?;
                    return Ok(Exchange::Stored { size });
                }
                404 => return Err(FetchError::NotFound),
                status => return Err(FetchError::OriginStatus(status)),
            }
        }
    }

    async fn download(
        &self,
        key: &CacheKey,
        url: &str,
        response: OriginResponse,
    ) -> Result<u64, FetchError> {
        let declared = response.content_length;
        let threshold = self.settings.threshold_bytes;

        let Some(mut reservation) = self.admission.reserve(threshold, declared)? else {
            self.guard.mark_no_space(*key);
            log_fetch_warn!(key = %key, url = %url, declared_size = ?declared, "Insufficient disk space, not caching");
            return Err(FetchError::AdmissionDenied {
                key: *key,
                size: declared,
            });
        };

        let validators = response.validators();
        if let Err(e) = self
            .write_staging(key, response, &mut reservation, declared.is_none())
            .await
        {
            if let Err(cleanup) = self.store.discard_staging(key) {
                log_fetch_warn!(key = %key, error = %cleanup, "Failed to remove partial download");
            }
            if let FetchError::AdmissionDenied { .. } = e {
                self.guard.mark_no_space(*key);
                log_fetch_warn!(key = %key, url = %url, written = reservation.bytes(), "Disk headroom exhausted mid-download");
            }
            return Err(e);
        }

        let size = self.store.commit(key)?;
        self.store.meta().save_validators(key, validators, unix_now())?;
        self.guard.clear_no_space(key);
        drop(reservation);
        Ok(size)
    }

    async fn write_staging(
        &self,
        key: &CacheKey,
        response: OriginResponse,
        reservation: &mut Reservation,
        grow: bool,
    ) -> Result<u64, FetchError> {
        let mut body = response.body;
        let mut file = tokio::fs::File::create(self.store.path_in_staging(key)).await?;
        let mut written = 0u64;
        let mut unaccounted = 0u64;
        let idle = self.settings.request_timeout;

        loop {
            let chunk = match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(OriginError::Timeout(idle).into()),
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if grow {
                unaccounted += chunk.len() as u64;
                if unaccounted >= GROWTH_STEP {
                    if !reservation.grow(self.settings.threshold_bytes, unaccounted)? {
                        return Err(FetchError::AdmissionDenied {
                            key: *key,
                            size: None,
                        });
                    }
                    unaccounted = 0;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    fn fallback(&self, key: CacheKey, request: &CacheRequest, cause: FetchError) -> CacheOutcome {
        if !self.store.is_cached(&key) {
            log_fetch_warn!(key = %key, url = %request.url, error = %cause, "Request failed with no cached copy");
            return CacheOutcome::Failed(cause);
        }
        match self.serve(key, request) {
            Ok(served) => {
                log_fetch_warn!(key = %key, url = %request.url, error = %cause, "Origin failed, serving cached copy");
                CacheOutcome::Fallback { served, cause }
            }
            Err(e) => {
                log_fetch_debug!(key = %key, error = %e, "Fallback copy unusable");
                CacheOutcome::Failed(cause)
            }
        }
    }

    fn serve_or_fail(
        &self,
        key: CacheKey,
        request: &CacheRequest,
        wrap: fn(Served) -> CacheOutcome,
    ) -> CacheOutcome {
        match self.serve(key, request) {
            Ok(served) => wrap(served),
            Err(e) => CacheOutcome::Failed(e),
        }
    }

    fn serve(&self, key: CacheKey, request: &CacheRequest) -> Result<Served, FetchError> {
        let size = self
            .store
            .cached_size(&key)
            .ok_or(FetchError::NotFound)?;

        let range = match &request.range {
            Some(header) => {
                parse_range(header, size).map_err(|_| FetchError::InvalidRange { size })?
            }
            None => None,
        };

        if self.settings.stamp_access_time {
            if let Err(e) = self.store.touch(&key) {
                log_fetch_debug!(key = %key, error = %e, "Failed to stamp access time");
            }
        }

        Ok(Served {
            key,
            path: self.store.path_in_cache(&key),
            size,
            range,
        })
    }
}

