//! # edgecache-fetch
//!
//! Request-side half of the caching proxy:
//!
//! - [`origin`]: the [`Origin`] seam and its reqwest implementation
//! - [`controller`]: staleness check, conditional fetch, admission,
//!   streaming to staging and commit, with fallback to the cached copy
//! - [`range`]: `Range` header parsing for partial responses
//! - [`eviction`]: the periodic retention sweep

pub mod controller;
pub mod eviction;
pub mod origin;
pub mod range;

use thiserror::Error;

use edgecache_store::{CacheKey, IdentityError, StoreError};

pub use controller::{CacheController, CacheOutcome, CacheRequest, FetchSettings, PathWatch, Served};
pub use eviction::{EvictionError, EvictionJob, EvictionSettings, SweepReport};
pub use origin::{HttpOrigin, Origin, OriginError, OriginResponse, OriginSettings};
pub use range::{parse_range, ByteRange};

/// Why a request could not be served from a fresh fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid resource URL: {0}")]
    Identity(#[from] IdentityError),

    #[error("Insufficient disk space for {key} (declared size {size:?})")]
    AdmissionDenied { key: CacheKey, size: Option<u64> },

    #[error("Origin unreachable: {0}")]
    OriginUnreachable(#[source] OriginError),

    #[error("Origin returned status {0}")]
    OriginStatus(u16),

    #[error("Resource not found at origin")]
    NotFound,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Requested range not satisfiable (size {size})")]
    InvalidRange { size: u64 },
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Storage(StoreError::Io(e))
    }
}

impl From<OriginError> for FetchError {
    fn from(e: OriginError) -> Self {
        FetchError::OriginUnreachable(e)
    }
}

impl FetchError {
    /// An equivalent error for callers that waited on this fetch.
    ///
    /// Transport and I/O errors are not `Clone`; they carry over by kind
    /// and message.
    pub fn to_shared(&self) -> FetchError {
        match self {
            FetchError::Identity(e) => FetchError::Identity(e.clone()),
            FetchError::AdmissionDenied { key, size } => FetchError::AdmissionDenied {
                key: *key,
                size: *size,
            },
            FetchError::OriginUnreachable(e) => FetchError::OriginUnreachable(match e {
                OriginError::Timeout(after) => OriginError::Timeout(*after),
                OriginError::Body(msg) => OriginError::Body(msg.clone()),
                OriginError::Connect(msg) => OriginError::Connect(msg.clone()),
                OriginError::Http(e) => OriginError::Connect(e.to_string()),
            }),
            FetchError::OriginStatus(status) => FetchError::OriginStatus(*status),
            FetchError::NotFound => FetchError::NotFound,
            FetchError::Storage(StoreError::Io(e)) => {
                FetchError::Storage(StoreError::Io(std::io::Error::new(e.kind(), e.to_string())))
            }
            FetchError::Storage(StoreError::NotFound(key)) => {
                FetchError::Storage(StoreError::NotFound(*key))
            }
            FetchError::Storage(StoreError::Identity(e)) => {
                FetchError::Storage(StoreError::Identity(e.clone()))
            }
            FetchError::Storage(e) => FetchError::Storage(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
            FetchError::InvalidRange { size } => FetchError::InvalidRange { size: *size },
        }
    }

    /// HTTP status a route layer would answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::Identity(_) => 400,
            FetchError::AdmissionDenied { .. } => 507,
            FetchError::OriginUnreachable(_) => 502,
            FetchError::OriginStatus(_) => 502,
            FetchError::NotFound => 404,
            FetchError::Storage(_) => 500,
            FetchError::InvalidRange { .. } => 416,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shared_error_keeps_status_class() {
        let key = edgecache_store::resolve("https://example.com/a");
        let cases = [
            FetchError::OriginUnreachable(OriginError::Timeout(Duration::from_millis(150))),
            FetchError::OriginStatus(503),
            FetchError::NotFound,
            FetchError::AdmissionDenied { key, size: Some(9) },
            FetchError::Storage(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "denied",
            ))),
        ];
        for err in &cases {
            let shared = err.to_shared();
            assert_eq!(shared.status_code(), err.status_code());
            assert_eq!(shared.to_string(), err.to_string());
        }
        assert!(matches!(
            cases[0].to_shared(),
            FetchError::OriginUnreachable(OriginError::Timeout(d)) if d == Duration::from_millis(150)
        ));
    }
}
