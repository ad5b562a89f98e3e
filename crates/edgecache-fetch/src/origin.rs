//! Origin access.
//!
//! The controller talks to the origin only through [`Origin`], so tests can
//! script responses without a network.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use thiserror::Error;

use edgecache_store::HttpValidators;

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Response body failed: {0}")]
    Body(String),
}

pub type BodyStream = BoxStream<'static, Result<Bytes, OriginError>>;

/// Status line, validators and streaming body of one origin response.
pub struct OriginResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl OriginResponse {
    pub fn validators(&self) -> HttpValidators {
        HttpValidators::new(self.etag.clone(), self.last_modified.clone())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// Issue a GET, conditional when `validators` are given.
    async fn get(
        &self,
        url: &str,
        validators: Option<&HttpValidators>,
    ) -> Result<OriginResponse, OriginError>;
}

/// Transport settings for [`HttpOrigin`].
#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(120),
            user_agent: concat!("edgecache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// reqwest-backed origin, optionally routed through a forward proxy.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(settings: &OriginSettings) -> Result<Self, OriginError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(settings.user_agent.as_str());

        builder = match &settings.proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy.as_str())?),
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn get(
        &self,
        url: &str,
        validators: Option<&HttpValidators>,
    ) -> Result<OriginResponse, OriginError> {
        let mut request = self.client.get(url);
        if let Some(v) = validators {
            // ETag is the stronger validator; only one condition is sent.
            if let Some(etag) = &v.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            } else if let Some(last_modified) = &v.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }

        let response = request.send().await?;
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        Ok(OriginResponse {
            status: response.status().as_u16(),
            etag,
            last_modified,
            content_length: response.content_length(),
            body: response.bytes_stream().map_err(OriginError::from).boxed(),
        })
    }
}
