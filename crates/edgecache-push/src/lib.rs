//! # edgecache-push
//!
//! Learns about remote changes over a long-lived websocket instead of
//! polling:
//!
//! - [`messages`]: the `msg`-tagged JSON protocol
//! - [`channel`]: reconnecting connection with backoff and an explicit
//!   `Disconnected → Connecting → Connected` state machine
//! - [`listener`]: path registrations, targeted invalidation and resyncs

pub mod channel;
pub mod listener;
pub mod messages;

use thiserror::Error;

pub use channel::{ChannelHandler, ChannelState, Outbox, PushChannel, PushSettings, ReconnectPolicy};
pub use listener::{ConnectionStatus, InvalidationListener, RegisteredPath};
pub use messages::{ChangeKind, PushMessage, StorageUpdate};

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Invalid push URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] edgecache_store::StoreError),

    #[error("Push channel is not configured: {0}")]
    NotConfigured(&'static str),
}

pub type Result<T> = std::result::Result<T, PushError>;
