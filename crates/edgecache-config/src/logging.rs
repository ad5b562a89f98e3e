//! Structured logging utilities for edgecache components.
//!
//! Every component logs through these macros so log lines carry a
//! `component` field that can be filtered on.
//!
//! # Usage
//!
//! ```ignore
//! use edgecache_config::log_fetch_warn;
//!
//! log_fetch_warn!(key = %key, status = 503, "Origin failed, serving cached copy");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DAEMON: &'static str = "DAEMON";
    pub const STORE: &'static str = "STORE";
    pub const FETCH: &'static str = "FETCH";
    pub const EVICT: &'static str = "EVICT";
    pub const PUSH: &'static str = "PUSH";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($($arg:tt)+) => { tracing::error!(component = "DAEMON", $($arg)+) };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($($arg:tt)+) => { tracing::warn!(component = "DAEMON", $($arg)+) };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($($arg:tt)+) => { tracing::info!(component = "DAEMON", $($arg)+) };
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_warn {
    ($($arg:tt)+) => { tracing::warn!(component = "STORE", $($arg)+) };
}

#[macro_export]
macro_rules! log_store_info {
    ($($arg:tt)+) => { tracing::info!(component = "STORE", $($arg)+) };
}

#[macro_export]
macro_rules! log_store_debug {
    ($($arg:tt)+) => { tracing::debug!(component = "STORE", $($arg)+) };
}

// === FETCH logging macros ===

#[macro_export]
macro_rules! log_fetch_error {
    ($($arg:tt)+) => { tracing::error!(component = "FETCH", $($arg)+) };
}

#[macro_export]
macro_rules! log_fetch_warn {
    ($($arg:tt)+) => { tracing::warn!(component = "FETCH", $($arg)+) };
}

#[macro_export]
macro_rules! log_fetch_info {
    ($($arg:tt)+) => { tracing::info!(component = "FETCH", $($arg)+) };
}

#[macro_export]
macro_rules! log_fetch_debug {
    ($($arg:tt)+) => { tracing::debug!(component = "FETCH", $($arg)+) };
}

// === EVICT logging macros ===

#[macro_export]
macro_rules! log_evict_error {
    ($($arg:tt)+) => { tracing::error!(component = "EVICT", $($arg)+) };
}

#[macro_export]
macro_rules! log_evict_warn {
    ($($arg:tt)+) => { tracing::warn!(component = "EVICT", $($arg)+) };
}

#[macro_export]
macro_rules! log_evict_info {
    ($($arg:tt)+) => { tracing::info!(component = "EVICT", $($arg)+) };
}

#[macro_export]
macro_rules! log_evict_debug {
    ($($arg:tt)+) => { tracing::debug!(component = "EVICT", $($arg)+) };
}

// === PUSH logging macros ===

#[macro_export]
macro_rules! log_push_warn {
    ($($arg:tt)+) => { tracing::warn!(component = "PUSH", $($arg)+) };
}

#[macro_export]
macro_rules! log_push_info {
    ($($arg:tt)+) => { tracing::info!(component = "PUSH", $($arg)+) };
}

#[macro_export]
macro_rules! log_push_debug {
    ($($arg:tt)+) => { tracing::debug!(component = "PUSH", $($arg)+) };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::DAEMON, "DAEMON");
        assert_eq!(Component::FETCH, "FETCH");
        assert_eq!(Component::PUSH, "PUSH");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_macros_expand() {
        crate::log_fetch_debug!(key = "abc", "macro smoke test");
        crate::log_evict_info!(processed = 3u64, "macro smoke test");
    }
}
