//! Integration tests for edgecache-config
//!
//! These tests verify config parsing with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join(".edgecache");
    std::fs::create_dir_all(&dir).unwrap();

    let config_content = r#"
[cache]
cache_dir = "/var/lib/edgecache/cache"
staging_dir = "/var/lib/edgecache/staging"
meta_dir = "/var/lib/edgecache/meta"
disk_threshold_bytes = 1048576
staleness_secs = 60

[eviction]
file_retention_secs = 3600

[proxy]
active = "http://proxy.local:3128"

[push]
url = "wss://push.example.com/messaging"
display_id = "ABC123"
"#;
    std::fs::write(dir.join("config.toml"), config_content).unwrap();

    let config = edgecache_config::Config::from_file(&dir.join("config.toml")).unwrap();

    assert_eq!(
        config.cache.cache_dir,
        PathBuf::from("/var/lib/edgecache/cache")
    );
    assert_eq!(config.cache.disk_threshold_bytes, 1048576);
    assert_eq!(config.cache.staleness_secs, 60);
    // Unset fields keep their defaults
    assert_eq!(config.cache.request_timeout_secs, 120);
    assert_eq!(config.eviction.file_retention_secs, 3600);
    assert_eq!(config.eviction.record_retention_secs, 86_400);
    assert_eq!(config.proxy.effective(), Some("http://proxy.local:3128"));
    assert_eq!(config.push.display_id.as_deref(), Some("ABC123"));
}

#[test]
fn test_invalid_toml_is_reported() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[cache\nstaleness_secs = ").unwrap();

    let err = edgecache_config::Config::from_file(&path).unwrap_err();
    assert!(matches!(err, edgecache_config::ConfigError::Toml(_)));
}

#[test]
fn test_missing_file_is_io_error() {
    let temp = tempdir().unwrap();
    let err = edgecache_config::Config::from_file(&temp.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, edgecache_config::ConfigError::Io(_)));
}

#[test]
fn test_default_toml_parses_back() {
    let rendered = edgecache_config::Config::default_toml();
    let parsed: edgecache_config::Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.eviction, edgecache_config::EvictionConfig::default());
}

/// A local file overrides only the keys it names
#[test]
fn test_local_layer_overrides_key_by_key() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    let local = temp.path().join("local.toml");
    std::fs::write(
        &global,
        r#"
[cache]
cache_dir = "/var/lib/edgecache/cache"
disk_threshold_bytes = 1048576

[push]
url = "wss://push.example.com/messaging"
initial_backoff_ms = 2000
"#,
    )
    .unwrap();
    std::fs::write(
        &local,
        r#"
[cache]
staleness_secs = 30

[push]
offline_grace_ms = 0
max_backoff_ms = 60000
jitter_ms = 0
"#,
    )
    .unwrap();

    let config = edgecache_config::Config::from_layers(&[global, local]).unwrap();

    assert_eq!(
        config.cache.cache_dir,
        PathBuf::from("/var/lib/edgecache/cache")
    );
    assert_eq!(config.cache.disk_threshold_bytes, 1048576);
    assert_eq!(config.cache.staleness_secs, 30);
    assert_eq!(
        config.push.url.as_deref(),
        Some("wss://push.example.com/messaging")
    );
    assert_eq!(config.push.initial_backoff_ms, 2000);
    assert_eq!(config.push.offline_grace_ms, 0);
    assert_eq!(config.push.max_backoff_ms, 60_000);
    assert_eq!(config.push.jitter_ms, 0);
    // Untouched everywhere
    assert_eq!(config.eviction.record_retention_secs, 86_400);
}
