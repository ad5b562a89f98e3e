//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated cache, staging and meta directories
//! - A `Config` pointing at them
//!
//! # Usage
//!
//! ```ignore
//! use edgecache_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.cache_dir, env.staging_dir, env.meta_dir are all isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the isolated tree
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub meta_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let cache_dir = root.join("cache");
        let staging_dir = root.join("staging");
        let meta_dir = root.join("meta");

        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&staging_dir)?;
        std::fs::create_dir_all(&meta_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            cache_dir,
            staging_dir,
            meta_dir,
            test_id,
        })
    }

    /// A default config rewired to this environment's directories
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.cache.cache_dir = self.cache_dir.clone();
        cfg.cache.staging_dir = self.staging_dir.clone();
        cfg.cache.meta_dir = self.meta_dir.clone();
        cfg.push.display_id = Some(format!("test-display-{}", self.test_id));
        cfg.push.machine_id = Some(format!("test-machine-{}", self.test_id));
        cfg
    }

    /// Write a file straight into the cache directory
    pub fn create_cache_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.cache_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write a file straight into the staging directory
    pub fn create_staging_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.staging_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
