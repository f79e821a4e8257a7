//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Owner tag used for app-scoped artifact locks.
pub const APP_NAME: &str = "text";

/// Configuration for a [`crate::DocumentService`] and its store.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Base path for the persisted tables.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Minimum time between two autosaves of an unchanged artifact.
    pub autosave_minimum_delay: Duration,

    /// Expiry of the advisory save lock.
    pub save_lock_ttl: Duration,

    /// Expiry of the cached latest version (`None` keeps it until evicted).
    pub version_cache_ttl: Option<Duration>,

    /// Capacity of the in-process cache (entries).
    pub cache_capacity: usize,

    /// Editor-state snapshot cache size (number of snapshots).
    pub state_cache_size: usize,

    /// Sync the step log every N writes.
    pub sync_interval: u64,

    /// Owner tag for app-scoped locks.
    pub app_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stepsync"),
            create_if_missing: true,
            autosave_minimum_delay: Duration::from_secs(10),
            save_lock_ttl: Duration::from_secs(10),
            version_cache_ttl: None,
            cache_capacity: 10_000,
            state_cache_size: 100,
            sync_interval: 1,
            app_name: APP_NAME.to_string(),
        }
    }
}

impl SyncConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
