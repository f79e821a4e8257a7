//! Persisted store tying the durable tables together.

use crate::config::SyncConfig;
use crate::documents::{DocumentTable, SessionTable, StateSnapshots, STATE_VERSION, TABLE_VERSION};
use crate::error::{Result, SyncError};
use crate::steps::{StepLog, LOG_VERSION};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Magic bytes in front of the manifest body.
const STORE_MAGIC: &[u8; 4] = b"SSY\0";

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const STEP_LOG_FILE: &str = "steps.log";
const DOCUMENT_TABLE_FILE: &str = "documents.bin";
const SESSION_TABLE_FILE: &str = "sessions.bin";
const STATE_DIR: &str = "documents";

/// Format versions of the files in a data directory.
///
/// Written once when the store is created. Opening a directory written with
/// any other combination fails instead of misreading its files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    step_log: u8,
    tables: u8,
    state_snapshots: u8,
}

impl Manifest {
    fn current() -> Self {
        Self {
            step_log: LOG_VERSION,
            tables: TABLE_VERSION,
            state_snapshots: STATE_VERSION,
        }
    }

    fn write(dir: &Path) -> Result<()> {
        let body = serde_json::to_vec(&Self::current())?;
        let tmp_path = dir.join("MANIFEST.tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp_path, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn check(dir: &Path) -> Result<()> {
        let bytes = fs::read(dir.join(MANIFEST_FILE))?;
        let body = bytes
            .strip_prefix(STORE_MAGIC.as_slice())
            .ok_or_else(|| SyncError::InvalidFormat("Invalid store magic".into()))?;
        let found: Manifest = serde_json::from_slice(body)
            .map_err(|e| SyncError::InvalidFormat(format!("Unreadable manifest: {}", e)))?;

        let expected = Self::current();
        if found != expected {
            return Err(SyncError::InvalidFormat(format!(
                "Store written with {:?}, this build reads {:?}",
                found, expected
            )));
        }
        Ok(())
    }
}

/// Row counts of a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub document_count: u64,
    pub session_count: u64,
    pub step_count: u64,
}

/// The on-disk data directory.
///
/// Layout:
/// - `MANIFEST` format versions of the files below
/// - `LOCK` held exclusively while the store is open
/// - `steps.log` append-only step table
/// - `documents.bin`, `sessions.bin` document and session tables
/// - `documents/` editor-state snapshots
pub struct Store {
    /// Lock file for exclusive access.
    _lock_file: File,

    pub(crate) steps: Arc<StepLog>,
    pub(crate) documents: Arc<DocumentTable>,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) states: Arc<StateSnapshots>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: &SyncConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: &SyncConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = lock_directory(&config.path)?;
        Manifest::write(&config.path)?;
        Self::load(config, lock_file)
    }

    /// Open an existing store.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        let lock_file = lock_directory(&config.path)?;
        Manifest::check(&config.path)?;
        Self::load(config, lock_file)
    }

    fn load(config: &SyncConfig, lock_file: File) -> Result<Self> {
        let path = &config.path;
        let steps =
            StepLog::open_with_sync_interval(path.join(STEP_LOG_FILE), config.sync_interval)?;
        let documents = DocumentTable::open(path.join(DOCUMENT_TABLE_FILE))?;
        let sessions = SessionTable::open(path.join(SESSION_TABLE_FILE))?;
        let states = StateSnapshots::new(path.join(STATE_DIR), config.state_cache_size);

        Ok(Self {
            _lock_file: lock_file,
            steps: Arc::new(steps),
            documents: Arc::new(documents),
            sessions: Arc::new(sessions),
            states: Arc::new(states),
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            document_count: self.documents.find_all().len() as u64,
            session_count: self.sessions.len() as u64,
            step_count: self.steps.len() as u64,
        }
    }

    /// Sync the step log to disk. The tables are written on every mutation.
    pub fn sync(&self) -> Result<()> {
        self.steps.sync()
    }
}

/// Take the directory's process lock, held until the returned file is dropped.
fn lock_directory(dir: &Path) -> Result<File> {
    let file = File::create(dir.join(LOCK_FILE))?;
    file.try_lock_exclusive()
        .map_err(|_| SyncError::StoreLocked)?;
    Ok(file)
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(error = %e, "Failed to sync step log on close");
        }
    }
}
