//! Editor-state snapshots.
//!
//! A snapshot is the compacted editor state a client uploads on save, so new
//! clients can start from it instead of replaying the full step log. It is
//! never authoritative. Each document has at most one snapshot file.

use crate::error::{Result, SyncError};
use crate::types::DocumentId;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for snapshot files.
const STATE_MAGIC: &[u8; 4] = b"YST\0";

/// Current snapshot format version.
pub(crate) const STATE_VERSION: u8 = 1;

/// Snapshot files, one per document, with an LRU read cache.
pub struct StateSnapshots {
    /// Directory holding `<id>.yjs` files. Created on first write.
    path: PathBuf,

    /// Recently read or written snapshots.
    cache: Mutex<LruCache<DocumentId, Vec<u8>>>,
}

impl StateSnapshots {
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Make sure the snapshot directory exists.
    pub fn ensure_folder(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Create or replace the snapshot of a document.
    pub fn write(&self, document: DocumentId, state: &[u8]) -> Result<()> {
        self.ensure_folder()?;

        let final_path = self.file_path(document);
        let tmp_path = final_path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;

        file.write_all(STATE_MAGIC)?;
        file.write_all(&[STATE_VERSION])?;
        file.write_all(&(state.len() as u64).to_le_bytes())?;
        file.write_all(state)?;
        file.write_all(&crc32fast::hash(state).to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        self.cache.lock().put(document, state.to_vec());
        Ok(())
    }

    /// Read the snapshot of a document. `NotFound` when there is none.
    pub fn read(&self, document: DocumentId) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.lock().get(&document).cloned() {
            return Ok(cached);
        }

        let mut file = match File::open(self.file_path(document)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SyncError::NotFound(format!("state file of document {}", document)))
            }
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STATE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid state file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STATE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported state file version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut state = vec![0u8; len];
        file.read_exact(&mut state)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&state);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        self.cache.lock().put(document, state.clone());
        Ok(state)
    }

    pub fn exists(&self, document: DocumentId) -> bool {
        self.cache.lock().contains(&document) || self.file_path(document).exists()
    }

    /// Delete the snapshot of a document. Returns whether one existed.
    pub fn delete(&self, document: DocumentId) -> Result<bool> {
        self.cache.lock().pop(&document);
        match fs::remove_file(self.file_path(document)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn file_path(&self, document: DocumentId) -> PathBuf {
        self.path.join(format!("{}.yjs", document))
    }
}
