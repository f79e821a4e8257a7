//! Backing artifacts (the files being edited).
//!
//! An artifact has an identity, byte content, a modification time and a
//! content fingerprint. The engine only reads these and writes content back
//! on save; where artifacts live is up to the [`ArtifactStore`].

use crate::error::{Result, SyncError};
use crate::types::{DocumentId, Etag, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A byte-addressable file under collaborative editing.
pub trait Artifact: Send + Sync {
    fn id(&self) -> DocumentId;

    fn content(&self) -> Result<Vec<u8>>;

    fn put_content(&self, content: &[u8]) -> Result<()>;

    fn mtime(&self) -> Result<Timestamp>;

    fn etag(&self) -> Result<Etag>;

    fn size(&self) -> Result<u64>;

    /// Whether the current user may update the artifact.
    fn is_writable(&self) -> bool;
}

/// Resolves artifacts by identity.
pub trait ArtifactStore: Send + Sync {
    /// Fails with `NotFound` when no artifact has this id.
    fn get(&self, id: DocumentId) -> Result<Arc<dyn Artifact>>;
}

/// Artifact backed by a file on the local filesystem.
pub struct FsArtifact {
    id: DocumentId,
    path: PathBuf,
}

impl FsArtifact {
    pub fn new(id: DocumentId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Artifact for FsArtifact {
    fn id(&self) -> DocumentId {
        self.id
    }

    fn content(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    fn put_content(&self, content: &[u8]) -> Result<()> {
        fs::write(&self.path, content)?;
        Ok(())
    }

    fn mtime(&self) -> Result<Timestamp> {
        Ok(Timestamp::from_system_time(fs::metadata(&self.path)?.modified()?))
    }

    fn etag(&self) -> Result<Etag> {
        Ok(Etag::of(&self.content()?))
    }

    fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn is_writable(&self) -> bool {
        fs::metadata(&self.path)
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false)
    }
}

/// Registry of filesystem artifacts by id.
#[derive(Default)]
pub struct FsArtifactStore {
    files: RwLock<HashMap<DocumentId, PathBuf>>,
}

impl FsArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: DocumentId, path: impl Into<PathBuf>) {
        self.files.write().insert(id, path.into());
    }

    pub fn unregister(&self, id: DocumentId) {
        self.files.write().remove(&id);
    }
}

impl ArtifactStore for FsArtifactStore {
    fn get(&self, id: DocumentId) -> Result<Arc<dyn Artifact>> {
        let path = self
            .files
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("artifact {}", id)))?;
        if !path.is_file() {
            return Err(SyncError::NotFound(format!("artifact {} at {}", id, path.display())));
        }
        Ok(Arc::new(FsArtifact::new(id, path)))
    }
}

struct MemoryState {
    content: Vec<u8>,
    mtime: Timestamp,
    writable: bool,
}

/// Artifact held in memory.
///
/// Writes through [`Artifact::put_content`] stamp the current time, like a
/// filesystem would. [`MemoryArtifact::replace_externally`] simulates an edit
/// made outside the engine.
pub struct MemoryArtifact {
    id: DocumentId,
    state: RwLock<MemoryState>,
    writes: AtomicU64,
}

impl MemoryArtifact {
    pub fn new(id: DocumentId, content: impl Into<Vec<u8>>, mtime: Timestamp) -> Self {
        Self {
            id,
            state: RwLock::new(MemoryState {
                content: content.into(),
                mtime,
                writable: true,
            }),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of writes made through [`Artifact::put_content`].
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn set_writable(&self, writable: bool) {
        self.state.write().writable = writable;
    }

    pub fn set_mtime(&self, mtime: Timestamp) {
        self.state.write().mtime = mtime;
    }

    /// Replace content and modification time without going through the engine.
    pub fn replace_externally(&self, content: impl Into<Vec<u8>>, mtime: Timestamp) {
        let mut state = self.state.write();
        state.content = content.into();
        state.mtime = mtime;
    }
}

impl Artifact for MemoryArtifact {
    fn id(&self) -> DocumentId {
        self.id
    }

    fn content(&self) -> Result<Vec<u8>> {
        Ok(self.state.read().content.clone())
    }

    fn put_content(&self, content: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if !state.writable {
            return Err(SyncError::Storage(format!("artifact {} is not writable", self.id)));
        }
        state.content = content.to_vec();
        state.mtime = Timestamp::now();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn mtime(&self) -> Result<Timestamp> {
        Ok(self.state.read().mtime)
    }

    fn etag(&self) -> Result<Etag> {
        Ok(Etag::of(&self.state.read().content))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.state.read().content.len() as u64)
    }

    fn is_writable(&self) -> bool {
        self.state.read().writable
    }
}

/// In-memory artifact registry.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<DocumentId, Arc<MemoryArtifact>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an artifact.
    pub fn create(
        &self,
        id: DocumentId,
        content: impl Into<Vec<u8>>,
        mtime: Timestamp,
    ) -> Arc<MemoryArtifact> {
        let artifact = Arc::new(MemoryArtifact::new(id, content, mtime));
        self.artifacts.write().insert(id, Arc::clone(&artifact));
        artifact
    }

    pub fn remove(&self, id: DocumentId) -> Option<Arc<MemoryArtifact>> {
        self.artifacts.write().remove(&id)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, id: DocumentId) -> Result<Arc<dyn Artifact>> {
        let artifact = self
            .artifacts
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("artifact {}", id)))?;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_artifact_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        fs::write(&path, b"# Notes").unwrap();

        let store = FsArtifactStore::new();
        store.register(DocumentId(1), &path);

        let artifact = store.get(DocumentId(1)).unwrap();
        assert_eq!(artifact.content().unwrap(), b"# Notes");
        assert_eq!(artifact.etag().unwrap(), Etag::of(b"# Notes"));
        assert!(artifact.mtime().unwrap().is_set());
        assert!(artifact.is_writable());

        artifact.put_content(b"# Changed").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"# Changed");
        assert_eq!(artifact.size().unwrap(), 9);
    }

    #[test]
    fn test_fs_store_missing() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new();
        assert!(matches!(store.get(DocumentId(1)), Err(SyncError::NotFound(_))));

        store.register(DocumentId(1), dir.path().join("gone.md"));
        assert!(matches!(store.get(DocumentId(1)), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_memory_artifact() {
        let store = MemoryArtifactStore::new();
        let artifact = store.create(DocumentId(4), "hello", Timestamp(100));

        let resolved = store.get(DocumentId(4)).unwrap();
        assert_eq!(resolved.mtime().unwrap(), Timestamp(100));

        artifact.replace_externally("outside", Timestamp(200));
        assert_eq!(resolved.content().unwrap(), b"outside");
        assert_eq!(resolved.etag().unwrap(), Etag::of(b"outside"));

        artifact.set_writable(false);
        assert!(!resolved.is_writable());
        assert!(resolved.put_content(b"x").is_err());
    }
}
