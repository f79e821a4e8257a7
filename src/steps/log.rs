//! Durable step table.
//!
//! Step rows live in an append-only file. Deletions (rollback to a
//! checkpoint, full reset) are appended as tombstone entries, so the file is
//! never rewritten in place. The in-memory index is rebuilt by replaying the
//! file on open.

use crate::error::{Result, SyncError};
use crate::types::{DocumentId, SessionId, Step, StepId, Version};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the step log.
const LOG_MAGIC: &[u8; 4] = b"STL\0";

/// Current log format version.
pub(crate) const LOG_VERSION: u8 = 1;

/// File header size (magic + version).
const LOG_HEADER_SIZE: u64 = 5;

/// Entry header size: kind + document + session + version + step id + payload length.
const ENTRY_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 8 + 4;

const ENTRY_INSERT: u8 = 0;
const ENTRY_DELETE_AFTER: u8 = 1;
const ENTRY_DELETE_ALL: u8 = 2;

/// Storage backend for step rows.
///
/// Implementations must keep rows for one document ordered by version and
/// must never mutate a stored row.
pub trait StepStore: Send + Sync {
    /// Store one batch row tagged with `version`.
    fn insert(
        &self,
        document: DocumentId,
        session: SessionId,
        version: Version,
        data: &[String],
    ) -> Result<Step>;

    /// Highest stored version, `Version::ZERO` when the document has no rows.
    fn latest_version(&self, document: DocumentId) -> Result<Version>;

    /// Rows with a version greater than `since`, ascending.
    fn find(&self, document: DocumentId, since: Version) -> Result<Vec<Step>>;

    /// Delete rows with a version greater than `version`. Returns the number removed.
    fn delete_after_version(&self, document: DocumentId, version: Version) -> Result<usize>;

    /// Delete every row of a document. Returns the number removed.
    fn delete_all(&self, document: DocumentId) -> Result<usize>;
}

#[derive(Default)]
struct StepIndex {
    rows: HashMap<DocumentId, BTreeMap<Version, Step>>,
    next_id: u64,
}

impl StepIndex {
    fn apply(&mut self, entry: Entry) -> usize {
        match entry {
            Entry::Insert(step) => {
                self.next_id = self.next_id.max(step.id.0 + 1);
                self.rows
                    .entry(step.document_id)
                    .or_default()
                    .insert(step.version, step);
                1
            }
            Entry::DeleteAfter { document, version } => match self.rows.get_mut(&document) {
                Some(rows) => {
                    let removed = rows.split_off(&Version(version.0 + 1));
                    if rows.is_empty() {
                        self.rows.remove(&document);
                    }
                    removed.len()
                }
                None => 0,
            },
            Entry::DeleteAll { document } => {
                self.rows.remove(&document).map_or(0, |rows| rows.len())
            }
        }
    }
}

enum Entry {
    Insert(Step),
    DeleteAfter { document: DocumentId, version: Version },
    DeleteAll { document: DocumentId },
}

/// File-backed append-only step table.
pub struct StepLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: Mutex<File>,

    /// Length of the valid prefix; every append starts here.
    file_size: Mutex<u64>,

    /// Replayed rows.
    index: RwLock<StepIndex>,

    /// Number of writes since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl StepLog {
    /// Open or create a step log that syncs on every write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, 1)
    }

    /// Open or create a step log with custom sync interval.
    /// - sync_interval = 0 or 1: sync every write
    /// - sync_interval = 100: sync every 100 writes
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut index = StepIndex {
            next_id: 1,
            ..Default::default()
        };

        let file_size = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            LOG_HEADER_SIZE
        } else {
            let valid_len = Self::replay(&mut file, &mut index)?;
            let file_len = file.metadata()?.len();
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len,
                    "Discarding torn tail of step log"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            valid_len
        };

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size: Mutex::new(file_size),
            index: RwLock::new(index),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of stored rows across documents.
    pub fn len(&self) -> usize {
        self.index.read().rows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Replay entries into `index`. Returns the length of the valid prefix.
    fn replay(file: &mut File, index: &mut StepIndex) -> Result<u64> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid step log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported step log version: {}",
                version[0]
            )));
        }

        let mut valid_len = LOG_HEADER_SIZE;
        loop {
            match Self::read_entry(file) {
                Ok(Some(entry)) => {
                    index.apply(entry);
                    valid_len = file.stream_position()?;
                }
                Ok(None) => break,
                Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SyncError::ChecksumMismatch { .. }) | Err(SyncError::Deserialization(_)) => {
                    break
                }
                Err(e) => return Err(e),
            }
        }

        Ok(valid_len)
    }

    fn read_entry(file: &mut File) -> Result<Option<Entry>> {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        match file.read(&mut header[..1])? {
            0 => return Ok(None),
            _ => file.read_exact(&mut header[1..])?,
        }

        let kind = header[0];
        let document = DocumentId(read_u64(&header[1..9]));
        let session = SessionId(read_u64(&header[9..17]));
        let version = Version(read_u64(&header[17..25]));
        let step_id = StepId(read_u64(&header[25..33]));
        let payload_len = u32::from_le_bytes([header[33], header[34], header[35], header[36]]);

        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = entry_checksum(&header, &payload);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let entry = match kind {
            ENTRY_INSERT => {
                let data: Vec<String> = serde_json::from_slice(&payload)
                    .map_err(|e| SyncError::Deserialization(e.to_string()))?;
                Entry::Insert(Step {
                    id: step_id,
                    document_id: document,
                    session_id: session,
                    version,
                    data,
                })
            }
            ENTRY_DELETE_AFTER => Entry::DeleteAfter { document, version },
            ENTRY_DELETE_ALL => Entry::DeleteAll { document },
            other => {
                return Err(SyncError::InvalidFormat(format!(
                    "Unknown step log entry kind: {}",
                    other
                )))
            }
        };

        Ok(Some(entry))
    }

    /// Append one entry after the valid prefix.
    ///
    /// A failed write is cut off again, so bytes of a half-written entry never
    /// end up in front of later entries.
    fn write_entry(
        &self,
        kind: u8,
        document: DocumentId,
        session: SessionId,
        version: Version,
        step_id: StepId,
        payload: &[u8],
    ) -> Result<()> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| SyncError::Storage("step batch too large".into()))?;

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        header[0] = kind;
        header[1..9].copy_from_slice(&document.0.to_le_bytes());
        header[9..17].copy_from_slice(&session.0.to_le_bytes());
        header[17..25].copy_from_slice(&version.0.to_le_bytes());
        header[25..33].copy_from_slice(&step_id.0.to_le_bytes());
        header[33..37].copy_from_slice(&payload_len.to_le_bytes());

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len() + 4);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&entry_checksum(&header, payload).to_le_bytes());

        let mut file = self.file.lock();
        let mut file_size = self.file_size.lock();
        file.seek(SeekFrom::Start(*file_size))?;
        if let Err(e) = file.write_all(&buf) {
            if let Err(truncate) = file.set_len(*file_size) {
                warn!(
                    path = %self.path.display(),
                    valid_len = *file_size,
                    error = %truncate,
                    "Could not cut off failed step log write"
                );
            }
            return Err(e.into());
        }
        *file_size += buf.len() as u64;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_data()?;
            *writes = 0;
        }

        Ok(())
    }
}

impl StepStore for StepLog {
    fn insert(
        &self,
        document: DocumentId,
        session: SessionId,
        version: Version,
        data: &[String],
    ) -> Result<Step> {
        let payload = serde_json::to_vec(data)?;

        // The write lock spans the file append so ids stay in file order.
        let mut index = self.index.write();
        if index
            .rows
            .get(&document)
            .is_some_and(|rows| rows.contains_key(&version))
        {
            return Err(SyncError::Storage(format!(
                "step version {} already stored for document {}",
                version, document
            )));
        }

        let id = StepId(index.next_id);
        self.write_entry(ENTRY_INSERT, document, session, version, id, &payload)?;

        let step = Step {
            id,
            document_id: document,
            session_id: session,
            version,
            data: data.to_vec(),
        };
        index.apply(Entry::Insert(step.clone()));
        Ok(step)
    }

    fn latest_version(&self, document: DocumentId) -> Result<Version> {
        Ok(self
            .index
            .read()
            .rows
            .get(&document)
            .and_then(|rows| rows.keys().next_back().copied())
            .unwrap_or(Version::ZERO))
    }

    fn find(&self, document: DocumentId, since: Version) -> Result<Vec<Step>> {
        let index = self.index.read();
        Ok(index
            .rows
            .get(&document)
            .map(|rows| {
                rows.range(Version(since.0 + 1)..)
                    .map(|(_, step)| step.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_after_version(&self, document: DocumentId, version: Version) -> Result<usize> {
        let mut index = self.index.write();
        self.write_entry(
            ENTRY_DELETE_AFTER,
            document,
            SessionId(0),
            version,
            StepId(0),
            &[],
        )?;
        Ok(index.apply(Entry::DeleteAfter { document, version }))
    }

    fn delete_all(&self, document: DocumentId) -> Result<usize> {
        let mut index = self.index.write();
        self.write_entry(
            ENTRY_DELETE_ALL,
            document,
            SessionId(0),
            Version::ZERO,
            StepId(0),
            &[],
        )?;
        Ok(index.apply(Entry::DeleteAll { document }))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn entry_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_and_find() {
        let dir = TempDir::new().unwrap();
        let log = StepLog::open(dir.path().join("steps.log")).unwrap();
        let doc = DocumentId(1);

        log.insert(doc, SessionId(1), Version(2), &data(&["a", "b"])).unwrap();
        log.insert(doc, SessionId(2), Version(3), &data(&["c"])).unwrap();

        assert_eq!(log.latest_version(doc).unwrap(), Version(3));
        let all = log.find(doc, Version::ZERO).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data, data(&["a", "b"]));
        assert_eq!(all[1].session_id, SessionId(2));

        let tail = log.find(doc, Version(2)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].version, Version(3));
    }

    #[test]
    fn test_documents_are_independent() {
        let dir = TempDir::new().unwrap();
        let log = StepLog::open(dir.path().join("steps.log")).unwrap();

        log.insert(DocumentId(1), SessionId(1), Version(1), &data(&["a"])).unwrap();
        log.insert(DocumentId(2), SessionId(1), Version(5), &data(&["b"])).unwrap();

        assert_eq!(log.latest_version(DocumentId(1)).unwrap(), Version(1));
        assert_eq!(log.latest_version(DocumentId(2)).unwrap(), Version(5));
        assert_eq!(log.latest_version(DocumentId(3)).unwrap(), Version::ZERO);
        assert!(log.find(DocumentId(3), Version::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let dir = TempDir::new().unwrap();
        let log = StepLog::open(dir.path().join("steps.log")).unwrap();

        log.insert(DocumentId(1), SessionId(1), Version(1), &data(&["a"])).unwrap();
        let result = log.insert(DocumentId(1), SessionId(2), Version(1), &data(&["b"]));
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_delete_after_and_all() {
        let dir = TempDir::new().unwrap();
        let log = StepLog::open(dir.path().join("steps.log")).unwrap();
        let doc = DocumentId(1);

        for v in 1..=5 {
            log.insert(doc, SessionId(1), Version(v), &data(&["x"])).unwrap();
        }

        assert_eq!(log.delete_after_version(doc, Version(3)).unwrap(), 2);
        assert_eq!(log.latest_version(doc).unwrap(), Version(3));
        assert_eq!(log.delete_after_version(doc, Version(3)).unwrap(), 0);

        assert_eq!(log.delete_all(doc).unwrap(), 3);
        assert_eq!(log.latest_version(doc).unwrap(), Version::ZERO);
        assert_eq!(log.delete_all(doc).unwrap(), 0);
    }

    #[test]
    fn test_persistence_replays_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steps.log");

        {
            let log = StepLog::open(&path).unwrap();
            for v in 1..=4 {
                log.insert(DocumentId(1), SessionId(1), Version(v), &data(&["x"])).unwrap();
            }
            log.insert(DocumentId(2), SessionId(1), Version(1), &data(&["y"])).unwrap();
            log.delete_after_version(DocumentId(1), Version(2)).unwrap();
            log.delete_all(DocumentId(2)).unwrap();
        }

        {
            let log = StepLog::open(&path).unwrap();
            assert_eq!(log.latest_version(DocumentId(1)).unwrap(), Version(2));
            assert_eq!(log.latest_version(DocumentId(2)).unwrap(), Version::ZERO);

            // Ids continue after the highest stored id
            let step = log.insert(DocumentId(1), SessionId(1), Version(3), &data(&["z"])).unwrap();
            assert_eq!(step.id, StepId(6));
        }
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steps.log");

        {
            let log = StepLog::open(&path).unwrap();
            log.insert(DocumentId(1), SessionId(1), Version(1), &data(&["a"])).unwrap();
            log.insert(DocumentId(1), SessionId(1), Version(2), &data(&["b"])).unwrap();
        }

        // Chop the last entry in half
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 6).unwrap();
        drop(file);

        let log = StepLog::open(&path).unwrap();
        assert_eq!(log.latest_version(DocumentId(1)).unwrap(), Version(1));

        // Appending after recovery produces a readable log
        log.insert(DocumentId(1), SessionId(1), Version(2), &data(&["c"])).unwrap();
        drop(log);
        let log = StepLog::open(&path).unwrap();
        let steps = log.find(DocumentId(1), Version::ZERO).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].data, data(&["c"]));
    }

    #[test]
    fn test_torn_write_does_not_hide_later_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steps.log");
        let doc = DocumentId(1);

        {
            let log = StepLog::open(&path).unwrap();
            log.insert(doc, SessionId(1), Version(1), &data(&["a"])).unwrap();

            // Half an entry left behind by a failed append
            log.file.lock().write_all(&[ENTRY_INSERT, 1, 0, 0]).unwrap();

            log.delete_after_version(doc, Version(1)).unwrap();
            log.insert(doc, SessionId(1), Version(2), &data(&["b"])).unwrap();
            log.insert(doc, SessionId(1), Version(3), &data(&["c"])).unwrap();
            assert_eq!(log.latest_version(doc).unwrap(), Version(3));
        }

        let log = StepLog::open(&path).unwrap();
        assert_eq!(log.latest_version(doc).unwrap(), Version(3));
        let steps = log.find(doc, Version::ZERO).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2].data, data(&["c"]));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("steps.log");
        std::fs::write(&path, b"nope, not a log").unwrap();

        assert!(matches!(StepLog::open(&path), Err(SyncError::InvalidFormat(_))));
    }
}
