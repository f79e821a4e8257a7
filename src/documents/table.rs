//! Document and session tables.
//!
//! Both tables are small and keyed by id, so each is kept in memory and
//! written out as a whole (MessagePack behind a magic/version header) after
//! every mutation. Writes go to a temporary file that is renamed over the
//! table, so a crash never leaves a half-written table behind.

use crate::error::{Result, SyncError};
use crate::session::SessionValidator;
use crate::types::{Document, DocumentId, Session, SessionId, Timestamp};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the document table.
const DOCUMENT_TABLE_MAGIC: &[u8; 4] = b"DOC\0";

/// Magic bytes for the session table.
const SESSION_TABLE_MAGIC: &[u8; 4] = b"SES\0";

/// Current table format version.
pub(crate) const TABLE_VERSION: u8 = 1;

fn save_table<T: Serialize>(path: &Path, magic: &[u8; 4], rows: &T) -> Result<()> {
    let encoded = rmp_serde::to_vec(rows)?;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    file.write_all(magic)?;
    file.write_all(&[TABLE_VERSION])?;
    file.write_all(&(encoded.len() as u64).to_le_bytes())?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load_table<T: DeserializeOwned + Default>(path: &Path, magic: &[u8; 4]) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let mut file = File::open(path)?;

    let mut found = [0u8; 4];
    file.read_exact(&mut found)?;
    if &found != magic {
        return Err(SyncError::InvalidFormat(format!(
            "Invalid table magic in {}",
            path.display()
        )));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != TABLE_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported table version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = vec![0u8; len];
    file.read_exact(&mut encoded)?;

    Ok(rmp_serde::from_slice(&encoded)?)
}

/// One row per artifact under collaborative editing.
pub struct DocumentTable {
    path: PathBuf,
    rows: RwLock<BTreeMap<DocumentId, Document>>,
}

impl DocumentTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rows = load_table(&path, DOCUMENT_TABLE_MAGIC)?;
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    pub fn get(&self, id: DocumentId) -> Option<Document> {
        self.rows.read().get(&id).cloned()
    }

    /// Fails with `NotFound` when there is no row.
    pub fn find(&self, id: DocumentId) -> Result<Document> {
        self.get(id)
            .ok_or_else(|| SyncError::NotFound(format!("document {}", id)))
    }

    pub fn find_all(&self) -> Vec<Document> {
        self.rows.read().values().cloned().collect()
    }

    /// Insert a new row. A row with the same id fails with `UniqueViolation`.
    pub fn insert(&self, document: Document) -> Result<Document> {
        let mut rows = self.rows.write();
        if rows.contains_key(&document.id) {
            return Err(SyncError::UniqueViolation(document.id));
        }
        rows.insert(document.id, document.clone());
        if let Err(e) = save_table(&self.path, DOCUMENT_TABLE_MAGIC, &*rows) {
            rows.remove(&document.id);
            return Err(e);
        }
        Ok(document)
    }

    pub fn update(&self, document: &Document) -> Result<()> {
        let mut rows = self.rows.write();
        let previous = match rows.get_mut(&document.id) {
            Some(row) => std::mem::replace(row, document.clone()),
            None => return Err(SyncError::NotFound(format!("document {}", document.id))),
        };
        if let Err(e) = save_table(&self.path, DOCUMENT_TABLE_MAGIC, &*rows) {
            rows.insert(document.id, previous);
            return Err(e);
        }
        Ok(())
    }

    pub fn delete(&self, id: DocumentId) -> Result<()> {
        let mut rows = self.rows.write();
        let previous = rows
            .remove(&id)
            .ok_or_else(|| SyncError::NotFound(format!("document {}", id)))?;
        if let Err(e) = save_table(&self.path, DOCUMENT_TABLE_MAGIC, &*rows) {
            rows.insert(id, previous);
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct SessionRows {
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
}

/// Connected editing sessions, by document.
pub struct SessionTable {
    path: PathBuf,
    rows: RwLock<SessionRows>,
}

impl SessionTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows: SessionRows = load_table(&path, SESSION_TABLE_MAGIC)?;
        rows.next_id = rows.next_id.max(1);
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    /// Open a session for a user (`Some`) or a named guest.
    pub fn create(
        &self,
        document: DocumentId,
        user_id: Option<String>,
        guest_name: Option<String>,
    ) -> Result<Session> {
        let mut rows = self.rows.write();
        let id = SessionId(rows.next_id);
        let session = Session {
            id,
            document_id: document,
            token: session_token(),
            user_id,
            guest_name,
            last_contact: Timestamp::now(),
        };

        rows.next_id += 1;
        rows.sessions.insert(id, session.clone());
        if let Err(e) = save_table(&self.path, SESSION_TABLE_MAGIC, &*rows) {
            rows.sessions.remove(&id);
            return Err(e);
        }
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.rows.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: SessionId) -> Option<Session> {
        self.rows.read().sessions.get(&id).cloned()
    }

    pub fn find_all(&self, document: DocumentId) -> Vec<Session> {
        self.rows
            .read()
            .sessions
            .values()
            .filter(|s| s.document_id == document)
            .cloned()
            .collect()
    }

    /// Delete every session of a document. Returns the number removed.
    pub fn delete_by_document(&self, document: DocumentId) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.sessions.len();
        rows.sessions.retain(|_, s| s.document_id != document);
        let removed = before - rows.sessions.len();
        if removed > 0 {
            save_table(&self.path, SESSION_TABLE_MAGIC, &*rows)?;
        }
        Ok(removed)
    }
}

impl SessionValidator for SessionTable {
    fn validate(&self, document: DocumentId, session: SessionId, token: &str) -> Option<Session> {
        self.find(session)
            .filter(|s| s.document_id == document && s.token == token)
    }
}

/// Random 128-bit session secret, hex encoded.
fn session_token() -> String {
    let mut secret = [0u8; 16];
    OsRng.fill_bytes(&mut secret);
    hex::encode(secret)
}
