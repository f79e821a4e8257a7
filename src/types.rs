//! Core types for the sync engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a document. Equal to the identity of its backing artifact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a connected editing session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of a stored step batch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub u64);

impl fmt::Debug for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepId({})", self.0)
    }
}

/// Number of update steps ever appended to a document's ledger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    /// Version reached after appending `count` more update steps.
    pub fn advance(self, count: usize) -> Self {
        Version(self.0 + count as u64)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since Unix epoch. Artifact modification times use this unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Timestamp(secs)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        Timestamp(
            time.duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        )
    }

    pub fn is_set(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Opaque content fingerprint of an artifact. Changes iff content changes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Etag(pub String);

impl Etag {
    /// Fingerprint of the given content (SHA-256, hex encoded).
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Etag(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "Etag({})", short)
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Saved-state bookkeeping for one artifact under collaborative editing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Artifact identity.
    pub id: DocumentId,

    /// Ledger version at the last durable write.
    pub last_saved_version: Version,

    /// Artifact modification time at the last durable write.
    pub last_saved_version_time: Timestamp,

    /// Artifact fingerprint at the last durable write.
    pub last_saved_version_etag: Etag,

    /// Artifact fingerprint when the document was created.
    pub base_version_etag: Etag,
}

impl Document {
    /// Fresh record for an artifact that has never been edited here.
    pub fn new(id: DocumentId, mtime: Timestamp, etag: Etag) -> Self {
        Self {
            id,
            last_saved_version: Version::ZERO,
            last_saved_version_time: mtime,
            last_saved_version_etag: etag.clone(),
            base_version_etag: etag,
        }
    }

    /// Record a durable write at `version`.
    pub fn mark_saved(&mut self, version: Version, mtime: Timestamp, etag: Etag) {
        self.last_saved_version = version;
        self.last_saved_version_time = mtime;
        self.last_saved_version_etag = etag;
    }
}

/// One persisted batch of client messages, tagged with the version it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub document_id: DocumentId,
    pub session_id: SessionId,
    pub version: Version,

    /// Base64-encoded client messages, in submission order.
    pub data: Vec<String>,
}

/// A connected client. Owned by the session collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub document_id: DocumentId,

    /// Authenticated user, `None` for guests.
    pub user_id: Option<String>,

    /// Display name chosen by a guest.
    pub guest_name: Option<String>,

    /// Secret presented with every request of this session.
    pub token: String,

    pub last_contact: Timestamp,
}

impl Session {
    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Result of submitting a batch of steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepsResponse {
    /// Steps the client should apply, ascending by version.
    pub steps: Vec<Step>,

    /// Version produced by the batch, or the client's version when the
    /// batch carried no updates.
    pub version: Version,
}
