//! Error types for the sync engine.

use crate::types::{DocumentId, SessionId, Version};
use thiserror::Error;

/// Main error type for ledger, document and save operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid session {session} for document {document}")]
    InvalidSession {
        document: DocumentId,
        session: SessionId,
    },

    #[error("Document {0} changed in the meantime from outside")]
    ExternalConflict(DocumentId),

    #[error("Document {0} has unsaved changes")]
    UnsavedChanges(DocumentId),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Rollback of document {document} to {checkpoint:?} failed: {reason}")]
    RollbackFailed {
        document: DocumentId,
        checkpoint: Version,
        reason: String,
    },

    #[error("Malformed step: {0}")]
    MalformedStep(String),

    #[error("Step batch contains no update steps")]
    EmptyBatch,

    #[error("Document {0} already exists")]
    UniqueViolation(DocumentId),

    #[error("No lock provider available")]
    NoLockProvider,

    #[error("Lock precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Artifact {artifact} is locked by {owner}")]
    OwnerLocked { artifact: DocumentId, owner: String },

    #[error("Artifact {0} is locked")]
    Locked(DocumentId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    StoreLocked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Whether a boundary layer should answer with "access denied".
    pub fn is_access_denied(&self) -> bool {
        matches!(self, SyncError::InvalidSession { .. })
    }

    /// Whether this is one of the not-found kinds.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<base64::DecodeError> for SyncError {
    fn from(e: base64::DecodeError) -> Self {
        SyncError::MalformedStep(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
