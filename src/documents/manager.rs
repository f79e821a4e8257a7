//! Document lifecycle: creation, unsaved-change detection, reset.

use crate::artifact::Artifact;
use crate::documents::{DocumentTable, SessionTable, StateSnapshots};
use crate::error::{Result, SyncError};
use crate::locking::LockCoordinator;
use crate::steps::VersionLedger;
use crate::types::{Document, DocumentId, Version};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates, resolves and tears down Document records.
pub struct DocumentManager {
    documents: Arc<DocumentTable>,
    sessions: Arc<SessionTable>,
    states: Arc<StateSnapshots>,
    ledger: Arc<VersionLedger>,
    locks: Arc<LockCoordinator>,
}

impl DocumentManager {
    pub fn new(
        documents: Arc<DocumentTable>,
        sessions: Arc<SessionTable>,
        states: Arc<StateSnapshots>,
        ledger: Arc<VersionLedger>,
        locks: Arc<LockCoordinator>,
    ) -> Self {
        Self {
            documents,
            sessions,
            states,
            ledger,
            locks,
        }
    }

    pub fn get(&self, id: DocumentId) -> Option<Document> {
        self.documents.get(id)
    }

    pub fn all(&self) -> Vec<Document> {
        self.documents.find_all()
    }

    pub fn update(&self, document: &Document) -> Result<()> {
        self.documents.update(document)
    }

    /// Resolve the Document of an artifact, creating it on first access.
    ///
    /// An existing record is returned as-is even when its ledger has moved
    /// past the saved version: resetting it would throw away steps other
    /// clients still rely on.
    pub fn get_or_create(&self, artifact: &dyn Artifact) -> Result<Document> {
        let id = artifact.id();
        if let Some(document) = self.documents.get(id) {
            let steps_version = self.ledger.latest_version(id)?;
            if steps_version != Version::ZERO && steps_version != document.last_saved_version {
                debug!(
                    document = %id,
                    saved = %document.last_saved_version,
                    steps = %steps_version,
                    "Unsaved steps, continue collaborative editing"
                );
            }
            return Ok(document);
        }

        if let Err(e) = self.states.ensure_folder() {
            error!(document = %id, error = %e, "No folder present for editor state");
            return Err(SyncError::NotFound(
                "No folder present for editor state".into(),
            ));
        }

        let document = Document::new(id, artifact.mtime()?, artifact.etag()?);
        match self.documents.insert(document) {
            Ok(document) => {
                self.ledger.seed(id, Version::ZERO);
                Ok(document)
            }
            // Another creator won the race
            Err(SyncError::UniqueViolation(_)) => self.documents.find(id),
            Err(e) => Err(e),
        }
    }

    /// Whether the ledger has moved away from the last saved version.
    pub fn has_unsaved_changes(&self, document: &Document) -> Result<bool> {
        let steps_version = self.ledger.latest_version(document.id)?;
        Ok(steps_version != document.last_saved_version)
    }

    /// Delete the Document with its steps, sessions and editor state.
    ///
    /// Refuses with `UnsavedChanges` unless `force` is set or the ledger
    /// matches the saved version. Missing records are ignored.
    pub fn reset(&self, id: DocumentId, force: bool) -> Result<()> {
        let document = match self.documents.find(id) {
            Ok(document) => document,
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if !force && self.has_unsaved_changes(&document)? {
            debug!(document = %id, "Did not reset document, it has unsaved changes");
            return Err(SyncError::UnsavedChanges(id));
        }

        self.locks.unlock(id)?;
        self.ledger.delete_all(id)?;
        self.sessions.delete_by_document(id)?;
        match self.documents.delete(id) {
            Ok(()) | Err(SyncError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.states.delete(id)?;

        debug!(document = %id, "Document reset");
        Ok(())
    }

    /// Create or replace the editor-state snapshot of a document.
    ///
    /// If the snapshot folder cannot be created the snapshot is skipped; it
    /// can always be rebuilt from the step log.
    pub fn write_state(&self, id: DocumentId, state: &[u8]) -> Result<()> {
        if let Err(e) = self.states.ensure_folder() {
            error!(document = %id, error = %e, "Failed to create document state file");
            return Ok(());
        }
        self.states.write(id, state)
    }

    pub fn read_state(&self, id: DocumentId) -> Result<Vec<u8>> {
        self.states.read(id)
    }

    pub fn session_count(&self, id: DocumentId) -> usize {
        self.sessions.find_all(id).len()
    }
}
