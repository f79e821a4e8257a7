//! The engine facade.
//!
//! [`DocumentService`] wires the ledger, lifecycle manager, save and lock
//! coordinators to a persisted [`Store`] and the external collaborators.
//! Collaborators not supplied to the builder get in-process defaults.

use crate::artifact::{Artifact, ArtifactStore, MemoryArtifactStore};
use crate::cache::{DistributedCache, MemoryCache};
use crate::config::SyncConfig;
use crate::documents::DocumentManager;
use crate::error::{Result, SyncError};
use crate::locking::{LockCoordinator, LockInfo, LockProvider, MemoryLockProvider};
use crate::message::{split_batch, StepMessage};
use crate::save::{AutosaveRequest, SaveCoordinator};
use crate::session::{SessionGate, SessionValidator};
use crate::shares::{MemoryShareProvider, Permissions, ShareProvider};
use crate::steps::{StepStore, VersionLedger};
use crate::store::{Store, StoreStats};
use crate::types::{Document, DocumentId, Session, SessionId, Step, StepsResponse, Version};
use std::sync::Arc;

/// Builder for a [`DocumentService`].
pub struct DocumentServiceBuilder {
    config: SyncConfig,
    cache: Option<Arc<dyn DistributedCache>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    shares: Option<Arc<dyn ShareProvider>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    step_store: Option<Arc<dyn StepStore>>,
    session_validator: Option<Arc<dyn SessionValidator>>,
}

impl DocumentServiceBuilder {
    pub fn cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn shares(mut self, shares: Arc<dyn ShareProvider>) -> Self {
        self.shares = Some(shares);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Replace the store's step log as the step table.
    pub fn step_store(mut self, steps: Arc<dyn StepStore>) -> Self {
        self.step_store = Some(steps);
        self
    }

    /// Replace the store's session table as the session validator.
    pub fn session_validator(mut self, validator: Arc<dyn SessionValidator>) -> Self {
        self.session_validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<DocumentService> {
        let config = self.config;
        let store = Store::open_or_create(&config)?;

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(config.cache_capacity)));
        let provider = self
            .lock_provider
            .unwrap_or_else(|| Arc::new(MemoryLockProvider::new()));
        let shares = self
            .shares
            .unwrap_or_else(|| Arc::new(MemoryShareProvider::new()));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new()));
        let steps = self.step_store.unwrap_or_else(|| store.steps.clone());
        let validator = self
            .session_validator
            .unwrap_or_else(|| store.sessions.clone());

        let ledger = Arc::new(VersionLedger::new(
            steps,
            Arc::clone(&cache),
            config.version_cache_ttl,
        ));
        let locks = Arc::new(LockCoordinator::new(
            provider,
            Arc::clone(&artifacts),
            Arc::clone(&shares),
            config.app_name.clone(),
        ));
        let documents = Arc::new(DocumentManager::new(
            store.documents.clone(),
            store.sessions.clone(),
            store.states.clone(),
            Arc::clone(&ledger),
            Arc::clone(&locks),
        ));
        let saves = SaveCoordinator::new(
            Arc::clone(&documents),
            Arc::clone(&ledger),
            Arc::clone(&locks),
            cache,
            config.autosave_minimum_delay,
            config.save_lock_ttl,
        );
        let gate = SessionGate::new(validator, store.documents.clone());

        Ok(DocumentService {
            config,
            store,
            artifacts,
            shares,
            ledger,
            locks,
            documents,
            saves,
            gate,
        })
    }
}

/// Collaborative editing backend for one data directory.
pub struct DocumentService {
    config: SyncConfig,
    store: Store,
    artifacts: Arc<dyn ArtifactStore>,
    shares: Arc<dyn ShareProvider>,
    ledger: Arc<VersionLedger>,
    locks: Arc<LockCoordinator>,
    documents: Arc<DocumentManager>,
    saves: SaveCoordinator,
    gate: SessionGate,
}

impl DocumentService {
    pub fn builder(config: SyncConfig) -> DocumentServiceBuilder {
        DocumentServiceBuilder {
            config,
            cache: None,
            lock_provider: None,
            shares: None,
            artifacts: None,
            step_store: None,
            session_validator: None,
        }
    }

    /// Open with default collaborators.
    pub fn open(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    // --- Documents ---

    /// Resolve the Document of an artifact, creating it on first access.
    pub fn create_document(&self, artifact_id: DocumentId) -> Result<Document> {
        let artifact = self.artifacts.get(artifact_id)?;
        self.documents.get_or_create(artifact.as_ref())
    }

    pub fn get_document(&self, id: DocumentId) -> Option<Document> {
        self.documents.get(id)
    }

    pub fn get_all(&self) -> Vec<Document> {
        self.documents.all()
    }

    pub fn has_unsaved_changes(&self, document: &Document) -> Result<bool> {
        self.documents.has_unsaved_changes(document)
    }

    /// Delete a document and everything attached to it.
    pub fn reset(&self, id: DocumentId, force: bool) -> Result<()> {
        self.documents.reset(id, force)
    }

    pub fn write_document_state(&self, id: DocumentId, state: &[u8]) -> Result<()> {
        self.documents.write_state(id, state)
    }

    pub fn get_state_file(&self, id: DocumentId) -> Result<Vec<u8>> {
        self.documents.read_state(id)
    }

    // --- Sessions ---

    /// Open a session for a user (`Some`) or a named guest.
    pub fn open_session(
        &self,
        document: DocumentId,
        user_id: Option<String>,
        guest_name: Option<String>,
    ) -> Result<Session> {
        self.store.sessions.create(document, user_id, guest_name)
    }

    /// Validate a request's session handle and load its document.
    pub fn require_document_session(
        &self,
        document: DocumentId,
        session: SessionId,
        token: &str,
    ) -> Result<(Session, Document)> {
        self.gate.require_document_session(document, session, token)
    }

    // --- Steps ---

    /// Append the update steps of a batch and return what the client is
    /// missing.
    ///
    /// A batch with any query step is answered with the full history;
    /// otherwise with the steps after `client_version`. Query messages are
    /// never stored, and only sync updates are returned.
    pub fn submit_steps(
        &self,
        session: &Session,
        steps: &[String],
        client_version: Version,
    ) -> Result<StepsResponse> {
        let document = session.document_id;
        let batch = split_batch(steps)?;

        let version = if batch.updates.is_empty() {
            client_version
        } else {
            self.ledger
                .append_batch(document, session.id, &batch.updates, client_version)?
        };

        let since = if batch.has_queries() {
            Version::ZERO
        } else {
            client_version
        };
        let steps = sync_updates_only(self.ledger.read(document, since)?)?;

        Ok(StepsResponse { steps, version })
    }

    /// Steps after `since`, ascending.
    pub fn fetch_steps(&self, document: DocumentId, since: Version) -> Result<Vec<Step>> {
        self.ledger.read(document, since)
    }

    // --- Saving ---

    /// Save a client's rendered content; see [`SaveCoordinator::autosave`].
    pub fn autosave(
        &self,
        session: &Session,
        document: Document,
        request: &AutosaveRequest,
    ) -> Result<Document> {
        let artifact = match self.artifact_for_session(session, request.share_token.as_deref()) {
            Ok(artifact) => Some(artifact),
            Err(SyncError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        self.saves.autosave(document, artifact.as_deref(), request)
    }

    pub fn assert_no_outside_conflict(
        &self,
        document: &Document,
        artifact: &dyn Artifact,
        force: bool,
        share_token: Option<&str>,
    ) -> Result<()> {
        self.saves
            .assert_no_outside_conflict(document, artifact, force, share_token)
    }

    // --- Locks and permissions ---

    pub fn lock(&self, artifact_id: DocumentId) -> Result<bool> {
        self.locks.lock(artifact_id)
    }

    pub fn unlock(&self, artifact_id: DocumentId) -> Result<()> {
        self.locks.unlock(artifact_id)
    }

    pub fn is_read_only(&self, artifact: &dyn Artifact, share_token: Option<&str>) -> bool {
        self.locks.is_read_only(artifact, share_token)
    }

    pub fn lock_info(&self, artifact: &dyn Artifact) -> Option<LockInfo> {
        self.locks.lock_info(artifact)
    }

    /// Fails with `NotFound` unless the share exists and grants `permission`.
    pub fn check_share_permissions(&self, token: &str, permission: Permissions) -> Result<()> {
        self.shares.check_share_access(token, permission)
    }

    /// The artifact a session edits.
    ///
    /// User sessions resolve it directly. Guest sessions must present a share
    /// token whose share covers the document.
    pub fn artifact_for_session(
        &self,
        session: &Session,
        share_token: Option<&str>,
    ) -> Result<Arc<dyn Artifact>> {
        if !session.is_guest() {
            return self.artifacts.get(session.document_id);
        }

        let token = share_token.ok_or_else(|| SyncError::NotFound("No proper share data".into()))?;
        let share = self
            .shares
            .share_by_token(token)
            .ok_or_else(|| SyncError::NotFound(format!("share {}", token)))?;
        if !share.covers(session.document_id) {
            return Err(SyncError::NotFound("No proper share data".into()));
        }
        self.artifacts.get(session.document_id)
    }

    /// The artifact behind a single-artifact share.
    pub fn artifact_by_share_token(&self, token: &str) -> Result<Arc<dyn Artifact>> {
        let share = self
            .shares
            .share_by_token(token)
            .ok_or_else(|| SyncError::NotFound(format!("share {}", token)))?;
        match share.artifacts.as_slice() {
            [artifact] => self.artifacts.get(*artifact),
            _ => Err(SyncError::NotFound("No proper share data".into())),
        }
    }
}

/// Keep only sync update messages of stored rows, and drop rows left empty.
fn sync_updates_only(steps: Vec<Step>) -> Result<Vec<Step>> {
    let mut filtered = Vec::with_capacity(steps.len());
    for mut step in steps {
        let mut data = Vec::with_capacity(step.data.len());
        for message in step.data {
            if StepMessage::from_base64(&message)?.is_sync_update() {
                data.push(message);
            }
        }
        if !data.is_empty() {
            step.data = data;
            filtered.push(step);
        }
    }
    Ok(filtered)
}
