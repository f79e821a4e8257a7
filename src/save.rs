//! Autosave coordination.
//!
//! An autosave request carries the content a client rendered at some ledger
//! version. Whether it is written depends on three staleness signals: the
//! requested version against the saved and latest versions, the artifact's
//! modification time against the last save, and the artifact's fingerprint
//! against the one recorded at the last save. The branches below run in a
//! fixed order and the first one that applies ends the request.
//!
//! The debounce and content-unchanged checks read the artifact without the
//! write lock. An outside writer racing with them can be missed; only the
//! final write runs under the exclusive app lock.

use crate::artifact::Artifact;
use crate::cache::{save_lock_key, DistributedCache};
use crate::documents::DocumentManager;
use crate::error::{Result, SyncError};
use crate::locking::LockCoordinator;
use crate::steps::VersionLedger;
use crate::types::{Document, DocumentId, Timestamp, Version};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A client's request to persist its rendered document.
#[derive(Clone, Debug, Default)]
pub struct AutosaveRequest {
    /// Ledger version the client had fetched when rendering `content`.
    pub version: Version,

    /// Rendered artifact content. `None` means nothing to save.
    pub content: Option<Vec<u8>>,

    /// Compacted editor state to store alongside the content.
    pub document_state: Option<Vec<u8>>,

    /// Skip the outside-conflict and staleness checks.
    pub force: bool,

    /// User-triggered save; skips the debounce.
    pub manual: bool,

    /// Share token the session connected with, if any.
    pub share_token: Option<String>,
}

impl AutosaveRequest {
    pub fn new(version: Version, content: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_document_state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.document_state = Some(state.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn with_share_token(mut self, token: impl Into<String>) -> Self {
        self.share_token = Some(token.into());
        self
    }

    fn state(&self) -> Option<&[u8]> {
        self.document_state.as_deref().filter(|s| !s.is_empty())
    }
}

/// Short-lived marker telling other instances a save is in flight.
///
/// Removed on drop, so every exit path after acquisition releases it. The
/// cache expiry bounds how long a crashed holder can keep it.
struct SaveLock<'a> {
    cache: &'a dyn DistributedCache,
    key: String,
}

impl<'a> SaveLock<'a> {
    fn acquire(cache: &'a dyn DistributedCache, document: DocumentId, ttl: Duration) -> Option<Self> {
        let key = save_lock_key(document);
        cache.add(&key, 1, Some(ttl)).then(|| Self { cache, key })
    }
}

impl Drop for SaveLock<'_> {
    fn drop(&mut self) {
        self.cache.remove(&self.key);
    }
}

/// Decides whether an autosave proceeds and performs the write.
pub struct SaveCoordinator {
    documents: Arc<DocumentManager>,
    ledger: Arc<VersionLedger>,
    locks: Arc<LockCoordinator>,
    cache: Arc<dyn DistributedCache>,
    minimum_delay: Duration,
    save_lock_ttl: Duration,
}

impl SaveCoordinator {
    pub fn new(
        documents: Arc<DocumentManager>,
        ledger: Arc<VersionLedger>,
        locks: Arc<LockCoordinator>,
        cache: Arc<dyn DistributedCache>,
        minimum_delay: Duration,
        save_lock_ttl: Duration,
    ) -> Self {
        Self {
            documents,
            ledger,
            locks,
            cache,
            minimum_delay,
            save_lock_ttl,
        }
    }

    /// Fail with `ExternalConflict` if the artifact was changed outside the
    /// engine since the last save.
    ///
    /// Documents that were never saved, forced saves, read-only artifacts and
    /// artifacts with a save in flight never conflict.
    pub fn assert_no_outside_conflict(
        &self,
        document: &Document,
        artifact: &dyn Artifact,
        force: bool,
        share_token: Option<&str>,
    ) -> Result<()> {
        let last_mtime = document.last_saved_version_time;
        if last_mtime.is_set()
            && !force
            && !self.locks.is_read_only(artifact, share_token)
            && artifact.etag()? != document.last_saved_version_etag
            && artifact.mtime()? != last_mtime
            && self.cache.get(&save_lock_key(document.id)).is_none()
        {
            return Err(SyncError::ExternalConflict(document.id));
        }
        Ok(())
    }

    /// Persist `request.content` to the artifact if nothing newer has been
    /// saved, returning the resulting Document.
    ///
    /// Every "skip" outcome returns the Document unchanged. Lock contention
    /// with a third party is a skip, not an error.
    pub fn autosave(
        &self,
        mut document: Document,
        artifact: Option<&dyn Artifact>,
        request: &AutosaveRequest,
    ) -> Result<Document> {
        let artifact = artifact
            .ok_or_else(|| SyncError::NotFound(format!("artifact of document {}", document.id)))?;
        let share_token = request.share_token.as_deref();

        if self.locks.is_read_only(artifact, share_token) {
            return Ok(document);
        }

        self.assert_no_outside_conflict(&document, artifact, request.force, share_token)?;

        let content = match request.content.as_deref() {
            Some(content) => content,
            None => return Ok(document),
        };

        // The client may have added steps on top of `version`, so equal
        // versions still save.
        let steps_version = self.ledger.latest_version(document.id)?;
        let saved_version = document.last_saved_version;
        let outdated = saved_version > Version::ZERO && saved_version > request.version;
        if !request.force && (outdated || request.version > steps_version) {
            return Ok(document);
        }

        if !request.manual && self.debounced(&document, artifact)? {
            return Ok(document);
        }

        if content.is_empty() {
            self.warn_empty_save(&document, artifact, request);
        }

        if content == artifact.content()?.as_slice() {
            if let Some(state) = request.state() {
                self.documents.write_state(document.id, state)?;
            }
            document.mark_saved(steps_version, artifact.mtime()?, artifact.etag()?);
            self.documents.update(&document)?;
            return Ok(document);
        }

        let _save_lock = match SaveLock::acquire(self.cache.as_ref(), document.id, self.save_lock_ttl)
        {
            Some(lock) => lock,
            None => {
                debug!(document = %document.id, "Save already in progress, skipping");
                return Ok(document);
            }
        };

        let written = self.locks.run_in_scope(artifact, || {
            artifact.put_content(content)?;
            if let Some(state) = request.state() {
                self.documents.write_state(document.id, state)?;
            }
            Ok(())
        });

        match written {
            Ok(()) => {
                document.mark_saved(steps_version, artifact.mtime()?, artifact.etag()?);
                self.documents.update(&document)?;
                Ok(document)
            }
            // Multiple people saving at the same time
            Err(SyncError::Locked(_)) => {
                debug!(document = %document.id, "Artifact locked, save abandoned");
                Ok(document)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the artifact was saved by us within the minimum delay and has
    /// not been touched since.
    fn debounced(&self, document: &Document, artifact: &dyn Artifact) -> Result<bool> {
        let last_mtime = document.last_saved_version_time;
        let threshold = Timestamp::now().0 - self.minimum_delay.as_secs() as i64;
        Ok(artifact.mtime()? == last_mtime && last_mtime.0 > threshold)
    }

    fn warn_empty_save(
        &self,
        document: &Document,
        artifact: &dyn Artifact,
        request: &AutosaveRequest,
    ) {
        let steps = self
            .ledger
            .read(document.id, Version::ZERO)
            .map(|steps| steps.len())
            .unwrap_or(0);
        warn!(
            document = %document.id,
            request_version = %request.version,
            last_saved_version = %document.last_saved_version,
            has_document_state = request.state().is_some(),
            size_before_save = artifact.size().unwrap_or(0),
            steps,
            sessions = self.documents.session_count(document.id),
            "Saving empty document"
        );
    }
}
