//! Per-document version ledger.

use crate::cache::{DistributedCache, VersionCache};
use crate::error::{Result, SyncError};
use crate::steps::StepStore;
use crate::types::{DocumentId, SessionId, Step, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Append-only, strictly ordered log of update steps per document.
///
/// Appends for one document are serialized by a per-document writer lock
/// held across the read-latest-then-insert sequence, so two batches can
/// never be assigned overlapping version ranges. Appends to different
/// documents proceed in parallel.
pub struct VersionLedger {
    /// Durable step rows (ground truth).
    steps: Arc<dyn StepStore>,

    /// Fast-path mirror of the latest version.
    cache: Arc<dyn DistributedCache>,

    /// Expiry of mirrored versions.
    cache_ttl: Option<Duration>,

    /// One writer lock per document.
    writers: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl VersionLedger {
    pub fn new(
        steps: Arc<dyn StepStore>,
        cache: Arc<dyn DistributedCache>,
        cache_ttl: Option<Duration>,
    ) -> Self {
        Self {
            steps,
            cache,
            cache_ttl,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn versions(&self) -> VersionCache<'_> {
        VersionCache::new(self.cache.as_ref(), self.cache_ttl)
    }

    fn writer(&self, document: DocumentId) -> Arc<Mutex<()>> {
        Arc::clone(self.writers.lock().entry(document).or_default())
    }

    /// Drop a writer handle and forget the lock once nobody else holds it.
    ///
    /// Handles are only cloned under the table lock, so a count of one means
    /// no thread is waiting on or holding this writer.
    fn release_writer(&self, document: DocumentId, writer: Arc<Mutex<()>>) {
        drop(writer);
        let mut writers = self.writers.lock();
        if writers
            .get(&document)
            .is_some_and(|w| Arc::strong_count(w) == 1)
        {
            writers.remove(&document);
        }
    }

    /// Append a batch of update steps as one row.
    ///
    /// The new version is the latest persisted version plus the number of
    /// steps in the batch. A failed insert is rolled back to the previous
    /// version before the error is returned.
    pub fn append_batch(
        &self,
        document: DocumentId,
        session: SessionId,
        update_steps: &[String],
        client_version: Version,
    ) -> Result<Version> {
        if update_steps.is_empty() {
            return Err(SyncError::EmptyBatch);
        }

        let writer = self.writer(document);
        let result = {
            let _guard = writer.lock();
            self.append_locked(document, session, update_steps, client_version)
        };
        self.release_writer(document, writer);
        result
    }

    fn append_locked(
        &self,
        document: DocumentId,
        session: SessionId,
        update_steps: &[String],
        client_version: Version,
    ) -> Result<Version> {
        let checkpoint = self.steps.latest_version(document)?;
        let new_version = checkpoint.advance(update_steps.len());
        debug!(
            document = %document,
            session = %session,
            client_version = %client_version,
            from = %checkpoint,
            to = %new_version,
            "Adding steps, bumping version"
        );

        self.versions().publish(document, new_version);
        match self.steps.insert(document, session, new_version, update_steps) {
            Ok(_) => Ok(new_version),
            Err(e) => Err(self.rollback(document, checkpoint, e)),
        }
    }

    /// Restore `checkpoint` after a failed append. Returns the error to surface.
    fn rollback(&self, document: DocumentId, checkpoint: Version, cause: SyncError) -> SyncError {
        error!(
            document = %document,
            checkpoint = %checkpoint,
            error = %cause,
            "Storing steps failed, recovering last stable version"
        );

        self.versions().publish(document, checkpoint);
        match self.steps.delete_after_version(document, checkpoint) {
            Ok(_) => cause,
            Err(e) => {
                error!(
                    document = %document,
                    checkpoint = %checkpoint,
                    error = %e,
                    "Rollback failed, step log may contain orphaned rows"
                );
                SyncError::RollbackFailed {
                    document,
                    checkpoint,
                    reason: format!("{} (while recovering from: {})", e, cause),
                }
            }
        }
    }

    /// Steps with a version greater than `since`, ascending.
    ///
    /// Returns nothing without touching storage when `since` equals the
    /// cached latest version.
    pub fn read(&self, document: DocumentId, since: Version) -> Result<Vec<Step>> {
        if self.versions().get(document) == Some(since) {
            return Ok(Vec::new());
        }
        self.steps.find(document, since)
    }

    /// Authoritative latest version, read from storage.
    pub fn latest_version(&self, document: DocumentId) -> Result<Version> {
        self.steps.latest_version(document)
    }

    /// Cached latest version, if any. Only a hint.
    pub fn cached_version(&self, document: DocumentId) -> Option<Version> {
        self.versions().get(document)
    }

    /// Publish a known version into the cache (e.g. for a new document).
    pub fn seed(&self, document: DocumentId, version: Version) {
        self.versions().publish(document, version);
    }

    /// Delete every step of a document. Used by reset.
    pub fn delete_all(&self, document: DocumentId) -> Result<usize> {
        let writer = self.writer(document);
        let result = {
            let _guard = writer.lock();
            let result = self.steps.delete_all(document);
            if result.is_ok() {
                self.versions().forget(document);
            }
            result
        };
        self.release_writer(document, writer);
        result
    }
}
