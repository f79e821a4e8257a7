//! Error handling and recovery tests.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stepsync::{
    version_key, Artifact, AutosaveRequest, DistributedCache, DocumentId, DocumentService,
    MemoryArtifactStore, MemoryCache, MemoryLockProvider, SessionId, Step, StepLog, StepMessage,
    StepStore, SyncConfig, SyncError, Timestamp, Version,
};
use tempfile::TempDir;

/// Step log that can be told to fail inserts (after writing) and deletes.
struct FailingStore {
    inner: StepLog,
    fail_insert: AtomicBool,
    fail_delete: AtomicBool,
}

impl StepStore for FailingStore {
    fn insert(
        &self,
        document: DocumentId,
        session: SessionId,
        version: Version,
        data: &[String],
    ) -> stepsync::Result<Step> {
        let step = self.inner.insert(document, session, version, data)?;
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("write acknowledged too late".into()));
        }
        Ok(step)
    }

    fn latest_version(&self, document: DocumentId) -> stepsync::Result<Version> {
        self.inner.latest_version(document)
    }

    fn find(&self, document: DocumentId, since: Version) -> stepsync::Result<Vec<Step>> {
        self.inner.find(document, since)
    }

    fn delete_after_version(
        &self,
        document: DocumentId,
        version: Version,
    ) -> stepsync::Result<usize> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("database gone".into()));
        }
        self.inner.delete_after_version(document, version)
    }

    fn delete_all(&self, document: DocumentId) -> stepsync::Result<usize> {
        self.inner.delete_all(document)
    }
}

struct Harness {
    service: DocumentService,
    artifacts: Arc<MemoryArtifactStore>,
    cache: Arc<MemoryCache>,
    steps: Arc<FailingStore>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let cache = Arc::new(MemoryCache::new(100));
    let steps = Arc::new(FailingStore {
        inner: StepLog::open(dir.path().join("external-steps.log")).unwrap(),
        fail_insert: AtomicBool::new(false),
        fail_delete: AtomicBool::new(false),
    });
    let service = DocumentService::builder(SyncConfig::at(dir.path().join("data")))
        .artifacts(artifacts.clone())
        .cache(cache.clone())
        .step_store(steps.clone())
        .build()
        .unwrap();
    Harness {
        service,
        artifacts,
        cache,
        steps,
        _dir: dir,
    }
}

/// Show engine logs for failing tests (`cargo test -- --nocapture`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn updates(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| StepMessage::update(format!("delta {}", i).as_bytes()).to_base64())
        .collect()
}

fn open_document(h: &Harness) -> stepsync::Session {
    h.artifacts.create(DocumentId(1), "content", Timestamp(1_000));
    h.service.create_document(DocumentId(1)).unwrap();
    h.service
        .open_session(DocumentId(1), Some("alice".into()), None)
        .unwrap()
}

// --- Ledger Failures ---

#[test]
fn test_failed_append_rolls_back() {
    init_tracing();
    let h = harness();
    let session = open_document(&h);
    h.service.submit_steps(&session, &updates(2), Version::ZERO).unwrap();

    h.steps.fail_insert.store(true, Ordering::SeqCst);
    let err = h
        .service
        .submit_steps(&session, &updates(3), Version(2))
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));

    // Back at the checkpoint, in storage and in the cache
    assert_eq!(h.steps.latest_version(DocumentId(1)).unwrap(), Version(2));
    assert_eq!(h.cache.get(&version_key(DocumentId(1))), Some(2));
    let rows = h.service.fetch_steps(DocumentId(1), Version::ZERO).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows.iter().all(|s| s.version <= Version(2)));

    // The ledger keeps working
    h.steps.fail_insert.store(false, Ordering::SeqCst);
    let response = h
        .service
        .submit_steps(&session, &updates(3), Version(2))
        .unwrap();
    assert_eq!(response.version, Version(5));
}

#[test]
fn test_failed_rollback_is_fatal() {
    init_tracing();
    let h = harness();
    let session = open_document(&h);

    h.steps.fail_insert.store(true, Ordering::SeqCst);
    h.steps.fail_delete.store(true, Ordering::SeqCst);
    let err = h
        .service
        .submit_steps(&session, &updates(1), Version::ZERO)
        .unwrap_err();

    match err {
        SyncError::RollbackFailed {
            document,
            checkpoint,
            ..
        } => {
            assert_eq!(document, DocumentId(1));
            assert_eq!(checkpoint, Version::ZERO);
        }
        other => panic!("expected RollbackFailed, got {:?}", other),
    }
}

#[test]
fn test_malformed_steps_are_rejected() {
    let h = harness();
    let session = open_document(&h);

    let mut batch = updates(2);
    batch.push("not base64!".into());
    let err = h
        .service
        .submit_steps(&session, &batch, Version::ZERO)
        .unwrap_err();
    assert!(matches!(err, SyncError::MalformedStep(_)));

    // Nothing from the batch was stored
    assert_eq!(h.steps.latest_version(DocumentId(1)).unwrap(), Version::ZERO);

    // Valid base64 without a complete header
    let err = h
        .service
        .submit_steps(&session, &[String::new()], Version::ZERO)
        .unwrap_err();
    assert!(matches!(err, SyncError::MalformedStep(_)));
}

#[test]
fn test_query_only_batch_stores_nothing() {
    let h = harness();
    let session = open_document(&h);

    let query = StepMessage::query(b"").to_base64();
    let response = h
        .service
        .submit_steps(&session, &[query], Version(7))
        .unwrap();
    assert_eq!(response.version, Version(7));
    assert!(response.steps.is_empty());
    assert_eq!(h.steps.latest_version(DocumentId(1)).unwrap(), Version::ZERO);
}

#[test]
fn test_stale_cache_falls_back_to_storage() {
    let h = harness();
    let session = open_document(&h);
    h.service.submit_steps(&session, &updates(4), Version::ZERO).unwrap();

    // Another instance evicted or lost the entry
    h.cache.remove(&version_key(DocumentId(1)));
    assert_eq!(h.service.fetch_steps(DocumentId(1), Version::ZERO).unwrap().len(), 1);

    // A cache lagging behind storage never hides steps
    h.cache.set(&version_key(DocumentId(1)), 1, None);
    assert_eq!(h.service.fetch_steps(DocumentId(1), Version(2)).unwrap().len(), 1);
}

// --- Documents and Saving ---

#[test]
fn test_unknown_artifact() {
    let h = harness();
    assert!(matches!(
        h.service.create_document(DocumentId(42)),
        Err(SyncError::NotFound(_))
    ));
}

#[test]
fn test_autosave_without_artifact() {
    let h = harness();
    let session = open_document(&h);
    let document = h.service.get_document(DocumentId(1)).unwrap();
    h.artifacts.remove(DocumentId(1));

    let result = h
        .service
        .autosave(&session, document, &AutosaveRequest::new(Version::ZERO, "x"));
    assert!(matches!(result, Err(SyncError::NotFound(_))));
}

#[test]
fn test_outside_change_conflicts() {
    let h = harness();
    let session = open_document(&h);
    let document = h.service.get_document(DocumentId(1)).unwrap();

    // Replaced on disk behind the engine's back
    h.artifacts.remove(DocumentId(1));
    let file = h.artifacts.create(DocumentId(1), "edited on disk", Timestamp(5_000));

    let request = AutosaveRequest::new(Version::ZERO, "from the editor");
    let err = h
        .service
        .autosave(&session, document.clone(), &request)
        .unwrap_err();
    assert!(matches!(err, SyncError::ExternalConflict(DocumentId(1))));
    assert_eq!(file.write_count(), 0);

    // Forcing overwrites the outside change
    h.service
        .autosave(&session, document, &request.clone().forced())
        .unwrap();
    assert_eq!(file.content().unwrap(), b"from the editor");
}

#[test]
fn test_missing_state_file() {
    let h = harness();
    open_document(&h);
    assert!(h.service.get_state_file(DocumentId(1)).unwrap_err().is_not_found());
}

#[test]
fn test_reset_unknown_document_is_noop() {
    let h = harness();
    h.service.reset(DocumentId(9), false).unwrap();
}

// --- Locks ---

#[test]
fn test_unavailable_lock_provider() {
    let dir = TempDir::new().unwrap();
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let file = artifacts.create(DocumentId(1), "old", Timestamp(1_000));
    let service = DocumentService::builder(SyncConfig::at(dir.path()))
        .artifacts(artifacts)
        .lock_provider(Arc::new(MemoryLockProvider::unavailable()))
        .build()
        .unwrap();

    assert!(service.lock(DocumentId(1)).unwrap());
    service.unlock(DocumentId(1)).unwrap();
    assert!(service.lock_info(&*file).is_none());

    // Saving still works without locks
    let document = service.create_document(DocumentId(1)).unwrap();
    let session = service.open_session(DocumentId(1), Some("alice".into()), None).unwrap();
    service
        .autosave(&session, document, &AutosaveRequest::new(Version::ZERO, "new"))
        .unwrap();
    assert_eq!(file.write_count(), 1);
}

// --- Store ---

#[test]
fn test_store_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig::at(dir.path());
    let _first = DocumentService::open(config.clone()).unwrap();
    assert!(matches!(
        DocumentService::open(config),
        Err(SyncError::StoreLocked)
    ));
}

#[test]
fn test_torn_step_log_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("steps.log");

    {
        let log = StepLog::open(&path).unwrap();
        log.insert(DocumentId(1), SessionId(1), Version(2), &updates(2))
            .unwrap();
        log.insert(DocumentId(1), SessionId(1), Version(3), &updates(1))
            .unwrap();
    }

    // Half-written entry at the end
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0, 1, 0, 0, 0, 0]).unwrap();
    drop(file);

    let log = StepLog::open(&path).unwrap();
    assert_eq!(log.latest_version(DocumentId(1)).unwrap(), Version(3));
    assert_eq!(log.find(DocumentId(1), Version::ZERO).unwrap().len(), 2);

    // Appends continue after the valid prefix
    log.insert(DocumentId(1), SessionId(1), Version(4), &updates(1))
        .unwrap();
    drop(log);
    let log = StepLog::open(&path).unwrap();
    assert_eq!(log.latest_version(DocumentId(1)).unwrap(), Version(4));
}
