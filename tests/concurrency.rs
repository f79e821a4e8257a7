//! Concurrent access tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use stepsync::{
    save_lock_key, Artifact, AutosaveRequest, DistributedCache, DocumentId, DocumentService,
    LockProvider, MemoryArtifactStore, MemoryCache, MemoryLockProvider, StepMessage, SyncConfig,
    SyncError, Timestamp, Version,
};
use tempfile::TempDir;

struct Harness {
    service: DocumentService,
    artifacts: Arc<MemoryArtifactStore>,
    cache: Arc<MemoryCache>,
    locks: Arc<MemoryLockProvider>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let cache = Arc::new(MemoryCache::new(1_000));
    let locks = Arc::new(MemoryLockProvider::new());
    let config = SyncConfig {
        sync_interval: 64,
        ..SyncConfig::at(dir.path().join("data"))
    };
    let service = DocumentService::builder(config)
        .artifacts(artifacts.clone())
        .cache(cache.clone())
        .lock_provider(locks.clone())
        .build()
        .unwrap();
    Harness {
        service,
        artifacts,
        cache,
        locks,
        _dir: dir,
    }
}

fn updates(n: usize, tag: usize) -> Vec<String> {
    (0..n)
        .map(|i| StepMessage::update(format!("{}:{}", tag, i).as_bytes()).to_base64())
        .collect()
}

#[test]
fn test_concurrent_appends_same_document() {
    let h = harness();
    h.artifacts.create(DocumentId(1), "", Timestamp(1_000));
    h.service.create_document(DocumentId(1)).unwrap();

    let threads = 8;
    let batches_per_thread = 25;

    let assigned: Vec<Version> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let service = &h.service;
                s.spawn(move || {
                    let session = service
                        .open_session(DocumentId(1), Some(format!("user-{}", t)), None)
                        .unwrap();
                    let mut versions = Vec::new();
                    for b in 0..batches_per_thread {
                        // Batch sizes 1..=3
                        let count = (t + b) % 3 + 1;
                        let response = service
                            .submit_steps(&session, &updates(count, t), Version::ZERO)
                            .unwrap();
                        versions.push(response.version);
                    }
                    versions
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    // No two batches got the same version
    let unique: HashSet<Version> = assigned.iter().copied().collect();
    assert_eq!(unique.len(), assigned.len());

    // Versions are gapless relative to the submitted update counts
    let steps = h.service.fetch_steps(DocumentId(1), Version::ZERO).unwrap();
    assert_eq!(steps.len(), threads * batches_per_thread);
    let mut previous = Version::ZERO;
    for step in &steps {
        assert_eq!(step.version, previous.advance(step.data.len()));
        previous = step.version;
    }

    let total: usize = (0..threads)
        .flat_map(|t| (0..batches_per_thread).map(move |b| (t + b) % 3 + 1))
        .sum();
    assert_eq!(previous, Version(total as u64));
}

#[test]
fn test_documents_are_independent() {
    let h = harness();
    for id in 1..=4 {
        h.artifacts.create(DocumentId(id), "", Timestamp(1_000));
        h.service.create_document(DocumentId(id)).unwrap();
    }

    thread::scope(|s| {
        for id in 1..=4u64 {
            let service = &h.service;
            s.spawn(move || {
                let session = service
                    .open_session(DocumentId(id), Some("writer".into()), None)
                    .unwrap();
                for _ in 0..20 {
                    service
                        .submit_steps(&session, &updates(id as usize, 0), Version::ZERO)
                        .unwrap();
                }
            });
        }
    });

    for id in 1..=4u64 {
        let steps = h.service.fetch_steps(DocumentId(id), Version::ZERO).unwrap();
        assert_eq!(steps.len(), 20);
        assert_eq!(steps.last().unwrap().version, Version(20 * id));
    }
}

#[test]
fn test_concurrent_creators_share_one_document() {
    let h = harness();
    h.artifacts.create(DocumentId(1), "base", Timestamp(1_000));

    let documents: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = &h.service;
                s.spawn(move || service.create_document(DocumentId(1)).unwrap())
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(documents.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(h.service.get_all().len(), 1);
}

#[test]
fn test_concurrent_autosaves() {
    let h = harness();
    let file = h.artifacts.create(DocumentId(1), "base", Timestamp(1_000));
    let document = h.service.create_document(DocumentId(1)).unwrap();

    let candidates: Vec<String> = (0..6).map(|i| format!("version from client {}", i)).collect();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = candidates
            .iter()
            .enumerate()
            .map(|(i, content)| {
                let service = &h.service;
                let document = document.clone();
                s.spawn(move || {
                    let session = service
                        .open_session(DocumentId(1), Some(format!("user-{}", i)), None)
                        .unwrap();
                    let request = AutosaveRequest::new(Version::ZERO, content.as_bytes()).manual();
                    service.autosave(&session, document, &request)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    // Losers either skip or see the winner's write as an outside change
    for result in &results {
        match result {
            Ok(_) | Err(SyncError::ExternalConflict(DocumentId(1))) => {}
            Err(e) => panic!("unexpected save error: {}", e),
        }
    }
    assert!(results.iter().any(|r| r.is_ok()));

    let content = String::from_utf8(file.content().unwrap()).unwrap();
    assert!(candidates.contains(&content));

    // Every exit path released both locks
    assert!(h.cache.get(&save_lock_key(DocumentId(1))).is_none());
    assert!(h.locks.get_locks(DocumentId(1)).unwrap().is_empty());
}
