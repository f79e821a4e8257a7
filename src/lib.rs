//! # stepsync
//!
//! Server-side synchronization core for collaboratively edited documents.
//!
//! ## Core Concepts
//!
//! - **Steps**: Batches of opaque client edits, appended to a per-document
//!   ledger under a single-writer lock
//! - **Versions**: Count of update steps ever appended; clients catch up by
//!   fetching everything after the version they know
//! - **Documents**: Saved-state bookkeeping for each edited artifact
//! - **Autosave**: Writes client-rendered content back to the artifact when
//!   no newer save and no outside edit got in the way
//!
//! ## Example
//!
//! ```ignore
//! use stepsync::{AutosaveRequest, DocumentService, SyncConfig, Version};
//!
//! let service = DocumentService::builder(SyncConfig::at("./data"))
//!     .artifacts(artifacts)
//!     .build()?;
//!
//! let document = service.create_document(artifact_id)?;
//! let session = service.open_session(document.id, Some("alice".into()), None)?;
//!
//! // Submit steps, receive what this client is missing
//! let response = service.submit_steps(&session, &steps, Version(0))?;
//!
//! // Save the rendered content
//! let request = AutosaveRequest::new(response.version, content);
//! let document = service.autosave(&session, document, &request)?;
//! ```

pub mod artifact;
pub mod cache;
pub mod config;
pub mod documents;
pub mod error;
pub mod locking;
pub mod message;
pub mod save;
pub mod service;
pub mod session;
pub mod shares;
pub mod steps;
pub mod store;
pub mod types;

// Re-exports
pub use artifact::{
    Artifact, ArtifactStore, FsArtifact, FsArtifactStore, MemoryArtifact, MemoryArtifactStore,
};
pub use cache::{save_lock_key, version_key, DistributedCache, MemoryCache, NullCache, VersionCache};
pub use config::{SyncConfig, APP_NAME};
pub use documents::{DocumentManager, DocumentTable, SessionTable, StateSnapshots};
pub use error::{Result, SyncError};
pub use locking::{
    LockContext, LockCoordinator, LockInfo, LockProvider, LockType, MemoryLockProvider,
};
pub use message::{classify, split_batch, ClassifiedBatch, StepKind, StepMessage};
pub use save::{AutosaveRequest, SaveCoordinator};
pub use service::{DocumentService, DocumentServiceBuilder};
pub use session::{SessionGate, SessionValidator};
pub use shares::{MemoryShareProvider, Permissions, Share, ShareProvider};
pub use steps::{StepLog, StepStore, VersionLedger};
pub use store::{Store, StoreStats};
pub use types::*;
