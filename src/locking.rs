//! Advisory artifact locks and the read-only verdict.
//!
//! Locks here are cooperative markers kept by a lock provider, not kernel
//! file locks. The engine takes an app-scoped lock, owned by
//! [`SyncConfig::app_name`](crate::SyncConfig), while it writes an artifact.
//! Any other lock on the artifact makes it read-only for editing sessions.
//!
//! Deployments without lock support use a provider that reports itself
//! unavailable; every lock operation then succeeds without doing anything.

use crate::artifact::{Artifact, ArtifactStore};
use crate::error::{Result, SyncError};
use crate::shares::{Permissions, ShareProvider};
use crate::types::{DocumentId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Who a lock is held for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Held by a user.
    User,
    /// Held by an application on behalf of its users.
    App,
    /// Held by a token (e.g. an external editor).
    Token,
}

/// Lock request for an artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockContext {
    pub artifact: DocumentId,
    pub lock_type: LockType,
    pub owner: String,
}

impl LockContext {
    pub fn new(artifact: DocumentId, lock_type: LockType, owner: impl Into<String>) -> Self {
        Self {
            artifact,
            lock_type,
            owner: owner.into(),
        }
    }
}

/// An existing lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub artifact: DocumentId,
    pub lock_type: LockType,
    pub owner: String,
    pub created: Timestamp,
}

impl LockInfo {
    pub fn matches(&self, context: &LockContext) -> bool {
        self.artifact == context.artifact
            && self.lock_type == context.lock_type
            && self.owner == context.owner
    }
}

/// Cross-process advisory lock provider.
pub trait LockProvider: Send + Sync {
    fn is_available(&self) -> bool;

    /// Take a lock. Locking again with the same context is a no-op; a lock held
    /// by anyone else fails with `OwnerLocked`.
    fn lock(&self, context: &LockContext) -> Result<LockInfo>;

    /// Release a lock held with the same context.
    fn unlock(&self, context: &LockContext) -> Result<()>;

    fn get_locks(&self, artifact: DocumentId) -> Result<Vec<LockInfo>>;
}

/// In-process lock table.
pub struct MemoryLockProvider {
    available: bool,
    locks: Mutex<HashMap<DocumentId, LockInfo>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self {
            available: true,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Provider for environments without lock support.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LockProvider for MemoryLockProvider {
    fn is_available(&self) -> bool {
        self.available
    }

    fn lock(&self, context: &LockContext) -> Result<LockInfo> {
        if !self.available {
            return Err(SyncError::NoLockProvider);
        }

        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&context.artifact) {
            if existing.matches(context) {
                return Ok(existing.clone());
            }
            return Err(SyncError::OwnerLocked {
                artifact: context.artifact,
                owner: existing.owner.clone(),
            });
        }

        let info = LockInfo {
            artifact: context.artifact,
            lock_type: context.lock_type,
            owner: context.owner.clone(),
            created: Timestamp::now(),
        };
        locks.insert(context.artifact, info.clone());
        Ok(info)
    }

    fn unlock(&self, context: &LockContext) -> Result<()> {
        if !self.available {
            return Err(SyncError::NoLockProvider);
        }

        let mut locks = self.locks.lock();
        match locks.get(&context.artifact) {
            Some(existing) if existing.matches(context) => {
                locks.remove(&context.artifact);
                Ok(())
            }
            Some(existing) => Err(SyncError::PreconditionNotMet(format!(
                "artifact {} is locked by {}",
                context.artifact, existing.owner
            ))),
            None => Err(SyncError::PreconditionNotMet(format!(
                "artifact {} is not locked",
                context.artifact
            ))),
        }
    }

    fn get_locks(&self, artifact: DocumentId) -> Result<Vec<LockInfo>> {
        if !self.available {
            return Err(SyncError::NoLockProvider);
        }
        Ok(self.locks.lock().get(&artifact).cloned().into_iter().collect())
    }
}

/// Releases a scoped lock on drop.
struct ScopedLock<'a> {
    provider: &'a dyn LockProvider,
    context: LockContext,
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.unlock(&self.context) {
            warn!(
                artifact = %self.context.artifact,
                error = %e,
                "Failed to release scoped artifact lock"
            );
        }
    }
}

/// App-scoped locking and read-only decisions for artifacts.
pub struct LockCoordinator {
    provider: Arc<dyn LockProvider>,
    artifacts: Arc<dyn ArtifactStore>,
    shares: Arc<dyn ShareProvider>,
    app_name: String,
}

impl LockCoordinator {
    pub fn new(
        provider: Arc<dyn LockProvider>,
        artifacts: Arc<dyn ArtifactStore>,
        shares: Arc<dyn ShareProvider>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            artifacts,
            shares,
            app_name: app_name.into(),
        }
    }

    /// Lock context for this engine's own lock on an artifact.
    pub fn app_context(&self, artifact: DocumentId) -> LockContext {
        LockContext::new(artifact, LockType::App, self.app_name.clone())
    }

    fn is_own_lock(&self, info: &LockInfo) -> bool {
        info.lock_type == LockType::App && info.owner == self.app_name
    }

    /// Whether editing sessions must treat the artifact as read-only.
    ///
    /// With a share token only the share's update permission counts; without
    /// one the artifact's own writability does. A lock held by anyone but
    /// this engine forces read-only.
    pub fn is_read_only(&self, artifact: &dyn Artifact, share_token: Option<&str>) -> bool {
        let read_only = match share_token {
            Some(token) if !token.is_empty() => self
                .shares
                .check_share_access(token, Permissions::UPDATE)
                .is_err(),
            _ => !artifact.is_writable(),
        };

        match self.lock_info(artifact) {
            Some(info) if self.is_own_lock(&info) => read_only,
            Some(_) => true,
            None => read_only,
        }
    }

    /// First lock on the artifact. Best effort: provider errors mean no lock.
    pub fn lock_info(&self, artifact: &dyn Artifact) -> Option<LockInfo> {
        match self.provider.get_locks(artifact.id()) {
            Ok(locks) => locks.into_iter().next(),
            Err(e) => {
                debug!(artifact = %artifact.id(), error = %e, "No lock information");
                None
            }
        }
    }

    /// Take the app lock. Returns `false` when someone else holds a lock.
    pub fn lock(&self, artifact_id: DocumentId) -> Result<bool> {
        if !self.provider.is_available() {
            return Ok(true);
        }

        let artifact = match self.artifacts.get(artifact_id) {
            Ok(artifact) => artifact,
            Err(SyncError::NotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };

        match self.provider.lock(&self.app_context(artifact.id())) {
            Ok(_) => Ok(true),
            Err(SyncError::OwnerLocked { owner, .. }) => {
                debug!(artifact = %artifact_id, owner = %owner, "Artifact locked by another owner");
                Ok(false)
            }
            Err(SyncError::NoLockProvider) | Err(SyncError::PreconditionNotMet(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Release the app lock. Missing locks and providers are ignored.
    pub fn unlock(&self, artifact_id: DocumentId) -> Result<()> {
        if !self.provider.is_available() {
            return Ok(());
        }

        let artifact = match self.artifacts.get(artifact_id) {
            Ok(artifact) => artifact,
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.provider.unlock(&self.app_context(artifact.id())) {
            Ok(()) | Err(SyncError::NoLockProvider) | Err(SyncError::PreconditionNotMet(_)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` while holding the app lock on `artifact`.
    ///
    /// A lock taken here is released on every exit path. If the app lock was
    /// already held it is left in place. A lock held by anyone else fails
    /// with `Locked` before `f` runs.
    pub fn run_in_scope<T>(
        &self,
        artifact: &dyn Artifact,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !self.provider.is_available() {
            return f();
        }

        let context = self.app_context(artifact.id());
        let existing = match self.provider.get_locks(artifact.id()) {
            Ok(locks) => locks,
            Err(SyncError::NoLockProvider) => return f(),
            Err(e) => return Err(e),
        };

        if existing.iter().any(|info| info.matches(&context)) {
            return f();
        }
        if !existing.is_empty() {
            return Err(SyncError::Locked(artifact.id()));
        }

        match self.provider.lock(&context) {
            Ok(_) => {}
            Err(SyncError::OwnerLocked { .. }) => return Err(SyncError::Locked(artifact.id())),
            Err(SyncError::NoLockProvider) => return f(),
            Err(e) => return Err(e),
        }

        let _scope = ScopedLock {
            provider: self.provider.as_ref(),
            context,
        };
        f()
    }
}
