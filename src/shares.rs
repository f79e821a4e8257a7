//! Share links and their permissions.
//!
//! Guests reach a document through a share token. Which permissions a share
//! grants is decided elsewhere; the engine only asks.

use crate::error::{Result, SyncError};
use crate::types::DocumentId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Permission bits granted by a share.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Permissions(pub u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1);
    pub const UPDATE: Permissions = Permissions(2);
    pub const ALL: Permissions = Permissions(1 | 2);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// A share link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Share {
    pub token: String,

    /// Shared artifact. For folder shares, the artifacts below it.
    pub artifacts: Vec<DocumentId>,

    pub permissions: Permissions,
}

impl Share {
    pub fn covers(&self, artifact: DocumentId) -> bool {
        self.artifacts.contains(&artifact)
    }
}

/// Resolves share tokens.
pub trait ShareProvider: Send + Sync {
    fn share_by_token(&self, token: &str) -> Option<Share>;

    /// Passes when the share exists and grants `permission`.
    fn check_share_access(&self, token: &str, permission: Permissions) -> Result<()> {
        let share = self
            .share_by_token(token)
            .ok_or_else(|| SyncError::NotFound(format!("share {}", token)))?;
        if !share.permissions.contains(permission) {
            return Err(SyncError::NotFound(format!(
                "share {} lacks permission {:?}",
                token, permission
            )));
        }
        Ok(())
    }
}

/// In-memory share table.
#[derive(Default)]
pub struct MemoryShareProvider {
    shares: RwLock<HashMap<String, Share>>,
}

impl MemoryShareProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, share: Share) {
        self.shares.write().insert(share.token.clone(), share);
    }

    pub fn remove(&self, token: &str) -> Option<Share> {
        self.shares.write().remove(token)
    }
}

impl ShareProvider for MemoryShareProvider {
    fn share_by_token(&self, token: &str) -> Option<Share> {
        self.shares.read().get(token).cloned()
    }
}
