//! Session validation at the request boundary.

use crate::documents::DocumentTable;
use crate::error::{Result, SyncError};
use crate::types::{Document, DocumentId, Session, SessionId};
use std::sync::Arc;

/// Validates the `(document, session, token)` triple a client presents.
pub trait SessionValidator: Send + Sync {
    fn validate(&self, document: DocumentId, session: SessionId, token: &str) -> Option<Session>;
}

/// Resolves the session and document of a request, or rejects it.
///
/// Both an invalid session and a missing document yield `InvalidSession`,
/// which the boundary turns into an access-denied response.
pub struct SessionGate {
    validator: Arc<dyn SessionValidator>,
    documents: Arc<DocumentTable>,
}

impl SessionGate {
    pub fn new(validator: Arc<dyn SessionValidator>, documents: Arc<DocumentTable>) -> Self {
        Self {
            validator,
            documents,
        }
    }

    pub fn require_document_session(
        &self,
        document: DocumentId,
        session: SessionId,
        token: &str,
    ) -> Result<(Session, Document)> {
        let invalid = || SyncError::InvalidSession { document, session };

        let valid = self
            .validator
            .validate(document, session, token)
            .ok_or_else(invalid)?;
        let doc = self.documents.get(document).ok_or_else(invalid)?;
        Ok((valid, doc))
    }
}
