//! Step payload classification.
//!
//! Clients submit each step as a base64-encoded binary message. Only the
//! leading header is inspected here: a variable-length unsigned integer for
//! the message type and, for sync messages, a second one for the sync
//! subtype. The remainder is opaque to the server.
//!
//! A sync step 1 carries no content delta; it asks the server for the full
//! history and is classified as a query. Every other well-formed message is
//! an update and gets persisted. Of the stored messages only sync updates
//! are replayed to clients; step 2 replies and awareness state are stale by
//! the time another client reads them.

use crate::error::{Result, SyncError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Message type for document sync messages.
pub const MESSAGE_SYNC: u64 = 0;

/// Message type for awareness (cursor/presence) messages.
pub const MESSAGE_AWARENESS: u64 = 1;

/// Sync subtype: state vector announcement, requests missing history.
pub const SYNC_STEP1: u64 = 0;

/// Sync subtype: reply to step 1 with the missing state.
pub const SYNC_STEP2: u64 = 1;

/// Sync subtype: incremental content delta.
pub const SYNC_UPDATE: u64 = 2;

/// Longest header integer accepted (a u64 needs at most 10 bytes).
const MAX_VARUINT_LEN: usize = 10;

/// How the ledger treats a submitted step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Synchronization request without content.
    Query,
    /// Content delta or initial state; must be persisted.
    Update,
}

/// Decoded header of a client step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepMessage {
    message_type: u64,
    sync_type: Option<u64>,
    body_offset: usize,
    bytes: Vec<u8>,
}

impl StepMessage {
    /// Decode a base64 step.
    pub fn from_base64(step: &str) -> Result<Self> {
        let bytes = STANDARD.decode(step.trim())?;
        Self::decode(bytes)
    }

    /// Decode the header of raw message bytes.
    pub fn decode(bytes: Vec<u8>) -> Result<Self> {
        let (message_type, mut offset) = read_varuint(&bytes, 0)?;
        let sync_type = if message_type == MESSAGE_SYNC {
            let (sync_type, next) = read_varuint(&bytes, offset)?;
            offset = next;
            Some(sync_type)
        } else {
            None
        };

        Ok(Self {
            message_type,
            sync_type,
            body_offset: offset,
            bytes,
        })
    }

    /// Build a sync message with the given subtype and body.
    pub fn sync(sync_type: u64, body: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(body.len() + 2);
        write_varuint(&mut bytes, MESSAGE_SYNC);
        write_varuint(&mut bytes, sync_type);
        let body_offset = bytes.len();
        bytes.extend_from_slice(body);
        Self {
            message_type: MESSAGE_SYNC,
            sync_type: Some(sync_type),
            body_offset,
            bytes,
        }
    }

    /// A sync step 1 carrying the client's state vector.
    pub fn query(state_vector: &[u8]) -> Self {
        Self::sync(SYNC_STEP1, state_vector)
    }

    /// A sync update carrying a content delta.
    pub fn update(delta: &[u8]) -> Self {
        Self::sync(SYNC_UPDATE, delta)
    }

    pub fn message_type(&self) -> u64 {
        self.message_type
    }

    pub fn sync_type(&self) -> Option<u64> {
        self.sync_type
    }

    /// Bytes following the header.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.body_offset..]
    }

    pub fn kind(&self) -> StepKind {
        if self.message_type == MESSAGE_SYNC && self.sync_type == Some(SYNC_STEP1) {
            StepKind::Query
        } else {
            StepKind::Update
        }
    }

    /// Incremental content delta, the only message replayed to clients.
    pub fn is_sync_update(&self) -> bool {
        self.message_type == MESSAGE_SYNC && self.sync_type == Some(SYNC_UPDATE)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

/// Classify a single base64 step.
pub fn classify(step: &str) -> Result<StepKind> {
    Ok(StepMessage::from_base64(step)?.kind())
}

/// A submitted batch split by kind, each half in submission order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassifiedBatch {
    pub queries: Vec<String>,
    pub updates: Vec<String>,
}

impl ClassifiedBatch {
    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }
}

/// Split a batch into query and update steps.
///
/// Fails on the first malformed step; nothing is dropped silently.
pub fn split_batch(steps: &[String]) -> Result<ClassifiedBatch> {
    let mut batch = ClassifiedBatch::default();
    for step in steps {
        match classify(step)? {
            StepKind::Query => batch.queries.push(step.clone()),
            StepKind::Update => batch.updates.push(step.clone()),
        }
    }
    Ok(batch)
}

fn read_varuint(bytes: &[u8], mut offset: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for _ in 0..MAX_VARUINT_LEN {
        let byte = *bytes.get(offset).ok_or_else(|| {
            SyncError::MalformedStep(format!("header truncated at byte {}", offset))
        })?;
        offset += 1;

        value |= u64::from(byte & 0x7f)
            .checked_shl(shift)
            .ok_or_else(|| SyncError::MalformedStep("header integer overflow".into()))?;
        if byte & 0x80 == 0 {
            return Ok((value, offset));
        }
        shift += 7;
    }

    Err(SyncError::MalformedStep("header integer too long".into()))
}

fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
