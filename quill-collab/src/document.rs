//! Document store: the single source of truth for text state.
//!
//! Wraps a [`yrs::Doc`] with one text root. All mutation flows through CRDT
//! updates, so applying the same update twice, or applying concurrent
//! updates in any order, converges every replica to an identical state.
//!
//! Remote-origin applications tag the transaction so the local-update
//! observer can skip them — a remote update must never be re-captured and
//! re-broadcast, or two providers would feed each other forever.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Name of the shared text root holding the document body.
pub const TEXT_ROOT: &str = "content";

/// Transaction origin tag for remotely-received updates.
const REMOTE_ORIGIN: &str = "remote";

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by this replica's own editor.
    Local,
    /// Received from a peer or replayed from the persistence log.
    Remote,
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// Update bytes failed to decode — rejected, nothing was applied.
    MalformedUpdate(String),
    /// A decoded update failed to merge.
    ApplyFailed(String),
    /// Observer registration failed.
    Observer(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            Self::ApplyFailed(e) => write!(f, "Update apply failed: {e}"),
            Self::Observer(e) => write!(f, "Observer error: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// In-memory CRDT document.
///
/// Exactly one sync provider should own a given store; multiple editor
/// views in one process share the same store to avoid divergent local
/// buffers.
pub struct DocumentStore {
    doc: Doc,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Access the underlying document (editor bindings, tests).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn remote_origin() -> Origin {
        Origin::from(REMOTE_ORIGIN)
    }

    /// Merge a single update into local state.
    ///
    /// Safe for concurrent, out-of-order and duplicate updates. Malformed
    /// bytes are rejected before any mutation happens.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = match origin {
            UpdateOrigin::Remote => self.doc.transact_mut_with(Self::remote_origin()),
            UpdateOrigin::Local => self.doc.transact_mut(),
        };
        txn.apply_update(decoded)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    /// Apply a bootstrap batch inside one remote-origin transaction.
    ///
    /// Downstream "document changed" listeners fire once for the whole
    /// batch instead of once per historical record. All updates are decoded
    /// up front so a malformed record rejects the batch before mutation.
    pub fn apply_history(&self, updates: &[Vec<u8>]) -> Result<usize, DocumentError> {
        let mut decoded = Vec::with_capacity(updates.len());
        for bytes in updates {
            decoded.push(
                Update::decode_v1(bytes)
                    .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?,
            );
        }
        let applied = decoded.len();
        let mut txn = self.doc.transact_mut_with(Self::remote_origin());
        for update in decoded {
            txn.apply_update(update)
                .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        }
        Ok(applied)
    }

    /// Encode the entire current state as one self-contained update.
    ///
    /// An empty document still yields a valid (empty-content) snapshot.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact summary of what this replica has already seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal delta covering everything the given state vector is missing.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Syntactically merge buffered deltas into one combined update.
    ///
    /// Used by the debounce flush so a burst of keystroke-level updates
    /// becomes a single broadcast/append.
    pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, DocumentError> {
        if updates.len() == 1 {
            return Ok(updates[0].clone());
        }
        let mut decoded = Vec::with_capacity(updates.len());
        for bytes in updates {
            decoded.push(
                Update::decode_v1(bytes)
                    .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?,
            );
        }
        Ok(Update::merge_updates(decoded).encode_v1())
    }

    /// Observe deltas produced by local transactions.
    ///
    /// The callback fires with the captured update bytes for every
    /// non-remote transaction; remote-origin merges are filtered out here
    /// so they can never loop back onto the wire.
    pub fn observe_local_updates<F>(&self, callback: F) -> Result<yrs::Subscription, DocumentError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let remote = Self::remote_origin();
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                callback(&event.update);
            })
            .map_err(|e| DocumentError::Observer(e.to_string()))
    }

    // ─── Text editing (editor bindings and tests) ─────────────────────

    /// Insert a chunk at a character index.
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.insert(&mut txn, index, chunk);
    }

    /// Remove `len` characters starting at `index`.
    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.remove_range(&mut txn, index, len);
    }

    /// Current document body.
    pub fn text_content(&self) -> String {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.get_string(&txn)
    }

    /// Character length of the document body.
    pub fn len(&self) -> u32 {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}
