//! Update log contract and the in-memory reference implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

/// One persisted update.
///
/// `id` is monotonically increasing per `(document_id, file_path)`.
/// `update` is the text encoding produced by the update codec, identical
/// to the bytes that were broadcast for the same interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: u64,
    pub update: String,
    pub is_snapshot: bool,
    /// Seconds since epoch.
    pub created_at: u64,
}

/// Persistence errors.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// Backend failure (I/O, store internals, poisoned state).
    Database(String),
    /// Record value failed to encode/decode.
    Serialization(String),
    /// Stored value failed to decompress.
    Compression(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Append-only store of update history per document scope.
///
/// Append order is strict per scope under the single-writer-per-provider
/// policy; the log itself does not arbitrate concurrent writers.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Durably store one record, returning its assigned id.
    async fn append(
        &self,
        document_id: &str,
        file_path: &str,
        update: &str,
        is_snapshot: bool,
    ) -> Result<u64, PersistenceError>;

    /// Records from the latest snapshot onward (or from the beginning if
    /// no snapshot exists), ascending by id.
    ///
    /// A read failure is an error — callers must not mistake it for an
    /// empty document, or the next write would clobber real history.
    async fn load_since(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<Vec<UpdateRecord>, PersistenceError>;

    /// Delete records preceding the latest snapshot. Returns the number
    /// of records removed (0 when no snapshot exists).
    async fn compact(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<u64, PersistenceError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

type Scope = (String, String);

/// In-memory update log.
///
/// Reference implementation and test double; same record and ordering
/// semantics as [`super::RocksLog`] without the I/O.
pub struct MemoryLog {
    scopes: Mutex<HashMap<Scope, Vec<UpdateRecord>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Total records currently stored for a scope (tests).
    pub fn record_count(&self, document_id: &str, file_path: &str) -> usize {
        self.scopes
            .lock()
            .ok()
            .and_then(|scopes| {
                scopes
                    .get(&(document_id.to_string(), file_path.to_string()))
                    .map(|records| records.len())
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateLog for MemoryLog {
    async fn append(
        &self,
        document_id: &str,
        file_path: &str,
        update: &str,
        is_snapshot: bool,
    ) -> Result<u64, PersistenceError> {
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|_| PersistenceError::Database("log state poisoned".into()))?;
        let records = scopes
            .entry((document_id.to_string(), file_path.to_string()))
            .or_default();
        let id = records.last().map(|r| r.id + 1).unwrap_or(1);
        records.push(UpdateRecord {
            id,
            update: update.to_string(),
            is_snapshot,
            created_at: unix_now(),
        });
        Ok(id)
    }

    async fn load_since(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<Vec<UpdateRecord>, PersistenceError> {
        let scopes = self
            .scopes
            .lock()
            .map_err(|_| PersistenceError::Database("log state poisoned".into()))?;
        let records = match scopes.get(&(document_id.to_string(), file_path.to_string())) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };
        let start = records
            .iter()
            .rposition(|r| r.is_snapshot)
            .unwrap_or(0);
        Ok(records[start..].to_vec())
    }

    async fn compact(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<u64, PersistenceError> {
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|_| PersistenceError::Database("log state poisoned".into()))?;
        let records = match scopes.get_mut(&(document_id.to_string(), file_path.to_string())) {
            Some(records) => records,
            None => return Ok(0),
        };
        match records.iter().rposition(|r| r.is_snapshot) {
            Some(snapshot_index) => {
                records.drain(..snapshot_index);
                Ok(snapshot_index as u64)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::document::{DocumentStore, UpdateOrigin};

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let log = MemoryLog::new();
        let a = log.append("doc1", "main.tex", "dQ==", false).await.unwrap();
        let b = log.append("doc1", "main.tex", "dg==", false).await.unwrap();
        let c = log.append("doc1", "main.tex", "dw==", false).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let log = MemoryLog::new();
        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "refs.bib", "Yg==", false).await.unwrap();
        log.append("doc2", "main.tex", "Yw==", false).await.unwrap();

        let main = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].update, "YQ==");
        assert_eq!(log.record_count("doc2", "main.tex"), 1);
    }

    #[tokio::test]
    async fn test_load_since_empty_scope() {
        let log = MemoryLog::new();
        assert!(log.load_since("doc1", "main.tex").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_since_starts_at_latest_snapshot() {
        let log = MemoryLog::new();
        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yg==", true).await.unwrap();
        log.append("doc1", "main.tex", "Yw==", false).await.unwrap();
        log.append("doc1", "main.tex", "ZA==", true).await.unwrap();
        log.append("doc1", "main.tex", "ZQ==", false).await.unwrap();

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        let updates: Vec<&str> = records.iter().map(|r| r.update.as_str()).collect();
        assert_eq!(updates, vec!["ZA==", "ZQ=="]);
        assert!(records[0].is_snapshot);
        // Ascending ids from the snapshot record.
        assert!(records.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_compact_drops_pre_snapshot_records() {
        let log = MemoryLog::new();
        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yg==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yw==", true).await.unwrap();
        log.append("doc1", "main.tex", "ZA==", false).await.unwrap();

        let removed = log.compact("doc1", "main.tex").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(log.record_count("doc1", "main.tex"), 2);

        // No snapshot left behind the head: compacting again is a no-op.
        let records = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_snapshot);
    }

    #[tokio::test]
    async fn test_compact_without_snapshot_is_noop() {
        let log = MemoryLog::new();
        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        assert_eq!(log.compact("doc1", "main.tex").await.unwrap(), 0);
        assert_eq!(log.record_count("doc1", "main.tex"), 1);
    }

    /// Snapshot-replay equivalence: replaying [snapshot, tail...] equals
    /// replaying the full history from empty.
    #[tokio::test]
    async fn test_snapshot_replay_equivalence() {
        let log = MemoryLog::new();
        let source = DocumentStore::new();
        let mut full_history = Vec::new();

        // Three edits, snapshot after the second, then one more edit.
        for (i, chunk) in ["alpha ", "beta ", "gamma"].iter().enumerate() {
            let before = source.state_vector();
            source.insert(source.len(), chunk);
            let delta = source.diff_since(&before).unwrap();
            full_history.push(delta.clone());
            log.append("doc1", "main.tex", &codec::encode(&delta), false)
                .await
                .unwrap();
            if i == 1 {
                let snapshot = source.encode_state();
                log.append("doc1", "main.tex", &codec::encode(&snapshot), true)
                    .await
                    .unwrap();
            }
        }

        // Replay the full history from empty.
        let from_scratch = DocumentStore::new();
        from_scratch.apply_history(&full_history).unwrap();

        // Replay from the snapshot cut.
        let records = log.load_since("doc1", "main.tex").await.unwrap();
        assert!(records[0].is_snapshot);
        let tail: Vec<Vec<u8>> = records
            .iter()
            .map(|r| codec::decode(&r.update).unwrap())
            .collect();
        let from_snapshot = DocumentStore::new();
        from_snapshot.apply_history(&tail).unwrap();

        assert_eq!(from_scratch.text_content(), "alpha beta gamma");
        assert_eq!(from_snapshot.text_content(), from_scratch.text_content());
    }

    #[tokio::test]
    async fn test_record_applies_to_document() {
        let log = MemoryLog::new();
        let source = DocumentStore::new();
        source.insert(0, "persisted");
        log.append(
            "doc1",
            "main.tex",
            &codec::encode(&source.encode_state()),
            true,
        )
        .await
        .unwrap();

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        let doc = DocumentStore::new();
        doc.apply_update(
            &codec::decode(&records[0].update).unwrap(),
            UpdateOrigin::Remote,
        )
        .unwrap();
        assert_eq!(doc.text_content(), "persisted");
    }
}
