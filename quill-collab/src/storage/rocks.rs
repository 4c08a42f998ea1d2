//! RocksDB-backed durable update log.
//!
//! Column families:
//! - `updates` — LZ4-compressed records, keyed by scope prefix + record id
//! - `meta`    — per-scope counters (next id, latest snapshot id)
//!
//! Key layout for `updates`:
//! ```text
//! ┌──────────────┬────┬─────────────┬────┬──────────────────┐
//! │ document_id  │ \0 │ file_path   │ \0 │ id (8 bytes BE)  │
//! └──────────────┴────┴─────────────┴────┴──────────────────┘
//! ```
//! Big-endian ids make a forward prefix scan return records in ascending
//! id order, which is the bootstrap replay order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::log::{unix_now, PersistenceError, UpdateLog, UpdateRecord};
use async_trait::async_trait;

/// Column family names.
const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_META];

/// Log store configuration.
#[derive(Debug, Clone)]
pub struct RocksLogConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — OS-buffered writes)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksLogConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Stored value for one record (compressed with LZ4 on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    update: String,
    is_snapshot: bool,
    created_at: u64,
}

/// Per-scope counters kept in the `meta` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeMeta {
    next_id: u64,
    last_snapshot: Option<u64>,
}

impl ScopeMeta {
    fn new() -> Self {
        Self {
            next_id: 1,
            last_snapshot: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// RocksDB-backed update log.
///
/// Append order per scope survives restarts: the per-scope meta record is
/// written atomically with every append, so ids stay monotonic across
/// reopen.
pub struct RocksLog {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksLogConfig,
    /// Serializes meta read-modify-write cycles so concurrent appends
    /// cannot hand out the same id.
    write_lock: std::sync::Mutex<()>,
}

impl RocksLog {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: RocksLogConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(available_parallelism());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            write_lock: std::sync::Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &RocksLogConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values carry their own LZ4 framing.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Many small sequential writes, prefix-scanned on bootstrap.
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                // Tiny values, read on every append.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("missing column family {name}")))
    }

    /// Scope prefix shared by all keys of one `(document, file)` pair.
    fn scope_prefix(document_id: &str, file_path: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(document_id.len() + file_path.len() + 2);
        prefix.extend_from_slice(document_id.as_bytes());
        prefix.push(0);
        prefix.extend_from_slice(file_path.as_bytes());
        prefix.push(0);
        prefix
    }

    fn record_key(prefix: &[u8], id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn record_id(prefix: &[u8], key: &[u8]) -> Option<u64> {
        if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[prefix.len()..]);
        Some(u64::from_be_bytes(buf))
    }

    fn load_meta(&self, prefix: &[u8]) -> Result<Option<ScopeMeta>, PersistenceError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, prefix)? {
            Some(bytes) => Ok(Some(ScopeMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

#[async_trait]
impl UpdateLog for RocksLog {
    async fn append(
        &self,
        document_id: &str,
        file_path: &str,
        update: &str,
        is_snapshot: bool,
    ) -> Result<u64, PersistenceError> {
        let prefix = Self::scope_prefix(document_id, file_path);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PersistenceError::Database("log write lock poisoned".into()))?;
        let mut meta = self.load_meta(&prefix)?.unwrap_or_else(ScopeMeta::new);

        let id = meta.next_id;
        meta.next_id += 1;
        if is_snapshot {
            meta.last_snapshot = Some(id);
        }

        let record = StoredRecord {
            update: update.to_string(),
            is_snapshot,
            created_at: unix_now(),
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        // Atomic batch: record + meta move together.
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, Self::record_key(&prefix, id), &compressed);
        batch.put_cf(&cf_meta, &prefix, &meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(id)
    }

    async fn load_since(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<Vec<UpdateRecord>, PersistenceError> {
        let prefix = Self::scope_prefix(document_id, file_path);
        let meta = match self.load_meta(&prefix)? {
            Some(meta) => meta,
            None => return Ok(Vec::new()),
        };
        let start_id = meta.last_snapshot.unwrap_or(1);
        let start_key = Self::record_key(&prefix, start_id);

        let cf = self.cf(CF_UPDATES)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| PersistenceError::Database(e.to_string()))?;
            let id = match Self::record_id(&prefix, &key) {
                Some(id) => id,
                None => break, // Past this scope's key range.
            };

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| PersistenceError::Compression(e.to_string()))?;
            let (stored, _): (StoredRecord, _) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

            records.push(UpdateRecord {
                id,
                update: stored.update,
                is_snapshot: stored.is_snapshot,
                created_at: stored.created_at,
            });
        }

        Ok(records)
    }

    async fn compact(
        &self,
        document_id: &str,
        file_path: &str,
    ) -> Result<u64, PersistenceError> {
        let prefix = Self::scope_prefix(document_id, file_path);
        let snapshot_id = match self.load_meta(&prefix)?.and_then(|m| m.last_snapshot) {
            Some(id) => id,
            None => return Ok(0),
        };

        let cf = self.cf(CF_UPDATES)?;
        let start_key = Self::record_key(&prefix, 1);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for item in iter {
            let (key, _) = item.map_err(|e| PersistenceError::Database(e.to_string()))?;
            let id = match Self::record_id(&prefix, &key) {
                Some(id) => id,
                None => break,
            };
            if id >= snapshot_id {
                break;
            }
            batch.delete_cf(&cf, &key);
            removed += 1;
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }

        Ok(removed)
    }
}

fn available_parallelism() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> RocksLog {
        RocksLog::open(RocksLogConfig::for_testing(dir.path())).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        let a = log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        let b = log.append("doc1", "main.tex", "Yg==", false).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].update, "YQ==");
        assert_eq!(records[1].update, "Yg==");
        assert!(records.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_load_since_empty_scope() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        assert!(log.load_since("doc1", "main.tex").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_since_starts_at_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yg==", true).await.unwrap();
        log.append("doc1", "main.tex", "Yw==", false).await.unwrap();

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        let updates: Vec<&str> = records.iter().map(|r| r.update.as_str()).collect();
        assert_eq!(updates, vec!["Yg==", "Yw=="]);
        assert!(records[0].is_snapshot);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "refs.bib", "Yg==", false).await.unwrap();
        log.append("doc2", "main.tex", "Yw==", false).await.unwrap();

        let main = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].update, "YQ==");

        let bib = log.load_since("doc1", "refs.bib").await.unwrap();
        assert_eq!(bib.len(), 1);
        assert_eq!(bib[0].update, "Yg==");
    }

    #[tokio::test]
    async fn test_ids_monotonic_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(&dir);
            assert_eq!(log.append("doc1", "main.tex", "YQ==", false).await.unwrap(), 1);
            assert_eq!(log.append("doc1", "main.tex", "Yg==", false).await.unwrap(), 2);
        }
        // Reopen: the next id continues where the previous process stopped.
        let log = open_log(&dir);
        assert_eq!(log.append("doc1", "main.tex", "Yw==", false).await.unwrap(), 3);

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn test_compact_removes_pre_snapshot_records() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yg==", false).await.unwrap();
        log.append("doc1", "main.tex", "Yw==", true).await.unwrap();
        log.append("doc1", "main.tex", "ZA==", false).await.unwrap();

        let removed = log.compact("doc1", "main.tex").await.unwrap();
        assert_eq!(removed, 2);

        // Replay is unchanged: snapshot + tail.
        let records = log.load_since("doc1", "main.tex").await.unwrap();
        let updates: Vec<&str> = records.iter().map(|r| r.update.as_str()).collect();
        assert_eq!(updates, vec!["Yw==", "ZA=="]);
    }

    #[tokio::test]
    async fn test_compact_without_snapshot_is_noop() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.append("doc1", "main.tex", "YQ==", false).await.unwrap();
        assert_eq!(log.compact("doc1", "main.tex").await.unwrap(), 0);
        assert_eq!(log.load_since("doc1", "main.tex").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_large_update_payload() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        // 256KB of compressible text survives the LZ4 round trip.
        let update = "Zm9v".repeat(64 * 1024);
        log.append("doc1", "main.tex", &update, false).await.unwrap();

        let records = log.load_since("doc1", "main.tex").await.unwrap();
        assert_eq!(records[0].update, update);
    }
}
