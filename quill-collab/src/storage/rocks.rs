//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — current head per document (version, LZ4 compressed text
//!   and replica state)
//! - `versions`  — append-only history, keyed by `<id len:2><id><version:8 BE>`
//!
//! Records are bincode encoded. A save writes head and history in one
//! `WriteBatch`, so a crash never leaves a version without its head.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{check_lineage, now_secs, DocumentStore, StoreError, StoredDocument, VersionRecord};
use crate::protocol::DocumentId;
use crate::replica::{ReplicaId, ReplicaState};

const CF_DOCUMENTS: &str = "documents";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_VERSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config at `path` with the remaining fields defaulted.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Value stored in `documents`.
#[derive(Debug, Serialize, Deserialize)]
struct HeadRecord {
    version: u64,
    /// LZ4 compressed UTF-8 text
    content: Vec<u8>,
    /// LZ4 compressed bincode [`ReplicaState`]
    state: Vec<u8>,
}

impl HeadRecord {
    fn new(version: u64, content: &str, state: &ReplicaState) -> Result<Self, StoreError> {
        Ok(Self {
            version,
            content: compress(content),
            state: lz4_flex::compress_prepend_size(&encode(state)?),
        })
    }

    fn replica_state(&self) -> Result<ReplicaState, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.state)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        decode(&raw)
    }

    fn document(&self) -> Result<StoredDocument, StoreError> {
        Ok(StoredDocument {
            content: decompress(&self.content)?,
            version: self.version,
            state: self.replica_state()?,
        })
    }
}

/// Value stored in `versions`.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryRecord {
    created_at: u64,
    /// LZ4 compressed UTF-8 text
    content: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn compress(text: &str) -> Vec<u8> {
    lz4_flex::compress_prepend_size(text.as_bytes())
}

fn decompress(bytes: &[u8]) -> Result<String, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    String::from_utf8(raw).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of heads so versions stay gapless
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config, write_lock: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 compressed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-heavy, prefix-scanned by document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Sync helpers ────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_head(&self, document_id: &DocumentId) -> Result<Option<HeadRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_id.as_str().as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn put_head(&self, batch: &mut WriteBatch, document_id: &DocumentId, head: &HeadRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        batch.put_cf(cf, document_id.as_str().as_bytes(), encode(head)?);
        Ok(())
    }

    fn get_or_create_sync(&self, document_id: &DocumentId) -> Result<StoredDocument, StoreError> {
        if let Some(head) = self.load_head(document_id)? {
            return head.document();
        }

        let head = HeadRecord::new(0, "", &ReplicaState::default())?;
        let mut batch = WriteBatch::default();
        self.put_head(&mut batch, document_id, &head)?;
        self.db.write_opt(batch, &self.write_options())?;
        log::debug!("Created document {document_id}");
        Ok(StoredDocument::default())
    }

    fn save_sync(
        &self,
        document_id: &DocumentId,
        content: &str,
        state: &ReplicaState,
    ) -> Result<u64, StoreError> {
        let latest = match self.load_head(document_id)? {
            Some(head) => {
                check_lineage(document_id, &head.replica_state()?, state)?;
                head.version
            }
            None => 0,
        };
        let version = latest + 1;

        let head = HeadRecord::new(version, content, state)?;
        let history = HistoryRecord { created_at: now_secs(), content: head.content.clone() };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_VERSIONS)?, version_key(document_id, version)?, encode(&history)?);
        self.put_head(&mut batch, document_id, &head)?;
        self.db.write_opt(batch, &self.write_options())?;

        log::trace!("Saved {document_id} v{version} ({} bytes)", content.len());
        Ok(version)
    }

    fn rollback_sync(
        &self,
        document_id: &DocumentId,
        version: u64,
        seed: ReplicaId,
    ) -> Result<StoredDocument, StoreError> {
        let not_found = || StoreError::VersionNotFound {
            document_id: document_id.clone(),
            version,
        };

        let cf = self.cf(CF_VERSIONS)?;
        let bytes = self
            .db
            .get_cf(cf, version_key(document_id, version)?)?
            .ok_or_else(not_found)?;
        let history: HistoryRecord = decode(&bytes)?;
        let content = decompress(&history.content)?;

        let (latest, lineage) = match self.load_head(document_id)? {
            Some(head) => (head.version, head.replica_state()?.lineage),
            None => (version, Default::default()),
        };
        let state = ReplicaState::loaded(lineage.next(seed));
        let head = HeadRecord::new(latest, &content, &state)?;
        let mut batch = WriteBatch::default();
        self.put_head(&mut batch, document_id, &head)?;
        self.db.write_opt(batch, &self.write_options())?;

        Ok(StoredDocument { content, version: latest, state })
    }

    fn versions_sync(&self, document_id: &DocumentId) -> Result<Vec<VersionRecord>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let prefix = version_prefix(document_id)?;

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let version = key_version(&key[prefix.len()..])?;
            let history: HistoryRecord = decode(&value)?;
            records.push(VersionRecord {
                document_id: document_id.clone(),
                version,
                content: decompress(&history.content)?,
                created_at: history.created_at,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get_or_create(&self, document_id: &DocumentId) -> Result<StoredDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.get_or_create_sync(document_id)
    }

    async fn save(
        &self,
        document_id: &DocumentId,
        content: &str,
        state: &ReplicaState,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.save_sync(document_id, content, state)
    }

    async fn rollback(
        &self,
        document_id: &DocumentId,
        version: u64,
        seed: ReplicaId,
    ) -> Result<StoredDocument, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.rollback_sync(document_id, version, seed)
    }

    async fn versions(&self, document_id: &DocumentId) -> Result<Vec<VersionRecord>, StoreError> {
        self.versions_sync(document_id)
    }
}

/// `<id len:2 BE><id bytes>`; the length prefix keeps one id from being a
/// prefix of another's keys.
fn version_prefix(document_id: &DocumentId) -> Result<Vec<u8>, StoreError> {
    let id = document_id.as_str().as_bytes();
    let len = u16::try_from(id.len())
        .map_err(|_| StoreError::InvalidKey(format!("document id too long ({} bytes)", id.len())))?;
    let mut key = Vec::with_capacity(2 + id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(id);
    Ok(key)
}

fn version_key(document_id: &DocumentId, version: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = version_prefix(document_id)?;
    key.extend_from_slice(&version.to_be_bytes());
    Ok(key)
}

fn key_version(suffix: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = suffix
        .try_into()
        .map_err(|_| StoreError::InvalidKey(format!("version suffix of {} bytes", suffix.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
