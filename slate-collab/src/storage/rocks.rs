//! RocksDB-backed persistent whiteboard store.
//!
//! Column families:
//! - `whiteboards`: Document content as JSON, LZ4 compressed
//! - `metadata`: Whiteboard record header (title, owner, version), bincode
//! - `members`: Member records, bincode
//! - `permissions`: Grant level keyed by `<whiteboard_id:16><member_id:16>`
//!
//! Content and metadata for a whiteboard are always written in one batch.
//! Content is stored as JSON rather than bincode because canvas objects
//! carry arbitrary client fields.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DocumentStore, Member, PermissionLevel, StoreError};
use crate::document::{Document, Whiteboard};

/// Column family names.
const CF_WHITEBOARDS: &str = "whiteboards";
const CF_METADATA: &str = "metadata";
const CF_MEMBERS: &str = "members";
const CF_PERMISSIONS: &str = "permissions";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_WHITEBOARDS, CF_METADATA, CF_MEMBERS, CF_PERMISSIONS];

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
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("slate_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
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

/// Whiteboard header stored next to the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardMetadata {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    /// Mirrors `Document::version` of the stored content
    pub version: u64,
    pub object_count: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl WhiteboardMetadata {
    fn new(id: Uuid, title: String, owner_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            id,
            title,
            owner_id,
            version: 0,
            object_count: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed whiteboard store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the version check and the batch write of `write_document`
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
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

        log::info!("Opened whiteboard store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_WHITEBOARDS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PERMISSIONS => {
                // Prefix-scanned by whiteboard id
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    // ─── Members ──────────────────────────────────────────────────────

    pub fn put_member(&self, member: &Member) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        self.db
            .put_cf_opt(&cf, member.id.as_bytes(), encode(member)?, &self.write_opts())?;
        Ok(())
    }

    pub fn load_member(&self, member_id: Uuid) -> Result<Option<Member>, StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        match self.db.get_cf(&cf, member_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Permissions ──────────────────────────────────────────────────

    pub fn put_permission(
        &self,
        whiteboard_id: Uuid,
        member_id: Uuid,
        level: PermissionLevel,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_PERMISSIONS)?;
        let key = Self::permission_key(whiteboard_id, member_id);
        self.db
            .put_cf_opt(&cf, key, encode(&level)?, &self.write_opts())?;
        Ok(())
    }

    pub fn load_permission(
        &self,
        whiteboard_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<PermissionLevel>, StoreError> {
        let cf = self.cf(CF_PERMISSIONS)?;
        let key = Self::permission_key(whiteboard_id, member_id);
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Whiteboards ──────────────────────────────────────────────────

    /// Create an empty whiteboard.
    pub fn create_whiteboard(
        &self,
        title: impl Into<String>,
        owner_id: Uuid,
    ) -> Result<Whiteboard, StoreError> {
        let whiteboard = Whiteboard::new(Uuid::new_v4(), title, owner_id);
        let meta = WhiteboardMetadata::new(whiteboard.id, whiteboard.title.clone(), owner_id);

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))?;
        self.write_content(meta, &whiteboard.content)?;

        log::info!("Created whiteboard {} for owner {owner_id}", whiteboard.id);
        Ok(whiteboard)
    }

    pub fn load_metadata(&self, whiteboard_id: Uuid) -> Result<WhiteboardMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, whiteboard_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::WhiteboardNotFound(whiteboard_id)),
        }
    }

    pub fn load_whiteboard(&self, whiteboard_id: Uuid) -> Result<Whiteboard, StoreError> {
        let meta = self.load_metadata(whiteboard_id)?;
        let cf = self.cf(CF_WHITEBOARDS)?;
        let content = match self.db.get_cf(&cf, whiteboard_id.as_bytes())? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                serde_json::from_slice(&json)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?
            }
            None => Document::new(),
        };

        Ok(Whiteboard {
            id: meta.id,
            title: meta.title,
            owner_id: meta.owner_id,
            content,
        })
    }

    /// Version-checked content replacement.
    pub fn store_document(
        &self,
        whiteboard_id: Uuid,
        content: &Document,
        expected_version: u64,
    ) -> Result<WhiteboardMetadata, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))?;

        let meta = self.load_metadata(whiteboard_id)?;
        if meta.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found: meta.version,
            });
        }
        self.write_content(meta, content)
    }

    /// List all whiteboard headers.
    pub fn list_whiteboards(&self) -> Result<Vec<WhiteboardMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut whiteboards = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            whiteboards.push(decode(&value)?);
        }
        Ok(whiteboards)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Caller must hold `write_lock`.
    fn write_content(
        &self,
        mut meta: WhiteboardMetadata,
        content: &Document,
    ) -> Result<WhiteboardMetadata, StoreError> {
        let cf_boards = self.cf(CF_WHITEBOARDS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        meta.version = content.version;
        meta.object_count = content.objects.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let key = meta.id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_boards, &key, &compressed);
        batch.put_cf(&cf_meta, &key, encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(meta)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// whiteboard_id (16 bytes) + member_id (16 bytes).
    fn permission_key(whiteboard_id: Uuid, member_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(whiteboard_id.as_bytes());
        key.extend_from_slice(member_id.as_bytes());
        key
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get_member(&self, member_id: Uuid) -> Result<Option<Member>, StoreError> {
        self.load_member(member_id)
    }

    async fn get_document_owner(&self, whiteboard_id: Uuid) -> Result<Uuid, StoreError> {
        Ok(self.load_metadata(whiteboard_id)?.owner_id)
    }

    async fn get_permission(
        &self,
        whiteboard_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<PermissionLevel>, StoreError> {
        self.load_permission(whiteboard_id, member_id)
    }

    async fn read_document(&self, whiteboard_id: Uuid) -> Result<Whiteboard, StoreError> {
        self.load_whiteboard(whiteboard_id)
    }

    async fn write_document(
        &self,
        whiteboard_id: Uuid,
        content: Document,
        expected_version: u64,
    ) -> Result<Document, StoreError> {
        let meta = self.store_document(whiteboard_id, &content, expected_version)?;
        log::trace!(
            "Stored whiteboard {whiteboard_id} v{} ({} bytes)",
            meta.version,
            meta.compressed_size
        );
        Ok(content)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
