//! RocksDB-backed document store for the sync server.
//!
//! Column families:
//! - `documents`: Full workshop documents (JSON, LZ4 compressed), keyed by path
//! - `metadata`: Version and size bookkeeping (bincode), keyed by path
//!
//! Every save rewrites the whole document; history is not kept.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use workshop_core::WorkshopDocument;

use super::StoreError;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, a workshop writes rarely)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("workshop_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

/// Bookkeeping stored alongside each document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub path: String,
    /// Bumped on every save
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub document_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DocumentMetadata {
    fn new(path: &str) -> Self {
        let now = now_secs();
        Self {
            path: path.to_string(),
            version: 0,
            document_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Overwrite the document at `path` and bump its version.
    pub fn save_document(
        &self,
        path: &str,
        doc: &WorkshopDocument,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json =
            serde_json::to_vec(doc).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = match self.load_metadata(path) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(path),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.document_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, path.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, path.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_document(&self, path: &str) -> Result<WorkshopDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, path.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    pub fn document_exists(&self, path: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, path.as_bytes())?.is_some())
    }

    pub fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, path.as_bytes());
        batch.delete_cf(&cf_meta, path.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, path: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, path.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    /// Paths of all stored documents, in key order.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut paths = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let path = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            paths.push(path);
        }
        Ok(paths)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}
