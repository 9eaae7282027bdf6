//! RocksDB-backed media store.
//!
//! Column families:
//! - `images`:   Image records (bincode + LZ4), keyed by upload sequence (8 bytes BE)
//! - `trails`:   Trail sample lists (bincode + LZ4), keyed by normalized file name
//! - `metadata`: Image id → sequence index, and the current-image pointer
//!
//! Keying images by upload sequence keeps listings in upload order without
//! a sort. The sequence is recovered from the last key on open.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    decode_value, encode_value, normalize_trail_name, ImageRecord, MediaStore, StoreError,
    TrailSample,
};

const CF_IMAGES: &str = "images";
const CF_TRAILS: &str = "trails";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_IMAGES, CF_TRAILS, CF_METADATA];

/// Metadata key holding the current image id.
const CURRENT_KEY: &[u8] = b"current";
/// Metadata key prefix for the image id → sequence index.
const INDEX_PREFIX: &[u8] = b"idx:";

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
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vitra_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Store at `path` with the default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksMediaStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next image sequence number.
    sequence: AtomicU64,
    /// Serializes read-modify-write operations (trail append, current pointer).
    write_lock: Mutex<()>,
}

impl RocksMediaStore {
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
        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Media store opened at {} (next image sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
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

        // Values are already LZ4-compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_IMAGES => {
                // Large values, scanned in key order for listings
                opts.set_max_write_buffer_number(2);
            }
            CF_TRAILS => {
                // Rewritten on every sample
                opts.set_max_write_buffer_number(4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_IMAGES) else {
            return 0;
        };
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    /// Force a flush of the memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn index_key(id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(INDEX_PREFIX.len() + 16);
        key.extend_from_slice(INDEX_PREFIX);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn sequence_of(&self, id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, Self::index_key(id))?)
    }

    fn current_id(&self) -> Result<Option<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, CURRENT_KEY)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    fn load_image(&self, seq_key: &[u8], current: Option<Uuid>) -> Result<Option<ImageRecord>, StoreError> {
        let cf = self.cf(CF_IMAGES)?;
        let Some(bytes) = self.db.get_cf(&cf, seq_key)? else {
            return Ok(None);
        };
        let mut image: ImageRecord = decode_value(&bytes)?;
        image.is_current = current == Some(image.id);
        Ok(Some(image))
    }
}

impl MediaStore for RocksMediaStore {
    fn insert_image(&self, mut image: ImageRecord) -> Result<ImageRecord, StoreError> {
        image.is_current = false;
        let cf_images = self.cf(CF_IMAGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.sequence_of(image.id)? {
            batch.delete_cf(&cf_images, &previous);
        }
        let seq_key = self.sequence.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        batch.put_cf(&cf_images, seq_key, encode_value(&image)?);
        batch.put_cf(&cf_meta, Self::index_key(image.id), seq_key);
        self.write(batch)?;

        log::debug!("Stored image {} ({} bytes)", image.id, image.data.len());
        Ok(image)
    }

    fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let cf = self.cf(CF_IMAGES)?;
        let current = self.current_id()?;
        let mut images = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let mut image: ImageRecord = decode_value(&value)?;
            image.is_current = current == Some(image.id);
            images.push(image);
        }
        Ok(images)
    }

    fn delete_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let cf_images = self.cf(CF_IMAGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock()?;
        let Some(seq_key) = self.sequence_of(id)? else {
            return Ok(None);
        };
        let current = self.current_id()?;
        let image = self.load_image(&seq_key, current)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_images, &seq_key);
        batch.delete_cf(&cf_meta, Self::index_key(id));
        if current == Some(id) {
            batch.delete_cf(&cf_meta, CURRENT_KEY);
        }
        self.write(batch)?;
        Ok(image)
    }

    fn set_current_image(&self, id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let Some(seq_key) = self.sequence_of(id)? else {
            // An unknown id still clears the pointer.
            batch.delete_cf(&cf_meta, CURRENT_KEY);
            self.write(batch)?;
            return Ok(None);
        };
        batch.put_cf(&cf_meta, CURRENT_KEY, id.as_bytes());
        self.write(batch)?;
        self.load_image(&seq_key, Some(id))
    }

    fn current_image(&self) -> Result<Option<ImageRecord>, StoreError> {
        let Some(id) = self.current_id()? else {
            return Ok(None);
        };
        match self.sequence_of(id)? {
            Some(seq_key) => self.load_image(&seq_key, Some(id)),
            None => Ok(None),
        }
    }

    fn append_trail(&self, file_name: &str, sample: TrailSample) -> Result<usize, StoreError> {
        let key = normalize_trail_name(file_name);
        if key.is_empty() {
            return Err(StoreError::InvalidTrailName(file_name.to_string()));
        }
        let cf = self.cf(CF_TRAILS)?;

        let _guard = self.lock()?;
        let mut trail: Vec<TrailSample> = match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => decode_value(&bytes)?,
            None => Vec::new(),
        };
        trail.push(sample);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, key.as_bytes(), encode_value(&trail)?);
        self.write(batch)?;
        Ok(trail.len())
    }

    fn trail(&self, file_name: &str) -> Result<Vec<TrailSample>, StoreError> {
        let cf = self.cf(CF_TRAILS)?;
        let key = normalize_trail_name(file_name);
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => decode_value(&bytes),
            None => Ok(Vec::new()),
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
