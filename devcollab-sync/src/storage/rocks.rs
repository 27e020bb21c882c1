//! RocksDB-backed durable store for pending writes.
//!
//! Column families:
//! - `pending`     — queued writes, keyed `<kind:1><id:8 BE>` (FIFO per kind)
//! - `dead_letter` — writes that exhausted their delivery attempts, plus
//!   pending records that no longer decode
//! - `meta`        — queue sequence high-water mark
//!
//! Every mutation goes through a `WriteBatch`, so moving a record between
//! column families and bumping the sequence are atomic.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, Write-Ahead Logs)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::record::{decode_record, encode_record, parse_key, record_key, recover_records};
use super::{DurableStore, EntityKind, PendingWrite, StoreError};

const CF_PENDING: &str = "pending";
const CF_DEAD_LETTER: &str = "dead_letter";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_PENDING, CF_DEAD_LETTER, CF_META];

const SEQUENCE_KEY: &[u8] = b"sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every batch (default: true — an appended write must survive power loss)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 128)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("devcollab_queue"),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 128,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small cache, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// RocksDB-backed [`DurableStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded CF mode — concurrency via the queue's locks)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self { db, config };
        log::info!(
            "Opened write queue store at {} ({} pending, last sequence {:?})",
            store.path().display(),
            store.pending_total()?,
            store.last_sequence()?,
        );
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_PENDING | CF_DEAD_LETTER => {
                // Payloads are already LZ4-compressed per record
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of pending writes across all kinds.
    pub fn pending_total(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Raw `(key, record)` pairs of one kind from a column family, in key order.
    fn scan_kind(&self, cf_name: &str, kind: EntityKind) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start = record_key(kind, 0);
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.first() != Some(&kind.tag()) {
                break;
            }
            records.push((key.to_vec(), value.to_vec()));
        }
        Ok(records)
    }

    /// Sequence bump is written only when it moves forward.
    fn put_sequence(&self, batch: &mut WriteBatch, id: u64) -> Result<(), StoreError> {
        if self.last_sequence()?.is_some_and(|last| last >= id) {
            return Ok(());
        }
        let cf_meta = self.cf(CF_META)?;
        batch.put_cf(&cf_meta, SEQUENCE_KEY, id.to_be_bytes());
        Ok(())
    }
}

impl DurableStore for RocksStore {
    fn append(&self, write: &PendingWrite) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_pending, write.key(), encode_record(write)?);
        self.put_sequence(&mut batch, write.id)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn update(&self, write: &PendingWrite) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        if self.db.get_cf(&cf_pending, write.key())?.is_none() {
            return Err(StoreError::NotFound {
                kind: write.entity_kind,
                id: write.id,
            });
        }
        self.db
            .put_cf_opt(&cf_pending, write.key(), encode_record(write)?, &self.write_options())?;
        Ok(())
    }

    fn remove(&self, kind: EntityKind, id: u64) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        self.db
            .delete_cf_opt(&cf_pending, record_key(kind, id), &self.write_options())?;
        Ok(())
    }

    /// Unreadable records are moved, bytes intact, into `dead_letter` the
    /// first time a scan meets them.
    fn pending(&self, kind: EntityKind) -> Result<Vec<PendingWrite>, StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_dead = self.cf(CF_DEAD_LETTER)?;
        let mut writes = Vec::new();
        let mut batch = WriteBatch::default();

        for (key, bytes) in self.scan_kind(CF_PENDING, kind)? {
            match decode_record(&bytes) {
                Ok(write) => writes.push(write),
                Err(e) => {
                    let id = parse_key(&key).map_or(0, |(_, id)| id);
                    log::error!("Unreadable {kind} write #{id} moved to dead letter: {e}");
                    batch.delete_cf(&cf_pending, &key);
                    batch.put_cf(&cf_dead, &key, &bytes);
                }
            }
        }

        if !batch.is_empty() {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(writes)
    }

    fn quarantine(&self, write: &PendingWrite) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_dead = self.cf(CF_DEAD_LETTER)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_pending, write.key());
        batch.put_cf(&cf_dead, write.key(), encode_record(write)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<PendingWrite>, StoreError> {
        let mut all = Vec::new();
        for kind in EntityKind::ALL {
            let records: Vec<Vec<u8>> = self
                .scan_kind(CF_DEAD_LETTER, kind)?
                .into_iter()
                .map(|(_, bytes)| bytes)
                .collect();
            let (writes, corrupted) = recover_records(&records);
            if corrupted > 0 {
                log::warn!("{corrupted} corrupted {kind} record(s) skipped in dead-letter set");
            }
            all.extend(writes);
        }
        Ok(all)
    }

    fn remove_dead_letter(&self, kind: EntityKind, id: u64) -> Result<Option<PendingWrite>, StoreError> {
        let cf_dead = self.cf(CF_DEAD_LETTER)?;
        let key = record_key(kind, id);
        let Some(bytes) = self.db.get_cf(&cf_dead, key)? else {
            return Ok(None);
        };
        let write = decode_record(&bytes)?;
        self.db.delete_cf_opt(&cf_dead, key, &self.write_options())?;
        Ok(Some(write))
    }

    fn requeue(&self, dead: &PendingWrite, fresh: &PendingWrite) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_dead = self.cf(CF_DEAD_LETTER)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_dead, dead.key());
        batch.put_cf(&cf_pending, fresh.key(), encode_record(fresh)?);
        self.put_sequence(&mut batch, fresh.id)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn last_sequence(&self) -> Result<Option<u64>, StoreError> {
        let cf_meta = self.cf(CF_META)?;
        match self.db.get_cf(&cf_meta, SEQUENCE_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            Some(_) => Err(StoreError::DeserializationError("Invalid sequence record".into())),
            None => Ok(None),
        }
    }
}
