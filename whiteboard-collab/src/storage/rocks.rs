//! RocksDB-backed sorted-set store.
//!
//! Column families:
//! - `members`: one row per member, keyed `<set key>\0<score big-endian>`,
//!   value LZ4-compressed
//!
//! Big-endian scores make RocksDB's bytewise key order equal to score order,
//! so a range query is a single forward iterator seek. A score holds one
//! member per set; the action log never reuses a score.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use tokio::sync::mpsc;

use super::{MemberStream, ScoredMember, SortedSetStore, StoreError};

const CF_MEMBERS: &str = "members";

/// Rows buffered between the blocking iterator and the async consumer.
const RANGE_CHANNEL_DEPTH: usize = 256;

type Db = DBWithThreadMode<SingleThreaded>;

/// RocksDB configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: true, so an acknowledged stroke survives a crash)
    pub sync_writes: bool,
    /// Max open files (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("whiteboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Database(format!("storage task failed: {e}"))
    }
}

/// RocksDB sorted-set store. All database calls run on tokio's blocking pool.
pub struct RocksStore {
    db: Arc<Db>,
    config: RocksConfig,
}

impl RocksStore {
    /// Open (or create) the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf = ColumnFamilyDescriptor::new(CF_MEMBERS, Self::cf_options(&config));
        let db = Db::open_cf_descriptors(&db_opts, &config.path, vec![cf])?;

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(4);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Row key: `<set key>\0<score big-endian>`.
    fn member_key(key: &str, score: u64) -> Vec<u8> {
        let mut row = Self::key_prefix(key);
        row.extend_from_slice(&score.to_be_bytes());
        row
    }

    fn key_prefix(key: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(key.len() + 9);
        prefix.extend_from_slice(key.as_bytes());
        prefix.push(0);
        prefix
    }

    /// Split a row key back into its score, if it belongs to `prefix`.
    fn score_of(prefix: &[u8], row: &[u8]) -> Option<u64> {
        let rest = row.strip_prefix(prefix)?;
        let bytes: [u8; 8] = rest.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn decode_member(value: &[u8]) -> Result<String, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn cf(db: &Db) -> Result<&rocksdb::ColumnFamily, StoreError> {
        db.cf_handle(CF_MEMBERS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_MEMBERS}' not found")))
    }

    /// Forward scan feeding `tx`; stops early when the receiver goes away.
    fn scan_into(
        db: &Db,
        key: &str,
        min_exclusive: u64,
        tx: &mpsc::Sender<Result<ScoredMember, StoreError>>,
    ) -> Result<(), StoreError> {
        let Some(start_score) = min_exclusive.checked_add(1) else {
            return Ok(());
        };
        let cf = Self::cf(db)?;
        let prefix = Self::key_prefix(key);
        let start = Self::member_key(key, start_score);

        let iter = db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (row, value) = item?;
            let Some(score) = Self::score_of(&prefix, &row) else {
                break;
            };
            let member = Self::decode_member(&value).map(|m| ScoredMember::new(score, m));
            if tx.blocking_send(member).is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SortedSetStore for RocksStore {
    async fn append(&self, key: &str, member: &str, score: u64) -> Result<(), StoreError> {
        let db = self.db.clone();
        let row = Self::member_key(key, score);
        let value = lz4_flex::compress_prepend_size(member.as_bytes());
        let sync = self.config.sync_writes;

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let cf = Self::cf(&db)?;
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(sync);
            db.put_cf_opt(cf, row, value, &write_opts)?;
            Ok(())
        })
        .await?
    }

    async fn range_by_score(
        &self,
        key: &str,
        min_exclusive: u64,
    ) -> Result<MemberStream, StoreError> {
        let db = self.db.clone();
        let key = key.to_string();
        let (tx, rx) = mpsc::channel(RANGE_CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            let scanned = Self::scan_into(&db, &key, min_exclusive, &tx);
            // Release the database before the consumer sees end-of-stream.
            drop(db);
            if let Err(e) = scanned {
                let _ = tx.blocking_send(Err(e));
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn max_score(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let db = self.db.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<u64>, StoreError> {
            let cf = Self::cf(&db)?;
            let prefix = Self::key_prefix(&key);
            let end = Self::member_key(&key, u64::MAX);
            let mut iter = db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
            match iter.next() {
                Some(item) => {
                    let (row, _) = item?;
                    Ok(Self::score_of(&prefix, &row))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    async fn collect(store: &RocksStore, key: &str, min: u64) -> Vec<ScoredMember> {
        store
            .range_by_score(key, min)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.backend(), "rocksdb");
    }

    #[tokio::test]
    async fn test_append_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

        for score in [3u64, 1, 2, 300, 256] {
            store
                .append("wb:actions", &format!("m{score}"), score)
                .await
                .unwrap();
        }

        let scores: Vec<u64> = collect(&store, "wb:actions", 0)
            .await
            .iter()
            .map(|m| m.score)
            .collect();
        assert_eq!(scores, vec![1, 2, 3, 256, 300]);

        let after = collect(&store, "wb:actions", 3).await;
        assert_eq!(after[0], ScoredMember::new(256, "m256"));
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_prefix_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

        // "wb" is a byte prefix of "wb2"; the NUL separator keeps them apart.
        store.append("wb", "a", 1).await.unwrap();
        store.append("wb2", "b", 2).await.unwrap();

        assert_eq!(collect(&store, "wb", 0).await, vec![ScoredMember::new(1, "a")]);
        assert_eq!(collect(&store, "wb2", 0).await, vec![ScoredMember::new(2, "b")]);
        assert_eq!(store.max_score("wb").await.unwrap(), Some(1));
        assert_eq!(store.max_score("none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_max_score_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = RocksConfig::for_testing(dir.path().join("db"));

        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.append("k", "first", 10).await.unwrap();
            store.append("k", "second", 20).await.unwrap();
        }

        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.max_score("k").await.unwrap(), Some(20));
        assert_eq!(collect(&store, "k", 0).await.len(), 2);
    }

    #[tokio::test]
    async fn test_large_member_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

        let member = "[1,2,5,\"black\"],".repeat(10_000);
        store.append("k", &member, 1).await.unwrap();

        let loaded = collect(&store, "k", 0).await;
        assert_eq!(loaded[0].member, member);
    }

    #[test]
    fn test_score_of_rejects_foreign_rows() {
        let prefix = RocksStore::key_prefix("a");
        assert_eq!(
            RocksStore::score_of(&prefix, &RocksStore::member_key("a", 7)),
            Some(7)
        );
        assert_eq!(
            RocksStore::score_of(&prefix, &RocksStore::member_key("b", 7)),
            None
        );
    }

    #[test]
    fn test_rocks_config_default() {
        let config = RocksConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
        assert!(!RocksConfig::for_testing("x").sync_writes);
    }
}
