//! Durable sorted-set stores backing the action log.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append / range_by_score  ┌──────────────────┐
//! │ ActionLog   │ ────────────────────────► │ SortedSetStore   │
//! │ (ordering)  │                           │ (capability)     │
//! └─────────────┘                           └────────┬─────────┘
//!                                                    │
//!                       ┌────────────────────────────┼─────────────────┐
//!                       ▼                            ▼                 ▼
//!                ┌─────────────┐            ┌──────────────┐   ┌──────────────┐
//!                │ MemoryStore │            │ RocksStore   │   │ RedisStore   │
//!                │ (BTreeSet)  │            │ (LZ4 values) │   │ (ZADD/ZRANGE)│
//!                └─────────────┘            └──────────────┘   └──────────────┘
//! ```
//!
//! The store only knows keys, scores and opaque string members. Ordering,
//! timestamp assignment and record encoding belong to [`crate::action_log`].

pub mod memory;
pub mod redis;
pub mod rocks;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisConfig, RedisStore};
pub use self::rocks::{RocksConfig, RocksStore};

/// A member together with the score it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub score: u64,
    pub member: String,
}

impl ScoredMember {
    pub fn new(score: u64, member: impl Into<String>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

/// Ascending stream of members produced by [`SortedSetStore::range_by_score`].
pub type MemberStream = BoxStream<'static, Result<ScoredMember, StoreError>>;

/// Sorted, score-queryable store.
///
/// Implementations handle their own internal concurrency; callers may share
/// one instance across any number of tasks.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Add `member` to the set at `key` with `score`.
    async fn append(&self, key: &str, member: &str, score: u64) -> Result<(), StoreError>;

    /// All members of `key` with a score strictly greater than `min_exclusive`,
    /// lowest score first.
    async fn range_by_score(&self, key: &str, min_exclusive: u64)
        -> Result<MemberStream, StoreError>;

    /// Highest score stored under `key`.
    async fn max_score(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Backend name for log lines.
    fn backend(&self) -> &'static str;
}

/// Which backend to open, with its connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
    Memory,
    RocksDb(RocksConfig),
    Redis(RedisConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

impl StoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::RocksDb(_) => "rocksdb",
            StoreConfig::Redis(_) => "redis",
        }
    }
}

/// Open the configured backend.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn SortedSetStore>, StoreError> {
    let store: Arc<dyn SortedSetStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::RocksDb(rocks) => Arc::new(RocksStore::open(rocks.clone())?),
        StoreConfig::Redis(redis) if redis.cluster => {
            Arc::new(RedisStore::connect_cluster(redis).await?)
        }
        StoreConfig::Redis(redis) => Arc::new(RedisStore::connect(redis).await?),
    };
    log::info!("Opened {} store", store.backend());
    Ok(store)
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unreachable or timed out; the operation may succeed if retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Backend rejected the operation.
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// A stored member could not be read back.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_default_is_memory() {
        assert_eq!(StoreConfig::default(), StoreConfig::Memory);
    }

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::Unavailable("timeout".into()).is_retryable());
        assert!(!StoreError::Database("WRONGTYPE".into()).is_retryable());
        assert!(StoreError::Corrupt("x".into()).to_string().contains("corrupt"));
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open(&StoreConfig::Memory).await.unwrap();
        assert_eq!(store.backend(), "memory");
        assert_eq!(store.max_score("k").await.unwrap(), None);
    }
}
