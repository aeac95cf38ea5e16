//! Redis sorted-set store (single node or cluster).
//!
//! Commands used:
//! - `ZADD key score member` for appends
//! - `ZRANGEBYSCORE key (min +inf WITHSCORES LIMIT 0 page` for paged range
//!   reads; each page resumes after the last score seen, so pages stay
//!   correct while appends continue
//! - `ZREVRANGE key 0 0 WITHSCORES` for the head score
//!
//! Scores are microsecond timestamps, well under 2^53, so they round-trip
//! through Redis doubles exactly.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};

use super::{MemberStream, ScoredMember, SortedSetStore, StoreError};

/// Redis connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    /// `(host, port)` of every known node; a single entry for standalone Redis
    pub nodes: Vec<(String, u16)>,
    /// Connect in cluster mode
    pub cluster: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Members fetched per `ZRANGEBYSCORE` page
    pub page_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            nodes: vec![("127.0.0.1".to_string(), 6379)],
            cluster: false,
            username: None,
            password: None,
            page_size: 512,
        }
    }
}

impl RedisConfig {
    fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.nodes
            .iter()
            .map(|(host, port)| ConnectionInfo {
                addr: ConnectionAddr::Tcp(host.clone(), *port),
                redis: RedisConnectionInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                    ..RedisConnectionInfo::default()
                },
            })
            .collect()
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() || e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Database(e.to_string())
        }
    }
}

/// Sorted-set store over any async Redis connection.
///
/// `C` is cloned per operation; both `ConnectionManager` and
/// `ClusterConnection` multiplex clones over shared sockets and reconnect on
/// their own.
pub struct RedisStore<C> {
    conn: C,
    page_size: usize,
}

impl RedisStore<ConnectionManager> {
    /// Connect to a standalone node (the first configured one).
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let info = config
            .connection_infos()
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Unavailable("no redis nodes configured".into()))?;
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        log::info!("Connected to redis at {:?}", config.nodes[0]);
        Ok(Self::with_connection(conn, config.page_size))
    }
}

impl RedisStore<ClusterConnection> {
    /// Connect to a Redis cluster through its startup nodes.
    pub async fn connect_cluster(config: &RedisConfig) -> Result<Self, StoreError> {
        let mut builder = ClusterClient::builder(config.connection_infos());
        if let Some(username) = &config.username {
            builder = builder.username(username.clone());
        }
        if let Some(password) = &config.password {
            builder = builder.password(password.clone());
        }
        let client = builder.build()?;
        let conn = client.get_async_connection().await?;
        log::info!("Connected to redis cluster ({} startup nodes)", config.nodes.len());
        Ok(Self::with_connection(conn, config.page_size))
    }
}

impl<C> RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn with_connection(conn: C, page_size: usize) -> Self {
        Self {
            conn,
            page_size: page_size.max(1),
        }
    }

    async fn fetch_page(
        conn: &mut C,
        key: &str,
        after: u64,
        page_size: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format!("({after}"))
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(page_size)
            .query_async(conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| ScoredMember::new(score as u64, member))
            .collect())
    }
}

/// Paging state for [`RedisStore::range_by_score`].
struct PageCursor<C> {
    conn: C,
    key: String,
    after: u64,
    page_size: usize,
    buffered: std::vec::IntoIter<ScoredMember>,
    exhausted: bool,
}

#[async_trait]
impl<C> SortedSetStore for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn append(&self, key: &str, member: &str, score: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn range_by_score(
        &self,
        key: &str,
        min_exclusive: u64,
    ) -> Result<MemberStream, StoreError> {
        let mut cursor = PageCursor {
            conn: self.conn.clone(),
            key: key.to_string(),
            after: min_exclusive,
            page_size: self.page_size,
            buffered: Vec::new().into_iter(),
            exhausted: false,
        };

        // Fetch the first page eagerly so connection failures surface here.
        let first = Self::fetch_page(&mut cursor.conn, &cursor.key, cursor.after, cursor.page_size)
            .await?;
        cursor.exhausted = first.len() < cursor.page_size;
        cursor.buffered = first.into_iter();

        let stream = stream::unfold(Some(cursor), |state| async move {
            let mut cursor = state?;
            loop {
                if let Some(next) = cursor.buffered.next() {
                    cursor.after = next.score;
                    return Some((Ok(next), Some(cursor)));
                }
                if cursor.exhausted {
                    return None;
                }
                match Self::fetch_page(&mut cursor.conn, &cursor.key, cursor.after, cursor.page_size)
                    .await
                {
                    Ok(page) => {
                        cursor.exhausted = page.len() < cursor.page_size;
                        cursor.buffered = page.into_iter();
                    }
                    // Yield the error once, then end the stream.
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn max_score(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(rows.first().map(|(_, score)| *score as u64))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.nodes, vec![("127.0.0.1".to_string(), 6379)]);
        assert!(!config.cluster);
        assert_eq!(config.page_size, 512);
    }

    #[test]
    fn test_connection_infos_carry_credentials() {
        let config = RedisConfig {
            nodes: vec![("redis-a".into(), 7000), ("redis-b".into(), 7001)],
            cluster: true,
            username: Some("board".into()),
            password: Some("secret".into()),
            page_size: 64,
        };
        let infos = config.connection_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].addr, ConnectionAddr::Tcp("redis-b".into(), 7001));
        assert_eq!(infos[0].redis.username.as_deref(), Some("board"));
        assert_eq!(infos[0].redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: StoreError = RedisError::from(io).into();
        assert!(err.is_retryable());

        let err: StoreError =
            RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE")).into();
        assert!(!err.is_retryable());
    }
}
