//! Append-only, timestamp-ordered log of draw and clear events.
//!
//! Every append goes through the commit lock, which covers timestamp
//! assignment, the store write and the publish hook. Commit order is
//! therefore the single global order: timestamps are strictly increasing,
//! `since` never sees a later timestamp before an earlier one, and anything
//! the hook does (the broadcast fan-out) happens in commit order too.
//!
//! Clears are stored in the action set like draws, and additionally indexed
//! under a second key so [`ActionLog::open`] can find the latest one without
//! scanning history.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::metrics::MetricsObserver;
use crate::protocol::{ClearEvent, DrawAction, Point, SessionId, Timestamp, EPOCH_ZERO};
use crate::storage::{SortedSetStore, StoreError};

/// Store deadline used by [`ActionLog::open`].
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogRecord {
    Draw(DrawAction),
    Clear(ClearEvent),
}

impl LogRecord {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            LogRecord::Draw(action) => action.timestamp,
            LogRecord::Clear(clear) => clear.timestamp,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            LogRecord::Draw(action) => &action.session_id,
            LogRecord::Clear(clear) => &clear.session_id,
        }
    }

    fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(member: &str) -> Result<Self, StoreError> {
        serde_json::from_str(member).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

/// An event waiting for its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEvent {
    Draw {
        points: Vec<Point>,
        session_id: SessionId,
    },
    Clear {
        session_id: SessionId,
    },
}

impl PendingEvent {
    fn commit(self, timestamp: Timestamp) -> LogRecord {
        match self {
            PendingEvent::Draw { points, session_id } => LogRecord::Draw(DrawAction {
                points,
                timestamp,
                session_id,
            }),
            PendingEvent::Clear { session_id } => LogRecord::Clear(ClearEvent {
                timestamp,
                session_id,
            }),
        }
    }
}

/// Ascending stream of decoded records.
pub type RecordStream = BoxStream<'static, Result<LogRecord, StoreError>>;

/// Canvas state handed to a syncing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Draws after the watermark with `timestamp >= last_clear`, oldest first.
    pub actions: Vec<DrawAction>,
    pub last_clear: Timestamp,
    /// The store failed mid-replay and `actions` was emptied.
    pub degraded: bool,
}

impl Replay {
    /// Highest timestamp this replay covers, if any.
    pub fn high_water(&self) -> Timestamp {
        self.actions
            .last()
            .map_or(self.last_clear, |a| a.timestamp.max(self.last_clear))
    }
}

/// Folds a record stream into canvas state.
struct ReplayCollector {
    actions: Vec<DrawAction>,
    last_clear: Timestamp,
    cursor: Timestamp,
}

impl ReplayCollector {
    fn new(watermark: Timestamp, last_clear: Timestamp) -> Self {
        Self {
            actions: Vec::new(),
            last_clear,
            cursor: watermark,
        }
    }

    fn push(&mut self, record: LogRecord) {
        self.cursor = self.cursor.max(record.timestamp());
        match record {
            LogRecord::Draw(action) => self.actions.push(action),
            LogRecord::Clear(clear) => {
                self.actions.clear();
                self.last_clear = self.last_clear.max(clear.timestamp);
            }
        }
    }

    async fn drain(&mut self, mut stream: RecordStream) -> Result<(), StoreError> {
        while let Some(record) = stream.next().await {
            self.push(record?);
        }
        Ok(())
    }

    fn finish(mut self, latest_clear: Timestamp) -> Replay {
        let last_clear = self.last_clear.max(latest_clear);
        self.actions.retain(|a| a.timestamp >= last_clear);
        Replay {
            actions: self.actions,
            last_clear,
            degraded: false,
        }
    }
}

/// Strictly increasing timestamp, tracking the wall clock when it moves
/// forward.
fn next_timestamp(last: Timestamp, now: Timestamp) -> Timestamp {
    now.max(last.saturating_add(1))
}

/// Run one store operation, turning a missed deadline into
/// [`StoreError::Unavailable`].
async fn within<F, T>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, op)
        .await
        .unwrap_or_else(|_| Err(StoreError::Unavailable(format!("timed out after {limit:?}"))))
}

fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as Timestamp)
        .unwrap_or(EPOCH_ZERO)
}

/// The authoritative history.
pub struct ActionLog {
    store: Arc<dyn SortedSetStore>,
    actions_key: String,
    clears_key: String,
    /// Last assigned timestamp (including failed writes).
    commit: Mutex<Timestamp>,
    head: AtomicU64,
    latest_clear: AtomicU64,
    metrics: Arc<dyn MetricsObserver>,
    /// Deadline for every store call, including draining a read stream.
    store_timeout: Duration,
}

impl ActionLog {
    /// Open the log over `store`, resuming timestamps and the latest clear
    /// from what is already persisted.
    pub async fn open(
        store: Arc<dyn SortedSetStore>,
        key_prefix: &str,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Result<Self, StoreError> {
        Self::open_with_timeout(store, key_prefix, metrics, DEFAULT_STORE_TIMEOUT).await
    }

    /// Like [`ActionLog::open`], bounding every store call by `store_timeout`.
    pub async fn open_with_timeout(
        store: Arc<dyn SortedSetStore>,
        key_prefix: &str,
        metrics: Arc<dyn MetricsObserver>,
        store_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let actions_key = format!("{key_prefix}:actions");
        let clears_key = format!("{key_prefix}:clears");

        let head = within(store_timeout, store.max_score(&actions_key))
            .await?
            .unwrap_or(EPOCH_ZERO);
        let indexed_clear = within(store_timeout, store.max_score(&clears_key))
            .await?
            .unwrap_or(EPOCH_ZERO);

        let action_log = Self {
            store,
            actions_key,
            clears_key,
            commit: Mutex::new(head),
            head: AtomicU64::new(head),
            latest_clear: AtomicU64::new(indexed_clear),
            metrics,
            store_timeout,
        };

        // Clears committed after the index write was lost still live in the
        // action set.
        let records = action_log.since(indexed_clear).await?;
        let unindexed = within(store_timeout, async {
            let mut records = records;
            let mut latest = indexed_clear;
            while let Some(record) = records.next().await {
                if let LogRecord::Clear(clear) = record? {
                    latest = latest.max(clear.timestamp);
                }
            }
            Ok(latest)
        })
        .await?;
        action_log.latest_clear.fetch_max(unindexed, Ordering::AcqRel);

        log::info!(
            "Action log opened on {} store (head={}, latest_clear={})",
            action_log.store.backend(),
            head,
            action_log.latest_clear()
        );
        Ok(action_log)
    }

    /// Commit `event` and return its timestamp.
    pub async fn append(&self, event: PendingEvent) -> Result<Timestamp, StoreError> {
        self.append_and_publish(event, LogRecord::timestamp).await
    }

    /// Commit `event`, then run `hook` with the committed record while the
    /// commit lock is still held. `hook` must not block.
    ///
    /// On a store failure the hook is not called. The assigned timestamp is
    /// consumed either way.
    pub async fn append_and_publish<F, T>(
        &self,
        event: PendingEvent,
        hook: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce(&LogRecord) -> T,
    {
        let mut last = self.commit.lock().await;
        let timestamp = next_timestamp(*last, now_micros());
        *last = timestamp;

        let record = event.commit(timestamp);
        let member = record.encode()?;

        self.timed(self.store.append(&self.actions_key, &member, timestamp))
            .await
            .map_err(|e| {
                log::error!("Append of {} at {} failed: {}", kind(&record), timestamp, e);
                e
            })?;

        if let LogRecord::Clear(_) = record {
            // The action set already holds the clear; `open` recovers it from
            // there if the index write is lost.
            let indexed = self
                .timed(self.store.append(&self.clears_key, &timestamp.to_string(), timestamp))
                .await;
            if let Err(e) = indexed {
                log::warn!("Clear index write at {} failed: {}", timestamp, e);
            }
            self.latest_clear.fetch_max(timestamp, Ordering::AcqRel);
        }
        self.head.fetch_max(timestamp, Ordering::AcqRel);

        log::trace!("Committed {} at {}", kind(&record), timestamp);
        Ok(hook(&record))
    }

    /// Every record with a timestamp strictly greater than `after`, oldest
    /// first. Records that fail to decode are skipped.
    pub async fn since(&self, after: Timestamp) -> Result<RecordStream, StoreError> {
        let members = self
            .timed(self.store.range_by_score(&self.actions_key, after))
            .await?;
        let records = members.filter_map(|item| async move {
            match item {
                Ok(scored) => match LogRecord::decode(&scored.member) {
                    Ok(record) => Some(Ok(record)),
                    Err(e) => {
                        log::warn!("Skipping record at {}: {}", scored.score, e);
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            }
        });
        Ok(records.boxed())
    }

    /// Timestamp of the most recent clear, or [`EPOCH_ZERO`].
    pub fn latest_clear(&self) -> Timestamp {
        self.latest_clear.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent committed event, or [`EPOCH_ZERO`].
    pub fn head(&self) -> Timestamp {
        self.head.load(Ordering::Acquire)
    }

    /// Build the canvas state after `watermark`, then call `activate` with it
    /// under the commit lock so no event can commit between the replay and
    /// whatever `activate` does.
    ///
    /// Store failures degrade to an empty replay.
    pub async fn replay<F, T>(&self, watermark: Timestamp, activate: F) -> (Replay, T)
    where
        F: FnOnce(&Replay) -> T,
    {
        let mut collector = ReplayCollector::new(watermark, self.latest_clear());

        // Bulk read outside the lock; appends keep flowing.
        let bulk = match self.since(watermark).await {
            Ok(stream) => within(self.store_timeout, collector.drain(stream)).await,
            Err(e) => Err(e),
        };

        // Every store call made under the lock is bounded, so this wait is
        // too.
        let _commit = self.commit.lock().await;
        let caught_up = match bulk {
            Ok(()) => match self.since(collector.cursor).await {
                Ok(stream) => within(self.store_timeout, collector.drain(stream)).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let replay = match caught_up {
            Ok(()) => collector.finish(self.latest_clear()),
            Err(e) => {
                log::warn!("Replay after {} degraded to empty: {}", watermark, e);
                Replay {
                    actions: Vec::new(),
                    last_clear: self.latest_clear(),
                    degraded: true,
                }
            }
        };
        let activated = activate(&replay);
        (replay, activated)
    }

    async fn timed<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = within(self.store_timeout, op).await;
        self.metrics.store_round_trip(started.elapsed());
        result
    }
}

fn kind(record: &LogRecord) -> &'static str {
    match record {
        LogRecord::Draw(_) => "draw",
        LogRecord::Clear(_) => "clear",
    }
}
