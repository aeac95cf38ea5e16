//! # whiteboard-collab: collaborative whiteboard broadcast server
//!
//! Many drawing clients share one canvas. Every stroke is committed to an
//! ordered action log, fanned out to the other connected peers, and replayed
//! to late joiners; a clear resets the canvas for everyone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  JSON lines / WS text  ┌───────────────────┐
//! │ Client      │ ◄────────────────────► │ ConnectionHandler │ ×N
//! └─────────────┘                        └─────────┬─────────┘
//!                                                  │
//!                        ┌─────────────────────────┼──────────────────┐
//!                        ▼                         ▼                  ▼
//!                ┌───────────────┐        ┌────────────────┐  ┌──────────────┐
//!                │ SessionRegistry│◄──────│ BroadcastBus   │  │ ActionLog    │
//!                │ (DashMap)     │        │ (encode once)  │◄─│ (commit lock)│
//!                └───────────────┘        └────────────────┘  └──────┬───────┘
//!                                                                    │
//!                                                          ┌─────────┴────────┐
//!                                                          │ SortedSetStore   │
//!                                                          │ memory/rocks/redis│
//!                                                          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (closed serde-tagged enums)
//! - [`action_log`]: Timestamp assignment, ordered history, replay
//! - [`registry`]: Session lifecycle and outbound queues
//! - [`broadcast`]: Fan-out with per-recipient failure isolation
//! - [`connection`]: Per-connection protocol loop
//! - [`server`]: Listeners, connection supervision, graceful shutdown
//! - [`transport`]: Newline-delimited TCP and WebSocket framing
//! - [`storage`]: Durable sorted-set stores (memory, RocksDB, Redis)
//! - [`config`]: `ServerConfig` and environment loading
//! - [`metrics`]: Fire-and-forget metrics observer

pub mod action_log;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use action_log::{ActionLog, LogRecord, PendingEvent, Replay};
pub use broadcast::{BroadcastBus, BroadcastStats, PublishReport};
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionError, ConnectionHandler};
pub use metrics::{MetricsObserver, MetricsSnapshot, NoopMetrics, PrometheusMetrics};
pub use protocol::{
    ClearEvent, ClientMessage, DrawAction, Point, ProtocolError, ServerMessage, SessionId,
    Timestamp, EPOCH_ZERO,
};
pub use registry::{SessionEntry, SessionRegistry, SessionState, StateError};
pub use server::{BoundServer, ServerContext, ServerError, WhiteboardServer};
pub use storage::{
    MemoryStore, RedisConfig, RedisStore, RocksConfig, RocksStore, SortedSetStore, StoreConfig,
    StoreError,
};
pub use transport::TransportError;
