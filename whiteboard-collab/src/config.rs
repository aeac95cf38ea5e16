//! Server configuration, from code or from `WHITEBOARD_*` environment
//! variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::storage::{RedisConfig, RocksConfig, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// TCP (newline-delimited JSON) listener address
    pub bind_addr: String,
    /// Optional WebSocket listener address
    pub ws_bind_addr: Option<String>,
    /// How long shutdown waits for connections before aborting them
    pub shutdown_grace: Duration,
    /// How long to wait for the optional `connect` frame
    pub handshake_timeout: Duration,
    /// Largest accepted inbound frame, in bytes
    pub max_frame_len: usize,
    /// Consecutive malformed frames tolerated before closing
    pub max_malformed_frames: u32,
    /// Outbound queue depth per session
    pub outbound_capacity: usize,
    /// Upper bound on a single store call; expiry counts as unavailable
    pub store_timeout: Duration,
    /// Prometheus scrape endpoint, served by the binary
    pub metrics_bind_addr: Option<String>,
    /// Durable store backend
    pub store: StoreConfig,
    /// Prefix for store keys (`<prefix>:actions`, `<prefix>:clears`)
    pub key_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_bind_addr: None,
            shutdown_grace: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(250),
            max_frame_len: 1024 * 1024,
            max_malformed_frames: 8,
            outbound_capacity: 256,
            store_timeout: Duration::from_millis(1000),
            metrics_bind_addr: Some("127.0.0.1:8000".to_string()),
            store: StoreConfig::Memory,
            key_prefix: "whiteboard".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Unsatisfiable(String),
}

impl ServerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup; unset variables keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env(&lookup);

        if let Some(bind) = env.string("WHITEBOARD_BIND") {
            config.bind_addr = bind;
        }
        config.ws_bind_addr = env.string("WHITEBOARD_WS_BIND");
        if let Some(ms) = env.parse::<u64>("WHITEBOARD_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("WHITEBOARD_HANDSHAKE_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = env.parse("WHITEBOARD_MAX_FRAME_BYTES")? {
            config.max_frame_len = len;
        }
        if let Some(count) = env.parse("WHITEBOARD_MAX_MALFORMED")? {
            config.max_malformed_frames = count;
        }
        if let Some(capacity) = env.parse("WHITEBOARD_OUTBOUND_CAPACITY")? {
            config.outbound_capacity = capacity;
        }
        if let Some(ms) = env.parse::<u64>("WHITEBOARD_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms);
        }
        if let Some(addr) = env.string("WHITEBOARD_METRICS_BIND") {
            config.metrics_bind_addr = match addr.to_ascii_lowercase().as_str() {
                "off" | "none" => None,
                _ => Some(addr),
            };
        }
        if let Some(prefix) = env.string("WHITEBOARD_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        config.store = store_from_env(&env)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Unsatisfiable(
                "outbound_capacity must be at least 1".into(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Unsatisfiable(
                "max_frame_len must be at least 1".into(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Unsatisfiable(
                "store_timeout must be positive".into(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Unsatisfiable("key_prefix is empty".into()));
        }
        if let StoreConfig::Redis(redis) = &self.store {
            if redis.nodes.is_empty() {
                return Err(ConfigError::Unsatisfiable("no redis nodes configured".into()));
            }
        }
        Ok(())
    }
}

fn store_from_env(env: &Env<'_>) -> Result<StoreConfig, ConfigError> {
    let backend = env.string("WHITEBOARD_STORE").unwrap_or_else(|| "memory".into());
    match backend.to_ascii_lowercase().as_str() {
        "memory" => Ok(StoreConfig::Memory),
        "rocksdb" | "rocks" => {
            let mut rocks = RocksConfig::default();
            if let Some(path) = env.string("WHITEBOARD_ROCKS_PATH") {
                rocks.path = PathBuf::from(path);
            }
            Ok(StoreConfig::RocksDb(rocks))
        }
        "redis" => {
            let mut redis = RedisConfig::default();
            if let Some(nodes) = env.string("WHITEBOARD_REDIS_NODES") {
                redis.nodes = parse_nodes(&nodes).map_err(|reason| ConfigError::Invalid {
                    var: "WHITEBOARD_REDIS_NODES",
                    value: nodes.clone(),
                    reason,
                })?;
            }
            if let Some(cluster) = env.flag("WHITEBOARD_REDIS_CLUSTER")? {
                redis.cluster = cluster;
            }
            redis.username = env.string("WHITEBOARD_REDIS_USERNAME");
            redis.password = env.string("WHITEBOARD_REDIS_PASSWORD");
            Ok(StoreConfig::Redis(redis))
        }
        _ => Err(ConfigError::Invalid {
            var: "WHITEBOARD_STORE",
            value: backend,
            reason: "expected memory, rocksdb or redis".into(),
        }),
    }
}

/// Parse `host:port[,host:port...]`.
fn parse_nodes(raw: &str) -> Result<Vec<(String, u16)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(|node| {
            let (host, port) = node
                .rsplit_once(':')
                .ok_or_else(|| format!("{node:?} is missing a port"))?;
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("bad port in {node:?}: {e}"))?;
            if host.is_empty() {
                return Err(format!("{node:?} is missing a host"));
            }
            Ok((host.to_string(), port))
        })
        .collect()
}

/// Variable lookup with trimming and typed parsing.
struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(var)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".into(),
                }),
            })
            .transpose()
    }
}
