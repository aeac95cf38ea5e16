//! Listener supervision and shutdown.
//!
//! Architecture:
//! ```text
//! TCP listener ──┐                          ┌── SessionRegistry (DashMap)
//!                ├── ConnectionHandler ×N ──┼── ActionLog ── SortedSetStore
//! WS listener  ──┘        │                 └── BroadcastBus
//!                         ▼
//!                  writer task ×N ──► sockets
//! ```
//!
//! Every connection task lives in one `JoinSet`. Shutdown stops accepting,
//! cancels the shared token (and with it every session), waits up to the
//! grace period, then aborts whatever is left.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::action_log::ActionLog;
use crate::broadcast::BroadcastBus;
use crate::config::{ConfigError, ServerConfig};
use crate::connection::ConnectionHandler;
use crate::metrics::MetricsObserver;
use crate::registry::SessionRegistry;
use crate::storage::{self, SortedSetStore, StoreError};
use crate::transport;

/// Upper bound on the WebSocket upgrade handshake.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Shared state handed to every connection.
pub struct ServerContext {
    pub config: ServerConfig,
    pub log: ActionLog,
    pub registry: Arc<SessionRegistry>,
    pub bus: BroadcastBus,
    pub metrics: Arc<dyn MetricsObserver>,
    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Tcp,
    WebSocket,
}

/// The whiteboard server, configured but not yet listening.
pub struct WhiteboardServer {
    ctx: Arc<ServerContext>,
}

impl WhiteboardServer {
    /// Assemble a server around an already opened log.
    pub fn new(config: ServerConfig, log: ActionLog, metrics: Arc<dyn MetricsObserver>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let bus = BroadcastBus::new(registry.clone());
        Self {
            ctx: Arc::new(ServerContext {
                config,
                log,
                registry,
                bus,
                metrics,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the configured store and the log on top of it.
    pub async fn open(
        config: ServerConfig,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let store = storage::open(&config.store).await?;
        Self::with_store(config, store, metrics).await
    }

    /// Like [`WhiteboardServer::open`], over a store the caller built.
    pub async fn with_store(
        config: ServerConfig,
        store: Arc<dyn SortedSetStore>,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Result<Self, ServerError> {
        let log = ActionLog::open_with_timeout(
            store,
            &config.key_prefix,
            metrics.clone(),
            config.store_timeout,
        )
        .await?;
        Ok(Self::new(config, log, metrics))
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind the TCP listener and, if configured, the WebSocket listener.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let tcp = bind(&self.ctx.config.bind_addr).await?;
        let ws = match &self.ctx.config.ws_bind_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        log::info!("Whiteboard server listening on {} (tcp)", tcp.local_addr()?);
        if let Some(ws) = &ws {
            log::info!("Whiteboard server listening on {} (websocket)", ws.local_addr()?);
        }

        Ok(BoundServer {
            ctx: self.ctx,
            tcp,
            ws,
        })
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// A listening server.
pub struct BoundServer {
    ctx: Arc<ServerContext>,
    tcp: TcpListener,
    ws: Option<TcpListener>,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|ws| ws.local_addr().ok())
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Cancelling this token shuts the server down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Serve until [`BoundServer::shutdown_token`] is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        let token = self.shutdown_token();
        self.run_until(token.cancelled_owned()).await
    }

    /// Serve until `signal` resolves or the shutdown token is cancelled.
    pub async fn run_until<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    log::info!("Shutdown requested");
                    break;
                }
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(&mut connections, stream, peer, Listener::Tcp),
                    Err(e) => Self::accept_failed(e).await,
                },
                accepted = accept_on(self.ws.as_ref()) => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(&mut connections, stream, peer, Listener::WebSocket),
                    Err(e) => Self::accept_failed(e).await,
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            log::error!("Connection task panicked: {e}");
                        }
                    }
                }
            }
        }

        self.shutdown(connections).await
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        listener: Listener,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY for {peer}: {e}");
        }
        log::debug!("New {listener:?} connection from {peer}");

        let ctx = self.ctx.clone();
        connections.spawn(async move {
            let max_frame_len = ctx.config.max_frame_len;
            let (inbound, outbound) = match listener {
                Listener::Tcp => transport::tcp_lines(stream, max_frame_len),
                Listener::WebSocket => {
                    match tokio::time::timeout(
                        UPGRADE_TIMEOUT,
                        transport::websocket(stream, max_frame_len),
                    )
                    .await
                    {
                        Ok(Ok(pair)) => pair,
                        Ok(Err(e)) => {
                            log::warn!("WebSocket upgrade from {peer} failed: {e}");
                            return;
                        }
                        Err(_) => {
                            log::warn!("WebSocket upgrade from {peer} timed out");
                            return;
                        }
                    }
                }
            };

            if let Err(e) = ConnectionHandler::new(ctx, peer).run(inbound, outbound).await {
                log::warn!("Connection from {peer} closed with error: {e}");
            }
        });
    }

    async fn accept_failed(e: io::Error) {
        log::error!("Accept failed: {e}");
        tokio::time::sleep(ACCEPT_BACKOFF).await;
    }

    async fn shutdown(self, mut connections: JoinSet<()>) -> Result<(), ServerError> {
        let BoundServer { ctx, tcp, ws } = self;
        drop(tcp);
        drop(ws);

        log::info!(
            "Shutting down: {} connections, {} sessions",
            connections.len(),
            ctx.registry.len()
        );
        ctx.shutdown.cancel();

        let grace = ctx.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            log::warn!(
                "Grace period of {:?} elapsed; aborting {} connections",
                grace,
                connections.len()
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        log::info!("Shutdown complete (log head {})", ctx.log.head());
        Ok(())
    }
}
