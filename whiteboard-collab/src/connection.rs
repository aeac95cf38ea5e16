//! Per-connection protocol loop.
//!
//! Lifecycle of one connection:
//! 1. Wait briefly for an optional `connect` frame naming the session and its
//!    watermark. Any other first frame is kept and handled after sync.
//! 2. Register (`Connecting`), move to `Syncing`, replay the log after the
//!    watermark as one `sync` frame, then go `Active` under the commit lock.
//! 3. Decode and dispatch frames until the peer leaves, the transport fails,
//!    the session is evicted or the server shuts down.
//! 4. `Disconnected`, deregister, stop the writer. A peer that left normally
//!    still gets the frames already queued for it; an evicted session does
//!    not.
//!
//! Outbound frames never go straight to the socket. Everything is queued on
//! the session's bounded channel and written by a separate writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action_log::{LogRecord, PendingEvent};
use crate::protocol::{
    ClientMessage, ProtocolError, ServerMessage, SessionId, Timestamp, EPOCH_ZERO,
};
use crate::registry::{
    DeliveryError, OutboundFrame, SessionEntry, SessionHandle, SessionState, StateError,
};
use crate::server::ServerContext;
use crate::storage::StoreError;
use crate::transport::{Inbound, Outbound, TransportError};

/// Upper bound on flushing and closing the sink once the writer stops, and on
/// draining queued frames after the peer leaves.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything that can end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("could not queue frame: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("closing after {count} consecutive malformed frames")]
    TooManyMalformed { count: u32 },
}

/// Result of waiting for the first frame.
enum Handshake {
    /// Peer left (or the server stopped) before saying anything.
    Closed,
    Ready {
        session_id: SessionId,
        watermark: Timestamp,
        /// A non-`connect` first frame, to dispatch once active.
        pending: Option<Result<ClientMessage, ProtocolError>>,
    },
}

pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    malformed: u32,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            malformed: 0,
        }
    }

    /// Serve one connection to completion.
    pub async fn run(mut self, inbound: Inbound, outbound: Outbound) -> Result<(), ConnectionError> {
        self.ctx.metrics.connection_opened();
        let result = self.serve(inbound, outbound).await;
        self.ctx.metrics.connection_closed();
        result
    }

    async fn serve(&mut self, mut inbound: Inbound, outbound: Outbound) -> Result<(), ConnectionError> {
        let (session_id, watermark, pending) = match self.handshake(&mut inbound).await? {
            Handshake::Closed => {
                log::debug!("Connection from {} closed before handshake", self.peer);
                return Ok(());
            }
            Handshake::Ready {
                session_id,
                watermark,
                pending,
            } => (session_id, watermark, pending),
        };

        let cancel = self.ctx.shutdown.child_token();
        let (tx, rx) = mpsc::channel(self.ctx.config.outbound_capacity);
        let entry = self.ctx.registry.register(
            session_id,
            SessionHandle {
                outbound: tx,
                cancel: cancel.clone(),
            },
            watermark,
        );
        log::info!(
            "Session {} connected from {} (watermark {})",
            entry.session_id(),
            self.peer,
            watermark
        );

        let drain = CancellationToken::new();
        let mut writer = tokio::spawn(write_loop(
            rx,
            outbound,
            entry.clone(),
            cancel.clone(),
            drain.clone(),
        ));

        let result = match self.sync(&entry, watermark).await {
            Ok(()) => self.read_loop(&entry, &cancel, inbound, pending).await,
            Err(e) => Err(e),
        };

        let evicted = cancel.is_cancelled();
        let _ = self.ctx.registry.transition(&entry, SessionState::Disconnected);
        self.ctx.registry.deregister(&entry);
        if !evicted {
            drain.cancel();
        }
        let stopped = match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
            Ok(stopped) => stopped,
            Err(_) => {
                log::debug!("Dropping undelivered frames for {}", entry.session_id());
                cancel.cancel();
                writer.await
            }
        };
        cancel.cancel();
        match stopped {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Writer for {} stopped: {}", entry.session_id(), e),
            Err(e) => log::warn!("Writer for {} failed: {}", entry.session_id(), e),
        }
        log::info!("Session {} disconnected", entry.session_id());

        match result {
            // Evicted or shut down while syncing; not this connection's fault.
            Err(ConnectionError::State(_)) | Err(ConnectionError::Delivery(_)) if evicted => Ok(()),
            other => other,
        }
    }

    async fn handshake(&self, inbound: &mut Inbound) -> Result<Handshake, ConnectionError> {
        let first = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => return Ok(Handshake::Closed),
            first = tokio::time::timeout(self.ctx.config.handshake_timeout, inbound.next()) => first,
        };

        let (claimed, watermark, pending) = match first {
            // No first frame in time: anonymous, first-time client.
            Err(_) => (None, EPOCH_ZERO, None),
            Ok(None) => return Ok(Handshake::Closed),
            Ok(Some(Err(e))) => return Err(self.transport_failure(e)),
            Ok(Some(Ok(text))) => match ClientMessage::decode(&text) {
                Ok(ClientMessage::Connect { data, sender_id }) => (
                    sender_id,
                    data.and_then(|d| d.last_timestamp).unwrap_or(EPOCH_ZERO),
                    None,
                ),
                Ok(other) => (other.sender_id().map(str::to_string), EPOCH_ZERO, Some(Ok(other))),
                Err(e) => (None, EPOCH_ZERO, Some(Err(e))),
            },
        };

        let session_id = claimed
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Handshake::Ready {
            session_id,
            watermark,
            pending,
        })
    }

    /// Replay history and activate. The sync frame is queued before the
    /// session turns `Active`, so it always precedes broadcasts.
    async fn sync(&self, entry: &Arc<SessionEntry>, watermark: Timestamp) -> Result<(), ConnectionError> {
        self.ctx.registry.transition(entry, SessionState::Syncing)?;

        let registry = &self.ctx.registry;
        let (replay, activated) = self
            .ctx
            .log
            .replay(watermark, |replay| -> Result<(), ConnectionError> {
                let sync = ServerMessage::sync(replay.actions.clone(), replay.last_clear);
                entry.try_deliver(OutboundFrame::new(&sync)?)?;
                registry.transition(entry, SessionState::Active)?;
                Ok(())
            })
            .await;
        activated?;

        log::info!(
            "Session {} synced {} actions (last clear {}{})",
            entry.session_id(),
            replay.actions.len(),
            replay.last_clear,
            if replay.degraded { ", degraded" } else { "" }
        );
        Ok(())
    }

    async fn read_loop(
        &mut self,
        entry: &Arc<SessionEntry>,
        cancel: &CancellationToken,
        mut inbound: Inbound,
        pending: Option<Result<ClientMessage, ProtocolError>>,
    ) -> Result<(), ConnectionError> {
        if let Some(first) = pending {
            self.dispatch(entry, first).await?;
        }

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = inbound.next() => frame,
            };
            match frame {
                None => return Ok(()),
                Some(Ok(text)) => self.dispatch(entry, ClientMessage::decode(&text)).await?,
                Some(Err(e)) => return Err(self.transport_failure(e)),
            }
        }
    }

    async fn dispatch(
        &mut self,
        entry: &Arc<SessionEntry>,
        decoded: Result<ClientMessage, ProtocolError>,
    ) -> Result<(), ConnectionError> {
        let msg = match decoded {
            Ok(msg) => {
                self.malformed = 0;
                msg
            }
            Err(ProtocolError::EmptyFrame) => return Ok(()),
            Err(e) => {
                self.malformed += 1;
                log::warn!(
                    "Discarding frame from {} ({}/{}): {}",
                    entry.session_id(),
                    self.malformed,
                    self.ctx.config.max_malformed_frames,
                    e
                );
                if self.malformed > self.ctx.config.max_malformed_frames {
                    return Err(ConnectionError::TooManyMalformed {
                        count: self.malformed,
                    });
                }
                return Ok(());
            }
        };

        if let Some(sender) = msg.sender_id() {
            if sender != entry.session_id() {
                log::debug!(
                    "Frame claims sender {} on session {}; using the session id",
                    sender,
                    entry.session_id()
                );
            }
        }

        match msg {
            ClientMessage::Draw { data, .. } => {
                let event = PendingEvent::Draw {
                    points: data.points,
                    session_id: entry.session_id().to_string(),
                };
                self.commit(entry, event, true).await
            }
            ClientMessage::Clear { .. } => {
                let event = PendingEvent::Clear {
                    session_id: entry.session_id().to_string(),
                };
                self.commit(entry, event, false).await
            }
            ClientMessage::Cursor { data, .. } => {
                let cursor = ServerMessage::Cursor {
                    data,
                    session_id: entry.session_id().to_string(),
                };
                self.ctx.bus.publish(&cursor, entry.session_id(), true)?;
                Ok(())
            }
            ClientMessage::Connect { .. } => {
                log::debug!("Ignoring connect from already synced {}", entry.session_id());
                Ok(())
            }
        }
    }

    /// Append `event` and broadcast it from inside the commit. A store
    /// failure is reported to the origin only.
    async fn commit(
        &self,
        entry: &Arc<SessionEntry>,
        event: PendingEvent,
        exclude_origin: bool,
    ) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let is_clear = matches!(event, PendingEvent::Clear { .. });
        let bus = &self.ctx.bus;
        let origin = entry.session_id();

        let committed = self
            .ctx
            .log
            .append_and_publish(event, |record| {
                let msg = match record {
                    LogRecord::Draw(action) => ServerMessage::Draw {
                        data: action.clone(),
                    },
                    LogRecord::Clear(clear) => ServerMessage::Clear {
                        timestamp: clear.timestamp,
                    },
                };
                bus.publish(&msg, origin, exclude_origin)
            })
            .await;

        match committed {
            Ok(published) => {
                let report = published?;
                if is_clear {
                    self.ctx.metrics.clear_committed();
                } else {
                    self.ctx.metrics.draw_committed();
                }
                self.ctx.metrics.action_processed(started.elapsed());
                log::trace!(
                    "{} from {} reached {} sessions",
                    if is_clear { "Clear" } else { "Draw" },
                    origin,
                    report.delivered
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("Event from {} not committed: {}", origin, e);
                let frame = OutboundFrame::new(&ServerMessage::not_committed(e.to_string()))?;
                if let Err(full) = entry.try_deliver(frame) {
                    log::debug!("Could not tell {} about the failure: {}", origin, full);
                }
                Ok(())
            }
        }
    }

    fn transport_failure(&self, e: TransportError) -> ConnectionError {
        match e {
            TransportError::FrameTooLarge { max } => {
                log::warn!("Frame from {} exceeds {} bytes; closing", self.peer, max);
                ProtocolError::FrameTooLarge { max }.into()
            }
            other => other.into(),
        }
    }
}

/// Drain the session's queue into the socket until cancelled or the queue
/// closes. Once `drain` fires the queue accepts nothing new and the writer
/// stops after the frames already in it. Exiting for any reason cancels the
/// session.
async fn write_loop(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: Outbound,
    entry: Arc<SessionEntry>,
    cancel: CancellationToken,
    drain: CancellationToken,
) -> Result<(), TransportError> {
    let _teardown = cancel.clone().drop_guard();
    let mut draining = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = drain.cancelled(), if !draining => {
                draining = true;
                rx.close();
                continue;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let timestamp = frame.timestamp;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sink.send(frame.text) => sent?,
        }
        if let Some(ts) = timestamp {
            entry.advance_watermark(ts);
        }
    }

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    Ok(())
}
