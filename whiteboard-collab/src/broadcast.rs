//! Fan-out of committed events to every active session.
//!
//! Each event is encoded once into an `Arc<str>` and queued on every
//! recipient's bounded outbound channel with `try_send`. A recipient whose
//! queue is full or closed is evicted inside the same publish call, so one
//! slow peer never holds up the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ProtocolError, ServerMessage, SessionId};
use crate::registry::{DeliveryError, OutboundFrame, SessionRegistry};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_published: u64,
    pub frames_delivered: u64,
    pub recipients_evicted: u64,
    pub active_sessions: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_published: AtomicU64,
    frames_delivered: AtomicU64,
    recipients_evicted: AtomicU64,
}

/// Outcome of one [`BroadcastBus::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Sessions evicted because their queue was full or closed.
    pub evicted: Vec<SessionId>,
}

pub struct BroadcastBus {
    registry: Arc<SessionRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastBus {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Queue `msg` on every `Active` session, skipping `origin` when
    /// `exclude_origin` is set.
    ///
    /// Never blocks. Fails only if `msg` cannot be encoded.
    pub fn publish(
        &self,
        msg: &ServerMessage,
        origin: &str,
        exclude_origin: bool,
    ) -> Result<PublishReport, ProtocolError> {
        let frame = OutboundFrame::new(msg)?;

        let mut delivered = 0;
        let failed = self.registry.for_each_active(|entry| -> Result<(), DeliveryError> {
            if exclude_origin && entry.session_id() == origin {
                return Ok(());
            }
            entry.try_deliver(frame.clone())?;
            delivered += 1;
            Ok(())
        });

        let mut evicted = Vec::with_capacity(failed.len());
        for (entry, reason) in failed {
            log::warn!(
                "Evicting session {} during broadcast: {}",
                entry.session_id(),
                reason
            );
            self.registry.evict(&entry);
            evicted.push(entry.session_id().to_string());
        }

        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .recipients_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        Ok(PublishReport { delivered, evicted })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            recipients_evicted: self.stats.recipients_evicted.load(Ordering::Relaxed),
            active_sessions: self.registry.active_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DrawAction, Point};
    use crate::registry::{SessionEntry, SessionHandle, SessionState};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn join(
        registry: &SessionRegistry,
        id: &str,
        capacity: usize,
    ) -> (Arc<SessionEntry>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let entry = registry.register(
            id,
            SessionHandle {
                outbound: tx,
                cancel: CancellationToken::new(),
            },
            0,
        );
        registry.transition(&entry, SessionState::Syncing).unwrap();
        registry.transition(&entry, SessionState::Active).unwrap();
        (entry, rx)
    }

    fn draw(ts: u64, session: &str) -> ServerMessage {
        ServerMessage::Draw {
            data: DrawAction {
                points: vec![Point::new(1, 1, 1, "blue")],
                timestamp: ts,
                session_id: session.into(),
            },
        }
    }

    #[tokio::test]
    async fn test_publish_excludes_origin() {
        let registry = Arc::new(SessionRegistry::new());
        let bus = BroadcastBus::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, "a", 8);
        let (_b, mut rx_b) = join(&registry, "b", 8);

        let report = bus.publish(&draw(1, "a"), "a", true).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(report.evicted.is_empty());
        assert!(rx_a.try_recv().is_err());

        let frame = rx_b.recv().await.unwrap();
        assert_eq!(frame.timestamp, Some(1));
        assert!(frame.text.contains(r#""session_id":"a""#));
    }

    #[tokio::test]
    async fn test_publish_includes_origin() {
        let registry = Arc::new(SessionRegistry::new());
        let bus = BroadcastBus::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, "a", 8);
        let (_b, mut rx_b) = join(&registry, "b", 8);

        let clear = ServerMessage::Clear { timestamp: 5 };
        assert_eq!(bus.publish(&clear, "a", false).unwrap().delivered, 2);
        assert_eq!(&*rx_a.recv().await.unwrap().text, r#"{"type":"clear","timestamp":5}"#);
        assert_eq!(rx_b.recv().await.unwrap().timestamp, Some(5));
    }

    #[tokio::test]
    async fn test_broken_recipient_is_evicted_in_one_publish() {
        let registry = Arc::new(SessionRegistry::new());
        let bus = BroadcastBus::new(registry.clone());

        let mut healthy = Vec::new();
        for i in 0..5 {
            healthy.push(join(&registry, &format!("ok{i}"), 8));
        }
        let (slow, _slow_rx) = join(&registry, "slow", 1);
        let (gone, gone_rx) = join(&registry, "gone", 8);
        drop(gone_rx);
        // Fill the slow peer's queue.
        slow.try_deliver(OutboundFrame::new(&draw(0, "x")).unwrap())
            .unwrap();

        let mut report = bus.publish(&draw(1, "origin"), "origin", true).unwrap();
        report.evicted.sort();
        assert_eq!(report.delivered, 5);
        assert_eq!(report.evicted, vec!["gone".to_string(), "slow".to_string()]);

        assert_eq!(slow.state(), SessionState::Disconnected);
        assert!(slow.cancel_token().is_cancelled());
        assert!(gone.cancel_token().is_cancelled());
        assert!(registry.get("slow").is_none());
        assert_eq!(registry.len(), 5);

        for (_, rx) in healthy.iter_mut() {
            assert_eq!(rx.recv().await.unwrap().timestamp, Some(1));
        }

        // Next publish does not see the evicted sessions at all.
        assert!(bus.publish(&draw(2, "origin"), "origin", true).unwrap().evicted.is_empty());
        let stats = bus.stats();
        assert_eq!(stats.messages_published, 2);
        assert_eq!(stats.frames_delivered, 10);
        assert_eq!(stats.recipients_evicted, 2);
        assert_eq!(stats.active_sessions, 5);
    }

    #[tokio::test]
    async fn test_syncing_sessions_receive_nothing() {
        let registry = Arc::new(SessionRegistry::new());
        let bus = BroadcastBus::new(registry.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let entry = registry.register(
            "late",
            SessionHandle {
                outbound: tx,
                cancel: CancellationToken::new(),
            },
            0,
        );
        registry.transition(&entry, SessionState::Syncing).unwrap();

        assert_eq!(bus.publish(&draw(1, "a"), "a", true).unwrap().delivered, 0);
        assert!(rx.try_recv().is_err());
    }
}
