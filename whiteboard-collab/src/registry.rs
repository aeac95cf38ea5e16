//! Live sessions and their lifecycle.
//!
//! ```text
//! Connecting ──► Syncing ──► Active ──► Disconnected
//!     │             │                        ▲
//!     └─────────────┴────────────────────────┘
//! ```
//!
//! `Disconnected` is terminal. Re-entering it is a no-op; any other
//! transition not drawn above is a [`StateError`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ProtocolError, ServerMessage, SessionId, Timestamp};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Syncing,
    Active,
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Syncing) | (Syncing, Active) | (_, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

/// A frame encoded once and shared by every recipient.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub text: Arc<str>,
    /// Log timestamp carried by the frame, used to advance the watermark
    /// once it is written.
    pub timestamp: Option<Timestamp>,
}

impl OutboundFrame {
    pub fn new(msg: &ServerMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            text: Arc::from(msg.encode()?),
            timestamp: msg.timestamp(),
        })
    }
}

/// The registry's side of a connection: its outbound queue and the token
/// that tears it down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub cancel: CancellationToken,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// One registered session.
#[derive(Debug)]
pub struct SessionEntry {
    session_id: SessionId,
    handle: SessionHandle,
    state: Mutex<SessionState>,
    watermark: AtomicU64,
}

impl SessionEntry {
    fn new(session_id: SessionId, handle: SessionHandle, watermark: Timestamp) -> Self {
        Self {
            session_id,
            handle,
            state: Mutex::new(SessionState::Connecting),
            watermark: AtomicU64::new(watermark),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Highest log timestamp written to this session's socket.
    pub fn watermark(&self) -> Timestamp {
        self.watermark.load(Ordering::Acquire)
    }

    /// Raise the watermark to `ts`; never lowers it.
    pub fn advance_watermark(&self, ts: Timestamp) -> Timestamp {
        self.watermark.fetch_max(ts, Ordering::AcqRel).max(ts)
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        self.handle.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.handle.cancel
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SessionState) -> Result<SessionState, StateError> {
        let mut state = self.lock_state();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(StateError { from, to: next });
        }
        *state = next;
        Ok(from)
    }
}

/// All live sessions keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Connecting`. An existing session with the
    /// same id is evicted; the newest connection wins.
    pub fn register(
        &self,
        session_id: impl Into<SessionId>,
        handle: SessionHandle,
        watermark: Timestamp,
    ) -> Arc<SessionEntry> {
        let session_id = session_id.into();
        let entry = Arc::new(SessionEntry::new(session_id.clone(), handle, watermark));
        if let Some(previous) = self.sessions.insert(session_id, entry.clone()) {
            log::warn!(
                "Session {} re-registered; evicting previous connection",
                previous.session_id()
            );
            Self::shut(&previous);
        }
        entry
    }

    /// Move `entry` to `next`, returning the state it left.
    pub fn transition(
        &self,
        entry: &SessionEntry,
        next: SessionState,
    ) -> Result<SessionState, StateError> {
        let from = entry.transition(next)?;
        if from != next {
            log::debug!("Session {}: {:?} -> {:?}", entry.session_id(), from, next);
        }
        Ok(from)
    }

    /// Call `f` on every `Active` entry. The entry cannot leave `Active`
    /// while `f` runs. Entries for which `f` fails are returned with their
    /// error; the caller decides what to do with them.
    pub fn for_each_active<F, E>(&self, mut f: F) -> Vec<(Arc<SessionEntry>, E)>
    where
        F: FnMut(&SessionEntry) -> Result<(), E>,
    {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut failed = Vec::new();
        for entry in entries {
            let state = entry.lock_state();
            if *state != SessionState::Active {
                continue;
            }
            let result = f(&entry);
            drop(state);
            if let Err(e) = result {
                failed.push((entry, e));
            }
        }
        failed
    }

    /// Disconnect, cancel and remove `entry`.
    pub fn evict(&self, entry: &Arc<SessionEntry>) {
        Self::shut(entry);
        self.deregister(entry);
    }

    /// Remove `entry` if it is still the registered session for its id.
    /// Returns whether anything was removed.
    pub fn deregister(&self, entry: &Arc<SessionEntry>) -> bool {
        self.sessions
            .remove_if(entry.session_id(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().state() == SessionState::Active)
            .count()
    }

    fn shut(entry: &SessionEntry) {
        // Any state may enter Disconnected.
        let _ = entry.transition(SessionState::Disconnected);
        entry.handle.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SessionHandle {
                outbound: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn frame(ts: Timestamp) -> OutboundFrame {
        OutboundFrame::new(&ServerMessage::Clear { timestamp: ts }).unwrap()
    }

    fn activate(registry: &SessionRegistry, entry: &SessionEntry) {
        registry.transition(entry, SessionState::Syncing).unwrap();
        registry.transition(entry, SessionState::Active).unwrap();
    }

    #[test]
    fn test_state_machine() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Active));
        assert!(Active.can_transition_to(Disconnected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Syncing.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Disconnected));

        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Syncing));
        assert!(!Disconnected.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle(4);
        let entry = registry.register("a", h, 0);

        let err = registry
            .transition(&entry, SessionState::Active)
            .unwrap_err();
        assert_eq!(
            err,
            StateError {
                from: SessionState::Connecting,
                to: SessionState::Active
            }
        );
        assert_eq!(entry.state(), SessionState::Connecting);

        registry
            .transition(&entry, SessionState::Disconnected)
            .unwrap();
        // Idempotent
        registry
            .transition(&entry, SessionState::Disconnected)
            .unwrap();
    }

    #[test]
    fn test_duplicate_session_evicts_previous() {
        let registry = SessionRegistry::new();
        let (h1, _rx1) = handle(4);
        let (h2, _rx2) = handle(4);
        let cancel1 = h1.cancel.clone();

        let first = registry.register("same", h1, 0);
        activate(&registry, &first);
        let second = registry.register("same", h2, 0);

        assert_eq!(first.state(), SessionState::Disconnected);
        assert!(cancel1.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("same").unwrap(), &second));

        // The old connection's cleanup must not remove the new entry.
        assert!(!registry.deregister(&first));
        assert!(registry.get("same").is_some());
        assert!(registry.deregister(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_for_each_active_skips_inactive_and_reports_failures() {
        let registry = SessionRegistry::new();
        let (ha, mut rxa) = handle(4);
        let (hb, _rxb) = handle(1);
        let (hc, mut rxc) = handle(4);

        let a = registry.register("a", ha, 0);
        let b = registry.register("b", hb, 0);
        let _c = registry.register("c", hc, 0);
        activate(&registry, &a);
        activate(&registry, &b);
        // b's queue is already full.
        b.try_deliver(frame(1)).unwrap();

        let failed = registry.for_each_active(|entry| entry.try_deliver(frame(2)));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.session_id(), "b");
        assert_eq!(failed[0].1, DeliveryError::Full);

        assert_eq!(rxa.try_recv().unwrap().timestamp, Some(2));
        // c never left Connecting
        assert!(rxc.try_recv().is_err());
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_evict() {
        let registry = SessionRegistry::new();
        let (h, rx) = handle(4);
        let entry = registry.register("a", h, 0);
        activate(&registry, &entry);
        drop(rx);

        assert_eq!(entry.try_deliver(frame(1)), Err(DeliveryError::Closed));
        registry.evict(&entry);
        assert_eq!(entry.state(), SessionState::Disconnected);
        assert!(entry.cancel_token().is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_watermark_never_decreases() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle(4);
        let entry = registry.register("a", h, 10);
        assert_eq!(entry.watermark(), 10);
        assert_eq!(entry.advance_watermark(5), 10);
        assert_eq!(entry.advance_watermark(20), 20);
        assert_eq!(entry.watermark(), 20);
    }
}
