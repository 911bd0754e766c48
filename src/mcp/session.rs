//! Session store
//!
//! Maps session ids to live [`TransportChannel`]s. Entries are only ever
//! inserted when a channel reports a completed handshake and removed when it
//! reports closure; both arrive through the store's [`ChannelObserver`].

use rmcp::model::ErrorCode;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use super::protocol::{SERVER_ERROR, SESSION_NOT_FOUND};
use super::channel::{ChannelEvent, ChannelObserver, CloseReason, TransportChannel};
use crate::config::ServerIdentity;
use crate::tools::ToolRegistry;

/// Opaque session identifier (random UUID v4)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    UnknownSession(SessionId),
    #[error("Session has been closed")]
    ChannelClosed,
    #[error("Server not initialized")]
    NotInitialized,
}

impl SessionError {
    /// JSON-RPC error code used when this reaches a client
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::UnknownSession(_) | SessionError::ChannelClosed => SESSION_NOT_FOUND,
            SessionError::NotInitialized => SERVER_ERROR,
        }
    }
}

/// Live session: its channel and when it was created
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub channel: Arc<TransportChannel>,
    pub created_at: SystemTime,
}

#[derive(Debug)]
struct StoreInner {
    registry: Arc<ToolRegistry>,
    identity: Arc<ServerIdentity>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl StoreInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, session_id: SessionId, channel: Arc<TransportChannel>) {
        let mut sessions = self.sessions();
        if sessions.contains_key(&session_id) {
            tracing::error!("Session id collision on {}, keeping existing channel", session_id);
            return;
        }
        sessions.insert(
            session_id,
            SessionEntry {
                channel,
                created_at: SystemTime::now(),
            },
        );
        tracing::debug!("Session store now holds {} sessions", sessions.len());
    }

    fn remove(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions().remove(session_id)
    }
}

/// Observer handed to every channel the store creates. Holds the store
/// weakly so channels never keep it alive.
struct StoreListener {
    inner: Weak<StoreInner>,
}

impl ChannelObserver for StoreListener {
    fn on_event(&self, event: &ChannelEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Initialized {
                session_id,
                channel,
            } => inner.insert(session_id.clone(), Arc::clone(channel)),
            ChannelEvent::Closed {
                session_id: Some(session_id),
                ..
            } => {
                inner.remove(session_id);
            }
            ChannelEvent::Closed { session_id: None, .. } => {}
        }
    }
}

/// Process-wide session map. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(registry: Arc<ToolRegistry>, identity: Arc<ServerIdentity>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                registry,
                identity,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn identity(&self) -> &Arc<ServerIdentity> {
        &self.inner.identity
    }

    /// Live channel for `session_id`, if any
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<TransportChannel>> {
        let channel = self.inner.sessions().get(session_id)?.channel.clone();
        if channel.is_closed() {
            None
        } else {
            Some(channel)
        }
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.get(session_id).is_some()
    }

    /// New, unregistered channel bound to the shared registry. It enters the
    /// map only once its handshake succeeds.
    pub fn create(&self) -> Arc<TransportChannel> {
        let listener = StoreListener {
            inner: Arc::downgrade(&self.inner),
        };
        Arc::new(
            TransportChannel::new(self.inner.registry.clone(), self.inner.identity.clone())
                .with_observer(Arc::new(listener)),
        )
    }

    /// Drop the mapping for `session_id`. Removing an absent id is a no-op.
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<TransportChannel>> {
        self.inner.remove(session_id).map(|entry| entry.channel)
    }

    /// Close the channel behind `session_id`; its closed event removes the entry
    pub fn close_session(&self, session_id: &SessionId, reason: CloseReason) -> bool {
        match self.get(session_id) {
            Some(channel) => channel.close(reason),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions().keys().cloned().collect()
    }

    pub fn entry(&self, session_id: &SessionId) -> Option<SessionEntry> {
        self.inner.sessions().get(session_id).cloned()
    }

    /// Close every live session. Returns how many were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let channels: Vec<_> = self
            .inner
            .sessions()
            .values()
            .map(|entry| entry.channel.clone())
            .collect();
        channels
            .into_iter()
            .filter(|channel| channel.close(reason))
            .count()
    }

    /// Close sessions with no activity for at least `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<_> = self
            .inner
            .sessions()
            .values()
            .filter(|entry| entry.channel.idle_for() >= max_idle)
            .map(|entry| entry.channel.clone())
            .collect();
        idle.into_iter()
            .filter(|channel| channel.close(CloseReason::IdleTimeout))
            .count()
    }

    /// Background task running [`SessionStore::evict_idle`] periodically
    pub fn spawn_idle_reaper(&self, max_idle: Duration) -> JoinHandle<()> {
        let store = self.clone();
        let period = (max_idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = store.evict_idle(max_idle);
                if evicted > 0 {
                    tracing::info!("Evicted {} idle sessions", evicted);
                }
            }
        })
    }
}
