use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// A live session as seen by the registry: added on accept, removed when the
/// session reaches its terminal state.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// Tracks every live session so shutdown can signal and then wait for them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted session and hand back its id.
    pub fn register(&self, cancel: CancellationToken) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            SessionEntry {
                id,
                started_at: Utc::now(),
                cancel,
            },
        );
        trace!(session = %id, live = self.sessions.len(), "Session registered");
        id
    }

    /// Remove a finished session.
    pub fn deregister(&self, id: &Uuid) {
        if let Some((_, entry)) = self.sessions.remove(id) {
            let lifetime = Utc::now().signed_duration_since(entry.started_at);
            debug!(
                session = %id,
                lifetime_ms = lifetime.num_milliseconds(),
                live = self.sessions.len(),
                "Session deregistered"
            );
        }
    }

    /// Ask every live session to stop relaying. Cooperative: each session
    /// observes its token and closes its own streams.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
