//! Sessions: one per accepted connection, never reused across reconnects.

use super::background::BackgroundCall;
use crate::protocol::{Frame, ReplyStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Server-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap an id received over the wire.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw integer.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Hands out strictly increasing session ids, starting at 1.
#[derive(Debug)]
pub(crate) struct SessionIdAllocator(AtomicU64);

impl SessionIdAllocator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Server-side record of a live connection.
#[derive(Debug)]
pub struct ClientSession {
    /// Never reused.
    pub id: SessionId,
    /// Remote address of the connection.
    pub peer: SocketAddr,
    /// Name sent in `HELLO`.
    pub client_name: String,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    /// Mirrors the admin token; only changed together with it.
    pub is_admin: bool,
    /// Last time any frame arrived from the client.
    pub last_heartbeat: Instant,
    /// Server-side reply statistics.
    pub stats: ReplyStats,
    /// Frames queued here are written by the session's connection task.
    pub(crate) outbound: mpsc::UnboundedSender<Frame>,
    /// Uncollected non-blocking call, at most one.
    pub(crate) background: Option<BackgroundCall>,
}

impl ClientSession {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        client_name: String,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            peer,
            client_name,
            connected_at: Utc::now(),
            is_admin: false,
            last_heartbeat: Instant::now(),
            stats: ReplyStats::default(),
            outbound,
            background: None,
        }
    }

    /// Queue an unsolicited frame. Fails silently if the connection is already gone.
    pub(crate) fn notify(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(session = %self.id, "dropping notification for closed session");
        }
    }
}

/// Live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, ClientSession>,
}

impl SessionTable {
    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Look up a live session.
    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Look up a live session for update.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.id, session);
    }

    /// Remove a session. `None` if it was already removed.
    pub(crate) fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    /// All live sessions, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ClientSession> + '_ {
        self.sessions.drain().map(|(_, session)| session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let alloc = SessionIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
        assert_eq!(a.to_string(), "session-1");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = SessionTable::default();
        let id = SessionId::from_raw(5);
        table.insert(ClientSession::new(id, "127.0.0.1:9".parse().unwrap(), "t".into(), tx));
        assert!(table.contains(id));
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }
}
