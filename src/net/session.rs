//! Player Sessions
//!
//! Server-side bookkeeping for every identity that has completed a
//! handshake: lifecycle state, attributes, connection quality, and the
//! outbound queue. A session whose socket drops lingers in the table so
//! the same name can reattach; a kicked session is removed and its name
//! banned for the lifetime of the server.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::net::queue::SendQueue;
use crate::net::remote::CallTable;
use crate::net::{ConnectionStatus, SessionState};
use crate::wire::Value;

/// Errors from session admission and lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The name was kicked earlier and may not return.
    #[error("name `{0}` is banned")]
    Banned(String),

    /// The name is attached to a live socket already.
    #[error("name `{0}` is already connected")]
    Duplicate(String),

    /// The table has no room for another session.
    #[error("session table is full")]
    Full,

    /// No session exists under the name.
    #[error("no session named `{0}`")]
    NotFound(String),
}

/// One player's server-side state.
pub struct Session {
    /// Identity the session answers to.
    pub name: String,
    /// Protocol version the client connected with.
    pub version: String,
    state: SessionState,
    attributes: BTreeMap<String, Value>,
    status: ConnectionStatus,
    queue: SendQueue,
    calls: CallTable,
    epoch: u64,
}

impl Session {
    /// Fresh session in the connected state with an idle queue.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            state: SessionState::Connected,
            attributes,
            status: ConnectionStatus::Unknown,
            queue: SendQueue::new(),
            calls: CallTable::new(),
            epoch: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session has a live socket.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected | SessionState::Reconnected
        )
    }

    /// Handle on the session's outbound queue.
    pub fn queue(&self) -> SendQueue {
        self.queue.clone()
    }

    /// Handle on the session's pending remote calls.
    pub fn calls(&self) -> CallTable {
        self.calls.clone()
    }

    /// Which socket binding the session is on. Bumped at every rebind, so
    /// a reader outliving its socket can tell the session has moved on.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Look up one attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Write one attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// All attributes in key order.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Latest connection quality bucket.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Fold a round-trip report into the quality estimate.
    ///
    /// Returns the new bucket only when it differs from the previous one,
    /// so callers can notify on change alone.
    pub fn report_round_trip(&mut self, ms: f64) -> Option<ConnectionStatus> {
        let status = ConnectionStatus::from_round_trip(ms);
        if status == self.status {
            None
        } else {
            self.status = status;
            Some(status)
        }
    }

    fn mark_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
    }

    fn rebind(&mut self, version: String, attributes: BTreeMap<String, Value>) {
        self.state = SessionState::Reconnected;
        self.version = version;
        self.epoch += 1;
        // Reconnect attributes land on top; anything the server stashed in
        // the meantime survives under its own keys.
        self.attributes.extend(attributes);
    }

    fn mark_kicked(&mut self) {
        self.state = SessionState::Kicked;
    }
}

/// Outcome of admitting an identity.
pub enum Admission {
    /// A brand new session was created.
    Fresh(Arc<RwLock<Session>>),
    /// A lingering session was rebound to the new socket.
    Rebound(Arc<RwLock<Session>>),
}

impl Admission {
    /// The session regardless of how it was admitted.
    pub fn session(&self) -> &Arc<RwLock<Session>> {
        match self {
            Admission::Fresh(session) | Admission::Rebound(session) => session,
        }
    }

    /// Whether this admission reattached an existing session.
    pub fn is_rebound(&self) -> bool {
        matches!(self, Admission::Rebound(_))
    }
}

// Sessions hold live channels, so Debug shows the variant only.
impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Fresh(_) => f.write_str("Fresh(..)"),
            Admission::Rebound(_) => f.write_str("Rebound(..)"),
        }
    }
}

// =============================================================================
// SESSION TABLE
// =============================================================================

/// All sessions the server knows, keyed by name.
pub struct SessionTable {
    sessions: RwLock<BTreeMap<String, Arc<RwLock<Session>>>>,
    banned: RwLock<BTreeSet<String>>,
    max_clients: usize,
}

impl SessionTable {
    /// Empty table admitting at most `max_clients` sessions.
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            banned: RwLock::new(BTreeSet::new()),
            max_clients,
        }
    }

    /// Resolve an identity presenting itself at the end of a handshake.
    ///
    /// Banned names and names on live sockets are refused. A lingering
    /// disconnected session is rebound; an unknown name gets a fresh
    /// session if the table still has room. Lingering sessions keep
    /// their seat, so reconnection never fails on capacity.
    pub async fn admit(
        &self,
        name: &str,
        version: impl Into<String>,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Admission, SessionError> {
        if self.banned.read().await.contains(name) {
            return Err(SessionError::Banned(name.to_string()));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(name) {
            let mut session = existing.write().await;
            if session.is_live() {
                return Err(SessionError::Duplicate(name.to_string()));
            }
            session.rebind(version.into(), attributes);
            drop(session);
            return Ok(Admission::Rebound(Arc::clone(existing)));
        }

        if sessions.len() >= self.max_clients {
            return Err(SessionError::Full);
        }

        let session = Arc::new(RwLock::new(Session::new(name, version.into(), attributes)));
        sessions.insert(name.to_string(), Arc::clone(&session));
        Ok(Admission::Fresh(session))
    }

    /// Look up a session by name.
    pub async fn get(&self, name: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Mark a session disconnected, leaving it in the table for
    /// reconnection.
    pub async fn mark_disconnected(&self, name: &str) -> Result<(), SessionError> {
        match self.get(name).await {
            Some(session) => {
                session.write().await.mark_disconnected();
                Ok(())
            }
            None => Err(SessionError::NotFound(name.to_string())),
        }
    }

    /// Remove a session and ban its name.
    ///
    /// Returns the removed session so the caller can flush a farewell
    /// through its queue.
    pub async fn kick(&self, name: &str) -> Result<Arc<RwLock<Session>>, SessionError> {
        let removed = self.sessions.write().await.remove(name);
        let Some(session) = removed else {
            return Err(SessionError::NotFound(name.to_string()));
        };
        session.write().await.mark_kicked();
        self.banned.write().await.insert(name.to_string());
        Ok(session)
    }

    /// Whether a name is banned.
    pub async fn is_banned(&self, name: &str) -> bool {
        self.banned.read().await.contains(name)
    }

    /// Sessions currently on live sockets.
    pub async fn live(&self) -> Vec<Arc<RwLock<Session>>> {
        let sessions = self.sessions.read().await;
        let mut live = Vec::new();
        for session in sessions.values() {
            if session.read().await.is_live() {
                live.push(Arc::clone(session));
            }
        }
        live
    }

    /// Number of sessions, live or lingering.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the table holds no sessions at all.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove every session, returning them for farewell delivery.
    pub async fn drain(&self) -> Vec<Arc<RwLock<Session>>> {
        let mut sessions = self.sessions.write().await;
        let drained = std::mem::take(&mut *sessions);
        drained.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, i32)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::I32(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_admission() {
        let table = SessionTable::new(4);
        let admission = table.admit("alice", "1.0", attrs(&[])).await.unwrap();
        assert!(!admission.is_rebound());
        assert_eq!(table.len().await, 1);

        let session = admission.session().read().await;
        assert_eq!(session.name, "alice");
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.status(), ConnectionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_duplicate_name_refused() {
        let table = SessionTable::new(4);
        table.admit("alice", "1.0", attrs(&[])).await.unwrap();

        let err = table.admit("alice", "1.0", attrs(&[])).await.unwrap_err();
        assert_eq!(err, SessionError::Duplicate("alice".to_string()));
    }

    #[tokio::test]
    async fn test_full_table_refuses_new_names() {
        let table = SessionTable::new(2);
        table.admit("alice", "1.0", attrs(&[])).await.unwrap();
        table.admit("bob", "1.0", attrs(&[])).await.unwrap();

        let err = table.admit("carol", "1.0", attrs(&[])).await.unwrap_err();
        assert_eq!(err, SessionError::Full);
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_and_keeps_attributes() {
        let table = SessionTable::new(4);
        table
            .admit("alice", "1.0", attrs(&[("seat", 3)]))
            .await
            .unwrap();
        table.mark_disconnected("alice").await.unwrap();

        let admission = table
            .admit("alice", "1.1", attrs(&[("deck", 2)]))
            .await
            .unwrap();
        assert!(admission.is_rebound());

        let session = admission.session().read().await;
        assert_eq!(session.state(), SessionState::Reconnected);
        assert_eq!(session.version, "1.1");
        assert_eq!(session.epoch(), 1);
        assert_eq!(session.attribute("seat"), Some(&Value::I32(3)));
        assert_eq!(session.attribute("deck"), Some(&Value::I32(2)));
    }

    #[tokio::test]
    async fn test_reconnect_fits_even_when_full() {
        let table = SessionTable::new(1);
        table.admit("alice", "1.0", attrs(&[])).await.unwrap();
        table.mark_disconnected("alice").await.unwrap();

        let admission = table.admit("alice", "1.0", attrs(&[])).await.unwrap();
        assert!(admission.is_rebound());
    }

    #[tokio::test]
    async fn test_kick_bans_the_name() {
        let table = SessionTable::new(4);
        table.admit("alice", "1.0", attrs(&[])).await.unwrap();

        let kicked = table.kick("alice").await.unwrap();
        assert_eq!(kicked.read().await.state(), SessionState::Kicked);
        assert!(table.is_banned("alice").await);
        assert_eq!(table.len().await, 0);

        let err = table.admit("alice", "1.0", attrs(&[])).await.unwrap_err();
        assert_eq!(err, SessionError::Banned("alice".to_string()));
    }

    #[tokio::test]
    async fn test_status_reports_only_changes() {
        let mut session = Session::new("alice", "1.0", attrs(&[]));

        assert_eq!(
            session.report_round_trip(20.0),
            Some(ConnectionStatus::Excellent)
        );
        assert_eq!(session.report_round_trip(30.0), None);
        assert_eq!(session.report_round_trip(600.0), Some(ConnectionStatus::Poor));
        assert_eq!(session.status(), ConnectionStatus::Poor);
    }

    #[tokio::test]
    async fn test_live_listing_skips_lingerers() {
        let table = SessionTable::new(4);
        table.admit("alice", "1.0", attrs(&[])).await.unwrap();
        table.admit("bob", "1.0", attrs(&[])).await.unwrap();
        table.mark_disconnected("bob").await.unwrap();

        let live = table.live().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].read().await.name, "alice");
        assert_eq!(table.len().await, 2);
    }
}
