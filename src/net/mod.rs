//! Connection Layer
//!
//! TCP server and client for real-time tabletop play: handshake, sessions
//! with reconnection, outbound queues, property mirroring and remote
//! invocation. Game rules never live here; the embedding game consumes
//! events and sends commands.

pub mod client;
pub mod queue;
pub mod remote;
pub mod server;
pub mod session;
pub mod transport;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::wire::codec::DEFAULT_MAX_FRAME;
use crate::wire::{Command, Value};

pub use client::{Client, ClientError, ConnectError};
pub use queue::{QueueError, SendQueue};
pub use remote::{CallTable, RemoteCall, RemoteError, RemoteRegistry, RemoteTarget};
pub use server::{HandshakeError, Server, ServerError};
pub use session::{Session, SessionError, SessionTable};

// =============================================================================
// SHARED VOCABULARY
// =============================================================================

/// Lifecycle state of a session, as the server tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake has completed yet.
    Unknown,
    /// The socket dropped; the session waits for a reconnect.
    Disconnected,
    /// Live on its first socket.
    Connected,
    /// Live again on a later socket.
    Reconnected,
    /// Removed by the server; the name is banned.
    Kicked,
}

/// Coarse connection quality, derived from client round-trip reports.
///
/// Advisory only: nothing in the protocol keys off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStatus {
    /// No report received yet.
    Unknown,
    /// Round trips at 400 ms or worse.
    Poor,
    /// Round trips under 400 ms.
    Fair,
    /// Round trips under 150 ms.
    Good,
    /// Round trips under 50 ms.
    Excellent,
}

impl ConnectionStatus {
    /// Map a reported round trip to a status bucket.
    pub fn from_round_trip(ms: f64) -> Self {
        if ms < 50.0 {
            ConnectionStatus::Excellent
        } else if ms < 150.0 {
            ConnectionStatus::Good
        } else if ms < 400.0 {
            ConnectionStatus::Fair
        } else {
            ConnectionStatus::Poor
        }
    }
}

/// Disconnect reason sent on a version the server refuses.
pub const REASON_VERSION_MISMATCH: &str = "version mismatch";
/// Disconnect reason sent on a failed password exchange.
pub const REASON_BAD_PASSWORD: &str = "bad password";
/// Disconnect reason sent when the name is already connected.
pub const REASON_DUPLICATE_NAME: &str = "duplicate name";
/// Disconnect reason sent to a banned name.
pub const REASON_BANNED: &str = "banned";
/// Disconnect reason sent when the table is full.
pub const REASON_SERVER_FULL: &str = "server full";
/// Disconnect reason broadcast on server shutdown.
pub const REASON_SHUTDOWN: &str = "server shutting down";
/// Disconnect reason recorded for an orderly client exit.
pub const REASON_LEFT: &str = "left";
/// Disconnect reason recorded when the socket just died.
pub const REASON_CONNECTION_LOST: &str = "connection lost";

// Argument keys the protocol commands agree on, both sides.
pub(crate) const ARG_NAME: &str = "name";
pub(crate) const ARG_SERVER: &str = "server";
pub(crate) const ARG_VERSION: &str = "version";
pub(crate) const ARG_NONCE: &str = "nonce";
pub(crate) const ARG_REASON: &str = "reason";
pub(crate) const ARG_KEEP_ALIVE: &str = "keep_alive_ms";
pub(crate) const ARG_TIME: &str = "time";
pub(crate) const ARG_DIGEST: &str = "digest";
pub(crate) const ARG_ROUND_TRIP: &str = "round_trip_ms";
pub(crate) const ARG_TARGET: &str = "target";
pub(crate) const ARG_METHOD: &str = "method";
pub(crate) const ARG_CALL: &str = "call";
pub(crate) const ARG_ARGS: &str = "args";
pub(crate) const ARG_RESULT: &str = "result";
pub(crate) const ARG_MESSAGE: &str = "message";

// =============================================================================
// EVENTS
// =============================================================================

/// What a running server surfaces to the embedding game.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client finished the handshake with a fresh session.
    Connected {
        /// Assigned session name.
        name: String,
    },

    /// A disconnected client reattached to its session.
    Reconnected {
        /// Session name.
        name: String,
    },

    /// A live session lost its socket; it stays around for reconnection.
    Disconnected {
        /// Session name.
        name: String,
        /// Reason received or inferred.
        reason: String,
    },

    /// A session was removed and its name banned.
    Kicked {
        /// Session name.
        name: String,
        /// Reason sent to the client.
        reason: String,
    },

    /// An application command arrived.
    Command {
        /// Sending session.
        from: String,
        /// The command itself.
        command: Command,
    },

    /// A client wrote a session property.
    PropertyChanged {
        /// Session name.
        name: String,
        /// Property key.
        key: String,
        /// New value.
        value: Value,
    },

    /// A client's connection quality moved to a different bucket.
    StatusChanged {
        /// Session name.
        name: String,
        /// New bucket.
        status: ConnectionStatus,
    },
}

/// What a connected client surfaces to the embedding game.
#[derive(Debug)]
pub enum ClientEvent {
    /// The server closed the session.
    Disconnected {
        /// Reason the server sent, or a local description.
        reason: String,
    },

    /// An application command arrived.
    Command(Command),

    /// The server wrote a session property.
    PropertyChanged {
        /// Property key.
        key: String,
        /// New value.
        value: Value,
    },

    /// The measured link quality moved to a different bucket.
    StatusChanged(ConnectionStatus),
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name the server announces in its accept command.
    pub server_name: String,
    /// Bind address, `host:port`.
    pub bind_addr: String,
    /// Protocol version; clients must match it exactly.
    pub version: String,
    /// Most concurrently connected clients.
    pub max_clients: usize,
    /// Shared secret enabling stream encryption. Without one, streams run
    /// through the bit packer instead.
    pub cipher_secret: Option<String>,
    /// Password clients must answer for during the handshake.
    pub password: Option<String>,
    /// Per-step handshake and write timeout.
    pub socket_timeout: Duration,
    /// Keep-alive interval announced to clients.
    pub keep_alive: Duration,
    /// Largest command frame accepted.
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "parlor".to_string(),
            bind_addr: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_clients: 32,
            cipher_secret: None,
            password: None,
            socket_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity to connect under; also the reconnect identity.
    pub name: String,
    /// Protocol version; must match the server exactly.
    pub version: String,
    /// Shared secret enabling stream encryption; must match the server's
    /// choice of transport.
    pub cipher_secret: Option<String>,
    /// Password answer, when the server challenges.
    pub password: Option<String>,
    /// Handshake step timeout.
    pub socket_timeout: Duration,
    /// Session attributes delivered with the connect command.
    pub attributes: BTreeMap<String, Value>,
    /// Largest command frame accepted.
    pub max_frame: usize,
}

impl ClientConfig {
    /// Configuration for `name` with everything else defaulted.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            cipher_secret: None,
            password: None,
            socket_timeout: Duration::from_secs(10),
            attributes: BTreeMap::new(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

// =============================================================================
// LINK LIVENESS
// =============================================================================

/// How long an established connection may stay silent inbound before it
/// is written off as lost.
///
/// A healthy link carries keep-alive traffic once per interval; the
/// limit is three intervals, floored at the socket timeout. No
/// keep-alive interval means no limit.
pub(crate) fn quiet_limit(
    keep_alive: Option<Duration>,
    socket_timeout: Duration,
) -> Option<Duration> {
    keep_alive.map(|interval| socket_timeout.max(interval * 3))
}

/// Sleeps until `from + limit`, or forever when there is no limit.
pub(crate) async fn quiet_elapsed(limit: Option<Duration>, from: Instant) {
    match limit {
        Some(limit) => tokio::time::sleep_until(from + limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_buckets() {
        assert_eq!(
            ConnectionStatus::from_round_trip(10.0),
            ConnectionStatus::Excellent
        );
        assert_eq!(
            ConnectionStatus::from_round_trip(90.0),
            ConnectionStatus::Good
        );
        assert_eq!(
            ConnectionStatus::from_round_trip(200.0),
            ConnectionStatus::Fair
        );
        assert_eq!(
            ConnectionStatus::from_round_trip(1500.0),
            ConnectionStatus::Poor
        );
    }

    #[test]
    fn test_status_ordering() {
        assert!(ConnectionStatus::Excellent > ConnectionStatus::Poor);
        assert!(ConnectionStatus::Unknown < ConnectionStatus::Poor);
    }

    #[test]
    fn test_quiet_limit_follows_keep_alive() {
        let timeout = Duration::from_secs(10);
        assert_eq!(quiet_limit(None, timeout), None);
        assert_eq!(
            quiet_limit(Some(Duration::from_secs(5)), timeout),
            Some(Duration::from_secs(15))
        );
        assert_eq!(
            quiet_limit(Some(Duration::from_secs(1)), timeout),
            Some(timeout)
        );
    }

    #[test]
    fn test_default_configs_are_usable() {
        let server = ServerConfig::default();
        assert!(server.max_clients > 0);
        assert!(server.password.is_none());

        let client = ClientConfig::named("bob");
        assert_eq!(client.name, "bob");
        assert_eq!(client.version, server.version);
    }
}
