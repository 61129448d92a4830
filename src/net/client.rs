//! Table Client
//!
//! Client session against a [`Server`](crate::net::Server). One `Client`
//! owns one identity: `connect` walks the handshake, `reconnect` returns
//! to the last address under the same name, and the server rebinds the
//! lingering session. Keep-alive pings ride the outbound queue's idle
//! hook, and each echo feeds the link quality estimate.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::net::queue::{QueueError, SendQueue};
use crate::net::remote::{self, CallTable, RemoteCall, RemoteError, RemoteRegistry};
use crate::net::transport::{self, WireStream};
use crate::net::{
    quiet_elapsed, quiet_limit, ClientConfig, ClientEvent, ConnectionStatus, SessionState,
    ARG_DIGEST, ARG_KEEP_ALIVE, ARG_NAME, ARG_NONCE, ARG_REASON, ARG_ROUND_TRIP, ARG_SERVER,
    ARG_TIME, ARG_VERSION, REASON_CONNECTION_LOST,
};
use crate::wire::codec::CodecError;
use crate::wire::command::{
    KIND_ACCEPT, KIND_CHALLENGE, KIND_CONNECT, KIND_DISCONNECT, KIND_FAULT, KIND_INVOKE,
    KIND_PASSWORD, KIND_PING, KIND_PROPERTY, KIND_REPLY, KIND_SPEED,
};
use crate::wire::{Command, CommandCodec, CommandSet, Value};

const EVENT_BUFFER: usize = 256;

type CommandStream = Framed<WireStream<TcpStream>, CommandCodec>;

// =============================================================================
// ERRORS
// =============================================================================

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Dialing or socket setup failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The wire itself failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server closed the socket mid-handshake.
    #[error("connection closed during the handshake")]
    Closed,

    /// A handshake step outlived the socket timeout.
    #[error("handshake step timed out")]
    TimedOut,

    /// The server sent the wrong command for the current step.
    #[error("expected `{expected}`, got `{got}`")]
    Unexpected {
        /// Kind the step required.
        expected: &'static str,
        /// Kind that actually arrived.
        got: String,
    },

    /// A required argument was missing from a server command.
    #[error("handshake command missing `{0}`")]
    MissingArg(&'static str),

    /// The server demands a password and none is configured.
    #[error("server asked for a password but none is configured")]
    MissingPassword,

    /// The server turned the connection away.
    #[error("connection refused: {0}")]
    Refused(String),

    /// This client already holds a live connection.
    #[error("client is already connected")]
    AlreadyConnected,

    /// `reconnect` was called before any successful `connect`.
    #[error("no earlier connection to return to")]
    NeverConnected,
}

/// Errors surfaced by operations on a connected client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The outbound queue refused the command.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A remote call could not be built.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

// =============================================================================
// CLIENT
// =============================================================================

struct ClientInner {
    config: ClientConfig,
    name: RwLock<String>,
    server_name: RwLock<String>,
    addr: RwLock<Option<SocketAddr>>,
    state: RwLock<SessionState>,
    status: RwLock<ConnectionStatus>,
    round_trip: RwLock<Option<f64>>,
    properties: RwLock<BTreeMap<String, Value>>,
    commands: RwLock<CommandSet>,
    queue: SendQueue,
    calls: CallTable,
    registry: RemoteRegistry,
    event_tx: RwLock<Option<mpsc::Sender<ClientEvent>>>,
    epoch: AtomicU64,
    base: Instant,
}

/// A client session. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client from configuration without touching the network.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: RwLock::new(config.name.clone()),
                server_name: RwLock::new(String::new()),
                addr: RwLock::new(None),
                state: RwLock::new(SessionState::Unknown),
                status: RwLock::new(ConnectionStatus::Unknown),
                round_trip: RwLock::new(None),
                properties: RwLock::new(BTreeMap::new()),
                commands: RwLock::new(CommandSet::new()),
                queue: SendQueue::new(),
                calls: CallTable::new(),
                registry: RemoteRegistry::new(),
                event_tx: RwLock::new(None),
                epoch: AtomicU64::new(0),
                base: Instant::now(),
                config,
            }),
        }
    }

    /// Allow an application command kind on the wire.
    ///
    /// Must happen before [`connect`](Self::connect); the codec snapshots
    /// the set when the socket is wrapped.
    pub async fn register_kind(&self, kind: impl Into<String>) {
        self.inner.commands.write().await.register(kind);
    }

    /// Targets callable from the server.
    pub fn registry(&self) -> RemoteRegistry {
        self.inner.registry.clone()
    }

    /// Dial the server and walk the handshake. On success the reader task
    /// is spawned and the event stream for this connection is returned.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
    ) -> Result<mpsc::Receiver<ClientEvent>, ConnectError> {
        let inner = &self.inner;
        if inner.queue.is_running() {
            return Err(ConnectError::AlreadyConnected);
        }
        let config = &inner.config;
        let step = config.socket_timeout;

        let socket = match timeout(step, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return Err(ConnectError::Io(err)),
            Err(_) => return Err(ConnectError::TimedOut),
        };
        let _ = socket.set_nodelay(true);
        let peer = socket.peer_addr()?;

        let wrapped = timeout(step, transport::wrap(socket, config.cipher_secret.as_deref())).await;
        let mut wrapped = match wrapped {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ConnectError::Io(err)),
            Err(_) => return Err(ConnectError::TimedOut),
        };
        match timeout(step, transport::send_magic(&mut wrapped)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ConnectError::Io(err)),
            Err(_) => return Err(ConnectError::TimedOut),
        }

        let codec = CommandCodec::new(Arc::new(inner.commands.read().await.clone()))
            .with_max_frame(config.max_frame);
        let mut framed = Framed::new(wrapped, codec);

        let mut connect = Command::new(KIND_CONNECT)
            .with(ARG_NAME, config.name.as_str())
            .with(ARG_VERSION, config.version.as_str());
        for (key, value) in &config.attributes {
            connect.set(key.clone(), value.clone());
        }
        send_step(&mut framed, step, connect).await?;

        let mut response = next_step(&mut framed, step).await?;
        if response.kind() == KIND_CHALLENGE {
            let nonce = response
                .get_str(ARG_NONCE)
                .ok_or(ConnectError::MissingArg("nonce"))?;
            let password = config
                .password
                .as_deref()
                .ok_or(ConnectError::MissingPassword)?;
            let answer = Command::new(KIND_PASSWORD)
                .with(ARG_DIGEST, transport::password_digest(nonce, password));
            send_step(&mut framed, step, answer).await?;
            response = next_step(&mut framed, step).await?;
        }

        match response.kind() {
            KIND_ACCEPT => {}
            KIND_DISCONNECT => {
                let reason = response.get_str(ARG_REASON).unwrap_or("unspecified");
                return Err(ConnectError::Refused(reason.to_string()));
            }
            other => {
                return Err(ConnectError::Unexpected {
                    expected: KIND_ACCEPT,
                    got: other.to_string(),
                });
            }
        }

        // The server may hand out a different name than the one asked for.
        let assigned = response
            .get_str(ARG_NAME)
            .unwrap_or(config.name.as_str())
            .to_string();
        let server_name = response.get_str(ARG_SERVER).unwrap_or("").to_string();
        let keep_alive = response
            .get_i64(ARG_KEEP_ALIVE)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));

        let reconnected = !matches!(*inner.state.read().await, SessionState::Unknown);
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        *inner.name.write().await = assigned.clone();
        *inner.server_name.write().await = server_name.clone();
        *inner.addr.write().await = Some(peer);
        *inner.state.write().await = if reconnected {
            SessionState::Reconnected
        } else {
            SessionState::Connected
        };
        *inner.status.write().await = ConnectionStatus::Unknown;
        *inner.round_trip.write().await = None;
        *inner.event_tx.write().await = Some(event_tx.clone());

        let (sink, stream) = framed.split();
        inner.queue.start(sink).await;

        match keep_alive {
            Some(interval) => {
                let base = inner.base;
                let hook = Box::new(move || {
                    Some(
                        Command::new(KIND_PING)
                            .with(ARG_TIME, base.elapsed().as_millis() as i64),
                    )
                });
                inner.queue.set_idle(interval, hook).await;
            }
            None => inner.queue.clear_idle().await,
        }

        info!("Connected to {} at {} as {}", server_name, peer, assigned);
        tokio::spawn(Self::read_loop(
            Arc::clone(&self.inner),
            stream,
            event_tx,
            epoch,
            quiet_limit(keep_alive, config.socket_timeout),
        ));
        Ok(event_rx)
    }

    /// Dial the address of the last successful connection again. The
    /// server rebinds the lingering session under the same name.
    pub async fn reconnect(&self) -> Result<mpsc::Receiver<ClientEvent>, ConnectError> {
        let addr = self
            .inner
            .addr
            .read()
            .await
            .ok_or(ConnectError::NeverConnected)?;
        self.connect(addr).await
    }

    /// Tell the server why we are leaving, then drop the connection.
    ///
    /// Quiet when nothing is connected, so it is safe to call on any
    /// teardown path.
    pub async fn disconnect(&self, reason: &str) {
        let inner = &self.inner;
        if !inner.queue.is_running() {
            return;
        }

        let farewell = Command::new(KIND_DISCONNECT).with(ARG_REASON, reason);
        let _ = inner.queue.push(farewell).await;

        // Stale-ify the reader before tearing down, so its own exit path
        // does not report a second disconnect.
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.queue.stop(inner.config.socket_timeout).await;
        inner.calls.cancel_all().await;
        *inner.state.write().await = SessionState::Disconnected;

        let tx = inner.event_tx.read().await.clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(ClientEvent::Disconnected {
                    reason: reason.to_string(),
                })
                .await;
        }
        info!("Disconnected ({})", reason);
    }

    // -------------------------------------------------------------------------
    // reader
    // -------------------------------------------------------------------------

    async fn read_loop(
        inner: Arc<ClientInner>,
        mut stream: SplitStream<CommandStream>,
        events: mpsc::Sender<ClientEvent>,
        epoch: u64,
        quiet: Option<Duration>,
    ) {
        let mut last_inbound = Instant::now();
        let reason = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(command)) => {
                        last_inbound = Instant::now();
                        if let Some(reason) = Self::handle_command(&inner, command, &events).await {
                            break reason;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("Protocol error from server: {}", err);
                        break REASON_CONNECTION_LOST.to_string();
                    }
                    None => break REASON_CONNECTION_LOST.to_string(),
                },
                _ = inner.queue.closed() => {
                    warn!("Outbound queue died, dropping the connection");
                    break REASON_CONNECTION_LOST.to_string();
                }
                _ = quiet_elapsed(quiet, last_inbound) => {
                    warn!("Nothing heard from the server within the quiet limit");
                    break REASON_CONNECTION_LOST.to_string();
                }
            }
        };

        // A newer connection may own this client by now; only the holder
        // of the current epoch is allowed to tear it down.
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Reader superseded by a newer connection");
            return;
        }

        inner.queue.stop(inner.config.socket_timeout).await;
        inner.calls.cancel_all().await;
        *inner.state.write().await = SessionState::Disconnected;
        info!("Connection ended ({})", reason);
        let _ = events.send(ClientEvent::Disconnected { reason }).await;
    }

    /// Absorb one inbound command. Returns the disconnect reason when the
    /// command ends the connection.
    async fn handle_command(
        inner: &Arc<ClientInner>,
        command: Command,
        events: &mpsc::Sender<ClientEvent>,
    ) -> Option<String> {
        match command.kind() {
            // Echo of our own keep-alive; the payload is the send time.
            KIND_PING => {
                if let Some(sent) = command.get_i64(ARG_TIME) {
                    let now = inner.base.elapsed().as_millis() as i64;
                    let trip = (now - sent).max(0) as f64;
                    *inner.round_trip.write().await = Some(trip);

                    // Every echo reports the measurement; both sides bucket
                    // it themselves and only announce bucket changes.
                    let report = Command::new(KIND_SPEED).with(ARG_ROUND_TRIP, trip);
                    let _ = inner.queue.push(report).await;

                    let status = ConnectionStatus::from_round_trip(trip);
                    let changed = {
                        let mut current = inner.status.write().await;
                        if *current == status {
                            false
                        } else {
                            *current = status;
                            true
                        }
                    };
                    if changed {
                        let _ = events.send(ClientEvent::StatusChanged(status)).await;
                    }
                }
                None
            }
            KIND_PROPERTY => {
                {
                    let mut properties = inner.properties.write().await;
                    for (key, value) in command.args() {
                        properties.insert(key.to_string(), value.clone());
                    }
                }
                for (key, value) in command.args() {
                    let _ = events
                        .send(ClientEvent::PropertyChanged {
                            key: key.to_string(),
                            value: value.clone(),
                        })
                        .await;
                }
                None
            }
            KIND_INVOKE => {
                let caller = inner.server_name.read().await.clone();
                if let Some(response) = inner.registry.dispatch(&caller, &command).await {
                    let _ = inner.queue.push(response).await;
                }
                None
            }
            KIND_REPLY | KIND_FAULT => {
                if !inner.calls.resolve(&command).await {
                    warn!("Uncorrelated `{}` from server", command.kind());
                }
                None
            }
            KIND_DISCONNECT => {
                let reason = command.get_str(ARG_REASON).unwrap_or(REASON_CONNECTION_LOST);
                Some(reason.to_string())
            }
            // Remaining protocol kinds never travel server to client after
            // the handshake.
            _ if command.is_protocol() => {
                warn!("Unexpected command `{}` from server", command.kind());
                None
            }
            _ => {
                let _ = events.send(ClientEvent::Command(command)).await;
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // operations
    // -------------------------------------------------------------------------

    /// Queue a command for the server.
    pub async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.inner.queue.push(command).await?;
        Ok(())
    }

    /// Invoke a method on a server-side target without waiting for a
    /// result.
    pub async fn call(
        &self,
        target: &str,
        method: u16,
        args: &[Value],
    ) -> Result<(), ClientError> {
        let command =
            remote::invoke_command(target, method, args, None).map_err(RemoteError::from)?;
        self.inner.queue.push(command).await?;
        Ok(())
    }

    /// Invoke a method on a server-side target and obtain a handle on the
    /// result.
    pub async fn call_with_result(
        &self,
        target: &str,
        method: u16,
        args: &[Value],
    ) -> Result<RemoteCall, ClientError> {
        let (id, handle) = self.inner.calls.open().await;
        let command =
            remote::invoke_command(target, method, args, Some(&id)).map_err(RemoteError::from)?;
        if let Err(err) = self.inner.queue.push(command).await {
            self.inner.calls.abandon(&id).await;
            return Err(err.into());
        }
        Ok(handle)
    }

    /// Write a session property and mirror it to the server.
    pub async fn set_property(
        &self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), ClientError> {
        let key = key.into();
        let command = Command::new(KIND_PROPERTY).with(key.clone(), value.clone());
        self.inner.queue.push(command).await?;
        self.inner.properties.write().await.insert(key, value);
        Ok(())
    }

    /// Locally mirrored session property.
    pub async fn property(&self, key: &str) -> Option<Value> {
        self.inner.properties.read().await.get(key).cloned()
    }

    /// Snapshot of every mirrored session property.
    pub async fn properties(&self) -> BTreeMap<String, Value> {
        self.inner.properties.read().await.clone()
    }

    /// Name the server accepted us under.
    pub async fn name(&self) -> String {
        self.inner.name.read().await.clone()
    }

    /// Name the server announced in its accept command.
    pub async fn server_name(&self) -> String {
        self.inner.server_name.read().await.clone()
    }

    /// Where this session stands in its lifecycle.
    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    /// Link quality bucket from the latest keep-alive round trip.
    pub async fn status(&self) -> ConnectionStatus {
        *self.inner.status.read().await
    }

    /// Latest measured round trip in milliseconds.
    pub async fn round_trip(&self) -> Option<f64> {
        *self.inner.round_trip.read().await
    }

    /// Whether the outbound queue currently has a live connection.
    pub fn is_connected(&self) -> bool {
        self.inner.queue.is_running()
    }
}

async fn next_step(framed: &mut CommandStream, step: Duration) -> Result<Command, ConnectError> {
    match timeout(step, framed.next()).await {
        Ok(Some(Ok(command))) => Ok(command),
        Ok(Some(Err(err))) => Err(ConnectError::Codec(err)),
        Ok(None) => Err(ConnectError::Closed),
        Err(_) => Err(ConnectError::TimedOut),
    }
}

async fn send_step(
    framed: &mut CommandStream,
    step: Duration,
    command: Command,
) -> Result<(), ConnectError> {
    match timeout(step, framed.send(command)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ConnectError::Codec(err)),
        Err(_) => Err(ConnectError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = Client::new(ClientConfig::named("ada"));
        let err = client.send(Command::new("deal")).await.unwrap_err();
        assert!(matches!(err, ClientError::Queue(QueueError::NotRunning)));
    }

    #[tokio::test]
    async fn test_reconnect_needs_an_earlier_address() {
        let client = Client::new(ClientConfig::named("ada"));
        assert!(matches!(
            client.reconnect().await,
            Err(ConnectError::NeverConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_quiet() {
        let client = Client::new(ClientConfig::named("ada"));
        client.disconnect("left").await;
        assert_eq!(client.state().await, SessionState::Unknown);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_needs_a_server_behind_the_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let client = Client::new(ClientConfig::named("ada"));
        assert!(client.connect(addr).await.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_silent_server_is_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server half that answers the handshake, announces keep-alives,
        // and then goes mute without ever echoing one.
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut wrapped = transport::wrap(socket, None).await.unwrap();
            transport::expect_magic(&mut wrapped).await.unwrap();
            let mut framed =
                Framed::new(wrapped, CommandCodec::new(Arc::new(CommandSet::new())));
            let connect = framed.next().await.unwrap().unwrap();
            assert_eq!(connect.kind(), KIND_CONNECT);
            let accept = Command::new(KIND_ACCEPT)
                .with(ARG_NAME, "ada")
                .with(ARG_SERVER, "mute")
                .with(ARG_KEEP_ALIVE, 40_i64);
            framed.send(accept).await.unwrap();
            std::future::pending::<()>().await;
        });

        let config = ClientConfig {
            socket_timeout: Duration::from_millis(150),
            ..ClientConfig::named("ada")
        };
        let client = Client::new(config);
        let mut events = client.connect(addr).await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ClientEvent::Disconnected { reason } => {
                assert_eq!(reason, REASON_CONNECTION_LOST);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!client.is_connected());
    }
}
