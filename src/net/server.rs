//! Table Server
//!
//! TCP server hosting one table. Each accepted socket is wrapped, walked
//! through the handshake, and attached to a session with its own reader
//! task and outbound queue. Protocol commands are absorbed here; anything
//! the embedding game registered flows out as a [`ServerEvent`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

use crate::net::queue::{QueueError, SendQueue};
use crate::net::remote::{self, CallTable, RemoteCall, RemoteError, RemoteRegistry};
use crate::net::session::{Admission, Session, SessionError, SessionTable};
use crate::net::transport::{self, WireStream};
use crate::net::{
    quiet_elapsed, quiet_limit, ServerConfig, ServerEvent, SessionState, ARG_DIGEST,
    ARG_KEEP_ALIVE, ARG_NAME, ARG_NONCE, ARG_REASON, ARG_ROUND_TRIP, ARG_SERVER, ARG_VERSION,
    REASON_BAD_PASSWORD, REASON_BANNED, REASON_CONNECTION_LOST, REASON_DUPLICATE_NAME,
    REASON_LEFT, REASON_SERVER_FULL, REASON_SHUTDOWN, REASON_VERSION_MISMATCH,
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

/// Why a handshake was turned away.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The socket closed mid-handshake.
    #[error("socket closed during handshake")]
    Closed,

    /// A handshake step outlived the socket timeout.
    #[error("handshake step timed out")]
    TimedOut,

    /// The client sent the wrong command for the current step.
    #[error("expected `{expected}`, got `{got}`")]
    Unexpected {
        /// Kind the step required.
        expected: &'static str,
        /// Kind that actually arrived.
        got: String,
    },

    /// A required argument was missing.
    #[error("connect sequence missing `{0}`")]
    MissingArg(&'static str),

    /// The client runs an incompatible version.
    #[error("client version `{0}` does not match")]
    VersionMismatch(String),

    /// The password answer did not check out.
    #[error("bad password digest")]
    BadPassword,

    /// The session table refused the identity.
    #[error(transparent)]
    Refused(#[from] SessionError),

    /// The wire itself failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced by [`Server`] operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The accept loop was already started.
    #[error("server is already running")]
    AlreadyRunning,

    /// A session lookup or admission failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A queue refused the command.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A remote call could not be built.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

// =============================================================================
// SERVER
// =============================================================================

/// The table server.
pub struct Server {
    config: ServerConfig,
    sessions: Arc<SessionTable>,
    registry: RemoteRegistry,
    commands: RwLock<CommandSet>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listening socket without accepting yet.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("{} listening on {}", config.server_name, local_addr);

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            sessions: Arc::new(SessionTable::new(config.max_clients)),
            registry: RemoteRegistry::new(),
            commands: RwLock::new(CommandSet::new()),
            listener: Mutex::new(Some(listener)),
            local_addr,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown_tx,
            config,
        })
    }

    /// Address the server actually bound, useful when the port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Allow an application command kind on the wire.
    ///
    /// Must happen before [`start`](Self::start); the codec snapshots the
    /// set when the accept loop spins up.
    pub async fn register_kind(&self, kind: impl Into<String>) {
        self.commands.write().await.register(kind);
    }

    /// Targets callable from clients.
    pub fn registry(&self) -> RemoteRegistry {
        self.registry.clone()
    }

    /// Spawn the accept loop and hand back the event stream.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<mpsc::Receiver<ServerEvent>, ServerError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        let event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        let commands = Arc::new(self.commands.read().await.clone());
        let config = self.config.clone();
        let sessions = Arc::clone(&self.sessions);
        let registry = self.registry.clone();
        let event_tx = self.event_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((socket, addr)) => {
                            let _ = socket.set_nodelay(true);
                            debug!("Connection attempt from {}", addr);
                            tokio::spawn(Self::handle_socket(
                                socket,
                                addr,
                                config.clone(),
                                Arc::clone(&sessions),
                                registry.clone(),
                                Arc::clone(&commands),
                                event_tx.clone(),
                                shutdown_tx.subscribe(),
                            ));
                        }
                        Err(err) => {
                            error!("Accept failed: {}", err);
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, closing listener");
                        break;
                    }
                }
            }
        });

        Ok(event_rx)
    }

    /// Ask every task to wind down. Connected clients get a farewell
    /// through their queues before the sockets close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // -------------------------------------------------------------------------
    // per-connection tasks
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_socket(
        socket: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        sessions: Arc<SessionTable>,
        registry: RemoteRegistry,
        commands: Arc<CommandSet>,
        events: mpsc::Sender<ServerEvent>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let step = config.socket_timeout;

        let wrapped = timeout(step, transport::wrap(socket, config.cipher_secret.as_deref())).await;
        let mut wrapped = match wrapped {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("Transport setup with {} failed: {}", addr, err);
                return;
            }
            Err(_) => {
                debug!("Transport setup with {} timed out", addr);
                return;
            }
        };

        match timeout(step, transport::expect_magic(&mut wrapped)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("Magic exchange with {} failed: {}", addr, err);
                return;
            }
            Err(_) => {
                debug!("Magic exchange with {} timed out", addr);
                return;
            }
        }

        let codec = CommandCodec::new(commands).with_max_frame(config.max_frame);
        let mut framed = Framed::new(wrapped, codec);

        let admission = match Self::handshake(&mut framed, &config, &sessions).await {
            Ok(admission) => admission,
            Err(err) => {
                debug!("Handshake with {} failed: {}", addr, err);
                return;
            }
        };

        let reconnected = admission.is_rebound();
        let session = Arc::clone(admission.session());
        let (name, epoch, queue, calls) = {
            let guard = session.read().await;
            (guard.name.clone(), guard.epoch(), guard.queue(), guard.calls())
        };

        let accept = Command::new(KIND_ACCEPT)
            .with(ARG_NAME, name.as_str())
            .with(ARG_SERVER, config.server_name.as_str())
            .with(ARG_KEEP_ALIVE, config.keep_alive.as_millis() as i64);
        match timeout(step, framed.send(accept)).await {
            Ok(Ok(())) => {}
            _ => {
                warn!("Could not deliver accept to {}", name);
                let _ = sessions.mark_disconnected(&name).await;
                return;
            }
        }

        let (sink, stream) = framed.split();
        queue.start(sink).await;

        if reconnected {
            info!("{} reconnected from {}", name, addr);
            let _ = events.send(ServerEvent::Reconnected { name: name.clone() }).await;
        } else {
            info!("{} connected from {}", name, addr);
            let _ = events.send(ServerEvent::Connected { name: name.clone() }).await;
        }

        let keep_alive = (!config.keep_alive.is_zero()).then_some(config.keep_alive);
        Self::read_loop(
            stream,
            name,
            epoch,
            session,
            sessions,
            registry,
            events,
            queue,
            calls,
            shutdown_rx,
            config.socket_timeout,
            quiet_limit(keep_alive, config.socket_timeout),
        )
        .await;
    }

    /// Walk a wrapped socket through connect, version check, optional
    /// password challenge, and identity resolution.
    async fn handshake(
        framed: &mut CommandStream,
        config: &ServerConfig,
        sessions: &SessionTable,
    ) -> Result<Admission, HandshakeError> {
        let step = config.socket_timeout;

        let connect = next_step(framed, step).await?;
        if connect.kind() != KIND_CONNECT {
            return Err(HandshakeError::Unexpected {
                expected: KIND_CONNECT,
                got: connect.kind().to_string(),
            });
        }
        let name = connect
            .get_str(ARG_NAME)
            .ok_or(HandshakeError::MissingArg("name"))?;
        let version = connect
            .get_str(ARG_VERSION)
            .ok_or(HandshakeError::MissingArg("version"))?;

        if version != config.version {
            refuse(framed, REASON_VERSION_MISMATCH).await;
            return Err(HandshakeError::VersionMismatch(version.to_string()));
        }

        if let Some(password) = &config.password {
            let nonce = transport::challenge_nonce();
            let challenge = Command::new(KIND_CHALLENGE).with(ARG_NONCE, nonce.as_str());
            send_step(framed, step, challenge).await?;

            let answer = next_step(framed, step).await?;
            if answer.kind() != KIND_PASSWORD {
                return Err(HandshakeError::Unexpected {
                    expected: KIND_PASSWORD,
                    got: answer.kind().to_string(),
                });
            }
            let digest = answer
                .get_str(ARG_DIGEST)
                .ok_or(HandshakeError::MissingArg("digest"))?;
            if digest != transport::password_digest(&nonce, password) {
                refuse(framed, REASON_BAD_PASSWORD).await;
                return Err(HandshakeError::BadPassword);
            }
        }

        let mut attributes = BTreeMap::new();
        for (key, value) in connect.args() {
            if key != ARG_NAME && key != ARG_VERSION {
                attributes.insert(key.to_string(), value.clone());
            }
        }

        match sessions.admit(name, version, attributes).await {
            Ok(admission) => Ok(admission),
            Err(err) => {
                let reason = match &err {
                    SessionError::Banned(_) => REASON_BANNED,
                    SessionError::Duplicate(_) => REASON_DUPLICATE_NAME,
                    SessionError::Full => REASON_SERVER_FULL,
                    SessionError::NotFound(_) => REASON_CONNECTION_LOST,
                };
                refuse(framed, reason).await;
                Err(HandshakeError::Refused(err))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        mut stream: SplitStream<CommandStream>,
        name: String,
        epoch: u64,
        session: Arc<RwLock<Session>>,
        sessions: Arc<SessionTable>,
        registry: RemoteRegistry,
        events: mpsc::Sender<ServerEvent>,
        queue: SendQueue,
        calls: CallTable,
        mut shutdown_rx: broadcast::Receiver<()>,
        stop_grace: Duration,
        quiet: Option<Duration>,
    ) {
        let mut last_inbound = Instant::now();
        let reason = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(command)) => {
                        last_inbound = Instant::now();
                        if session.read().await.state() == SessionState::Kicked {
                            break REASON_BANNED.to_string();
                        }
                        let outcome = Self::handle_command(
                            command, &name, &session, &registry, &events, &queue, &calls,
                        )
                        .await;
                        if let Some(reason) = outcome {
                            break reason;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("Protocol error from {}: {}", name, err);
                        break REASON_CONNECTION_LOST.to_string();
                    }
                    None => {
                        break REASON_CONNECTION_LOST.to_string();
                    }
                },
                _ = queue.closed() => {
                    warn!("Outbound queue for {} died, dropping the connection", name);
                    break REASON_CONNECTION_LOST.to_string();
                }
                _ = quiet_elapsed(quiet, last_inbound) => {
                    warn!("Nothing heard from {} within the quiet limit", name);
                    break REASON_CONNECTION_LOST.to_string();
                }
                _ = shutdown_rx.recv() => {
                    let farewell =
                        Command::new(KIND_DISCONNECT).with(ARG_REASON, REASON_SHUTDOWN);
                    let _ = queue.push(farewell).await;
                    queue.stop(stop_grace).await;
                    calls.cancel_all().await;
                    let _ = sessions.mark_disconnected(&name).await;
                    return;
                }
            }
        };

        // A newer socket may own the session by now; only the holder of
        // the current epoch is allowed to tear it down.
        if session.read().await.epoch() != epoch {
            debug!("Reader for {} superseded by a newer socket", name);
            return;
        }

        queue.stop(stop_grace).await;
        calls.cancel_all().await;
        if sessions.mark_disconnected(&name).await.is_ok() {
            info!("{} disconnected ({})", name, reason);
            let _ = events
                .send(ServerEvent::Disconnected { name, reason })
                .await;
        }
    }

    /// Absorb one inbound command. Returns the disconnect reason when the
    /// command ends the connection.
    async fn handle_command(
        command: Command,
        name: &str,
        session: &Arc<RwLock<Session>>,
        registry: &RemoteRegistry,
        events: &mpsc::Sender<ServerEvent>,
        queue: &SendQueue,
        calls: &CallTable,
    ) -> Option<String> {
        match command.kind() {
            // Pings bounce straight back with their payload intact; the
            // client computes the round trip from the echo.
            KIND_PING => {
                let _ = queue.push(command).await;
                None
            }
            KIND_SPEED => {
                if let Some(ms) = command.get_f64(ARG_ROUND_TRIP) {
                    let changed = session.write().await.report_round_trip(ms);
                    if let Some(status) = changed {
                        let _ = events
                            .send(ServerEvent::StatusChanged {
                                name: name.to_string(),
                                status,
                            })
                            .await;
                    }
                }
                None
            }
            KIND_PROPERTY => {
                {
                    let mut guard = session.write().await;
                    for (key, value) in command.args() {
                        guard.set_attribute(key, value.clone());
                    }
                }
                for (key, value) in command.args() {
                    let _ = events
                        .send(ServerEvent::PropertyChanged {
                            name: name.to_string(),
                            key: key.to_string(),
                            value: value.clone(),
                        })
                        .await;
                }
                None
            }
            KIND_INVOKE => {
                if let Some(response) = registry.dispatch(name, &command).await {
                    let _ = queue.push(response).await;
                }
                None
            }
            KIND_REPLY | KIND_FAULT => {
                if !calls.resolve(&command).await {
                    warn!("Uncorrelated `{}` from {}", command.kind(), name);
                }
                None
            }
            KIND_DISCONNECT => {
                let reason = command.get_str(ARG_REASON).unwrap_or(REASON_LEFT);
                Some(reason.to_string())
            }
            // Remaining protocol kinds belong to the handshake and have no
            // business arriving on an established connection.
            _ if command.is_protocol() => {
                warn!("Unexpected handshake command `{}` from {}", command.kind(), name);
                None
            }
            _ => {
                let _ = events
                    .send(ServerEvent::Command {
                        from: name.to_string(),
                        command,
                    })
                    .await;
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // operations
    // -------------------------------------------------------------------------

    /// Queue a command for one client.
    pub async fn send(&self, name: &str, command: Command) -> Result<(), ServerError> {
        let session = self.require(name).await?;
        let queue = session.read().await.queue();
        queue.push(command).await?;
        Ok(())
    }

    /// Queue a command for every live client.
    pub async fn broadcast(&self, command: Command) {
        for session in self.sessions.live().await {
            let queue = session.read().await.queue();
            let _ = queue.push(command.clone()).await;
        }
    }

    /// Write a session property and mirror it to the client.
    pub async fn set_property(
        &self,
        name: &str,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), ServerError> {
        let session = self.require(name).await?;
        let key = key.into();
        let queue = {
            let mut guard = session.write().await;
            guard.set_attribute(key.clone(), value.clone());
            guard.queue()
        };
        queue.push(Command::new(KIND_PROPERTY).with(key, value)).await?;
        Ok(())
    }

    /// Invoke a method on one client without waiting for a result.
    pub async fn call(
        &self,
        name: &str,
        target: &str,
        method: u16,
        args: &[Value],
    ) -> Result<(), ServerError> {
        let session = self.require(name).await?;
        let queue = session.read().await.queue();
        let command =
            remote::invoke_command(target, method, args, None).map_err(RemoteError::from)?;
        queue.push(command).await?;
        Ok(())
    }

    /// Invoke a method on one client and obtain a handle on the result.
    pub async fn call_with_result(
        &self,
        name: &str,
        target: &str,
        method: u16,
        args: &[Value],
    ) -> Result<RemoteCall, ServerError> {
        let session = self.require(name).await?;
        let (queue, calls) = {
            let guard = session.read().await;
            (guard.queue(), guard.calls())
        };
        let (id, handle) = calls.open().await;
        let command =
            remote::invoke_command(target, method, args, Some(&id)).map_err(RemoteError::from)?;
        if let Err(err) = queue.push(command).await {
            calls.abandon(&id).await;
            return Err(err.into());
        }
        Ok(handle)
    }

    /// Remove a client, ban its name, and say why on the way out.
    pub async fn kick(&self, name: &str, reason: &str) -> Result<(), ServerError> {
        let session = self.sessions.kick(name).await?;
        let (queue, calls) = {
            let guard = session.read().await;
            (guard.queue(), guard.calls())
        };
        // Whatever was queued for this client no longer matters; the
        // farewell goes out alone.
        queue.clear().await;
        let farewell = Command::new(KIND_DISCONNECT).with(ARG_REASON, reason);
        let _ = queue.push(farewell).await;
        queue.stop(self.config.socket_timeout).await;
        calls.cancel_all().await;

        warn!("Kicked {} ({})", name, reason);
        let _ = self
            .event_tx
            .send(ServerEvent::Kicked {
                name: name.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }

    /// Look up a session by name.
    pub async fn session(&self, name: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(name).await
    }

    /// Number of sessions, live or lingering.
    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    /// Names currently on live sockets.
    pub async fn live_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for session in self.sessions.live().await {
            names.push(session.read().await.name.clone());
        }
        names
    }

    async fn require(&self, name: &str) -> Result<Arc<RwLock<Session>>, ServerError> {
        self.sessions
            .get(name)
            .await
            .ok_or_else(|| ServerError::Session(SessionError::NotFound(name.to_string())))
    }
}

async fn next_step(framed: &mut CommandStream, step: Duration) -> Result<Command, HandshakeError> {
    match timeout(step, framed.next()).await {
        Ok(Some(Ok(command))) => Ok(command),
        Ok(Some(Err(err))) => Err(HandshakeError::Codec(err)),
        Ok(None) => Err(HandshakeError::Closed),
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

async fn send_step(
    framed: &mut CommandStream,
    step: Duration,
    command: Command,
) -> Result<(), HandshakeError> {
    match timeout(step, framed.send(command)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(HandshakeError::Codec(err)),
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

/// Best-effort farewell to a client the handshake is turning away.
async fn refuse(framed: &mut CommandStream, reason: &str) {
    let farewell = Command::new(KIND_DISCONNECT).with(ARG_REASON, reason);
    let _ = framed.send(farewell).await;
}
