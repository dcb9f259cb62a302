//! TCP side of the mediator: accept loop and per-connection command handler

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::lobby::{self, LobbyError, LobbyQuery};
use crate::protocol::{self, Command, MIN_CLIENT_VERSION, SERVER_VERSION};
use crate::registry::{Registry, ReplyChannel, ServerRecord};
use crate::version::{self, VersionError};

/// How long a peer may take to send each argument line of a command
pub const ARGUMENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Mediator configuration, fixed at startup
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// TCP and UDP port to listen on
    pub listen_port: u16,
    /// Answer `lobby2` requests
    pub lobby_enabled: bool,
    /// Testing mode for debugging tools (also enables the lobby)
    pub testing: bool,
    /// Display name reported in testing mode
    pub name: String,
    /// Version reported to peers
    pub version: String,
    /// Oldest client version accepted by `reg2`
    pub min_client_version: String,
    /// Maximum concurrent TCP connections
    pub max_connections: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            listen_port: 6510,
            lobby_enabled: true,
            testing: false,
            name: String::new(),
            version: SERVER_VERSION.to_string(),
            min_client_version: MIN_CLIENT_VERSION.to_string(),
            max_connections: 10000,
        }
    }
}

/// Mediator metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub active_connections: AtomicUsize,
    pub total_connections: AtomicU64,
    pub punches: AtomicU64,
    pub failed_connects: AtomicU64,
    pub lobby_requests: AtomicU64,
    pub udp_datagrams: AtomicU64,
    pub udp_errors: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_ended(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn punch_completed(&self) {
        self.punches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.failed_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lobby_requested(&self) {
        self.lobby_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_received(&self) {
        self.udp_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_rejected(&self) {
        self.udp_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_occurred(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            punches: self.punches.load(Ordering::Relaxed),
            failed_connects: self.failed_connects.load(Ordering::Relaxed),
            lobby_requests: self.lobby_requests.load(Ordering::Relaxed),
            udp_datagrams: self.udp_datagrams.load(Ordering::Relaxed),
            udp_errors: self.udp_errors.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub punches: u64,
    pub failed_connects: u64,
    pub lobby_requests: u64,
    pub udp_datagrams: u64,
    pub udp_errors: u64,
    pub errors: u64,
}

/// Shared server state
pub struct ServerState {
    pub config: MediatorConfig,
    pub registry: Arc<Registry>,
    pub metrics: Arc<ServerMetrics>,
}

impl ServerState {
    pub fn new(config: MediatorConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }
}

/// Reasons a connection ends other than an orderly close between commands
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for argument of {0:?}")]
    ArgumentTimeout(Command),

    #[error("Peer closed connection in the middle of {0:?}")]
    Truncated(Command),

    #[error("Client version {version} is older than {minimum}")]
    VersionRejected { version: String, minimum: String },

    #[error(transparent)]
    InvalidVersion(#[from] VersionError),

    #[error(transparent)]
    InvalidLobbyQuery(#[from] LobbyError),

    #[error("Failed to serialize lobby: {0}")]
    Lobby(#[from] serde_json::Error),
}

/// Run the TCP accept loop
pub async fn run_server(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "TCP listener ready");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Shutdown signal received, stopping TCP accept loop");
                    break;
                }
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let state = Arc::clone(&state);

                        let active = state.metrics.active_connections.load(Ordering::Relaxed);
                        if active >= state.config.max_connections {
                            tracing::warn!(active, max = state.config.max_connections, "Connection limit reached");
                            drop(stream);
                            continue;
                        }

                        // Punch packets are tiny and must not sit in Nagle's buffer
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY");
                        }

                        // Counted before spawning so a burst cannot overshoot the limit
                        state.metrics.connection_started();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_connection(reader, writer, peer_addr, &state).await;
                            state.metrics.connection_ended();
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Serve one peer connection until it closes or fails, then release
/// everything it registered.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer_addr: SocketAddr,
    state: &ServerState,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tracing::debug!(%peer_addr, "Connected");

    let mut connection = Connection::new(reader, writer, peer_addr, state);
    match connection.run().await {
        Ok(()) => tracing::debug!(%peer_addr, "Disconnected"),
        Err(e @ ConnectionError::VersionRejected { .. }) => {
            tracing::debug!(%peer_addr, error = %e, "Server not accepted");
        }
        Err(e) => {
            tracing::debug!(%peer_addr, error = %e, "Disconnected with error");
            if matches!(e, ConnectionError::Io(_) | ConnectionError::Lobby(_)) {
                state.metrics.error_occurred();
            }
        }
    }

    connection.teardown().await;
}

/// Per-connection protocol state
struct Connection<'a, R> {
    lines: BufReader<R>,
    reply: ReplyChannel,
    peer_addr: SocketAddr,
    peer_ip: String,
    /// Set once this connection completed `reg2`
    is_server: bool,
    state: &'a ServerState,
}

impl<'a, R> Connection<'a, R>
where
    R: AsyncRead + Unpin,
{
    fn new<W>(reader: R, writer: W, peer_addr: SocketAddr, state: &'a ServerState) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            lines: BufReader::new(reader),
            reply: ReplyChannel::new(writer, peer_addr),
            peer_addr,
            peer_ip: peer_ip(peer_addr),
            is_server: false,
            state,
        }
    }

    /// Process commands in arrival order. Returns `Ok` when the peer closes
    /// the connection between commands.
    async fn run(&mut self) -> Result<(), ConnectionError> {
        while let Some(line) = self.read_line().await? {
            let Some(command) = Command::parse(&line) else {
                tracing::trace!(peer_addr = %self.peer_addr, line = %line, "Ignoring unknown command");
                continue;
            };

            let args = self.read_arguments(command).await?;
            self.dispatch(command, args).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, command: Command, args: Vec<String>) -> Result<(), ConnectionError> {
        match command {
            Command::Register => self.register_server(args).await,
            Command::Connect => {
                let target = args.into_iter().next().unwrap_or_default();
                self.connect(&target).await
            }
            Command::Lobby => self.send_lobby(args).await,
            Command::IsTesting => {
                let packet = protocol::is_testing_packet(self.state.config.testing);
                Ok(self.reply.send(&packet).await?)
            }
            Command::TestingInfos => {
                let config = &self.state.config;
                let info = config
                    .testing
                    .then(|| (config.name.as_str(), config.version.as_str(), config.min_client_version.as_str()));
                if info.is_some() {
                    tracing::debug!(peer_addr = %self.peer_addr, "Sending testing information");
                }
                Ok(self.reply.send(&protocol::testing_infos_packet(info)).await?)
            }
            Command::Version => {
                tracing::debug!(peer_addr = %self.peer_addr, "Sending version information");
                let packet = protocol::version_packet(&self.state.config.version);
                Ok(self.reply.send(&packet).await?)
            }
        }
    }

    /// `reg2`: version-gated completion of a server registration
    async fn register_server(&mut self, args: Vec<String>) -> Result<(), ConnectionError> {
        let mut args = args.into_iter();
        let version = args.next().unwrap_or_default();
        let minimum = &self.state.config.min_client_version;

        tracing::debug!(peer_addr = %self.peer_addr, %version, "Server wants to register");

        if version::compare(&version, minimum)?.is_lt() {
            return Err(ConnectionError::VersionRejected {
                version,
                minimum: minimum.clone(),
            });
        }

        let data: [String; 8] = std::array::from_fn(|_| args.next().unwrap_or_default());
        tracing::debug!(peer_addr = %self.peer_addr, ?data, "Server data");

        self.is_server = true;
        {
            let mut record = self.state.registry.get_or_create_server(&self.peer_ip);
            record.reply = Some(self.reply.clone());
            record.data = data;
        }

        tracing::info!(peer_addr = %self.peer_addr, "Server registered");
        Ok(())
    }

    /// `connect`: hand both peers each other's public endpoint
    async fn connect(&self, target_ip: &str) -> Result<(), ConnectionError> {
        tracing::info!(peer_addr = %self.peer_addr, target = target_ip, "Connecting");

        let registry = &self.state.registry;
        let (server_port, server_channel) = match registry.server(target_ip) {
            Some(ServerRecord { port, reply: Some(reply), .. }) if !reply.is_closed() => (port, reply),
            Some(_) => {
                tracing::info!(peer_addr = %self.peer_addr, target = target_ip, "Connection failed, server not reachable");
                return self.connect_failed().await;
            }
            None => {
                tracing::info!(peer_addr = %self.peer_addr, target = target_ip, "Connection failed, server not found");
                return self.connect_failed().await;
            }
        };

        let client_port = registry.get_or_create_client(&self.peer_ip).port;

        tracing::debug!(peer_addr = %self.peer_addr, target = target_ip, port = server_port, "Sending server port to client");
        self.reply
            .send(&protocol::punch_packet(target_ip, server_port))
            .await?;

        tracing::debug!(peer_addr = %self.peer_addr, target = target_ip, port = client_port, "Sending client port to server");
        if let Err(e) = server_channel
            .send(&protocol::punch_packet(&self.peer_ip, client_port))
            .await
        {
            tracing::warn!(peer_addr = %self.peer_addr, target = target_ip, error = %e, "Failed to notify server");
        }

        registry.remove_client(&self.peer_ip);
        self.state.metrics.punch_completed();
        tracing::info!(peer_addr = %self.peer_addr, target = target_ip, "Connected");
        Ok(())
    }

    async fn connect_failed(&self) -> Result<(), ConnectionError> {
        self.state.metrics.connect_failed();
        Ok(self.reply.send(&protocol::connect_failed_packet()).await?)
    }

    /// `lobby2`: filtered, sorted listing of confirmed servers
    async fn send_lobby(&self, args: Vec<String>) -> Result<(), ConnectionError> {
        let config = &self.state.config;
        if !config.lobby_enabled && !config.testing {
            tracing::debug!(peer_addr = %self.peer_addr, "Lobby disabled, ignoring request");
            return Ok(());
        }

        let query = LobbyQuery::from_arguments(&args)?;
        tracing::debug!(peer_addr = %self.peer_addr, ?query, "Sending lobby");

        let snapshot = self.state.registry.snapshot_servers();
        let entries = lobby::query(snapshot.iter().map(|(_, record)| record), &query);
        let packet = protocol::lobby_packet(&entries)?;

        self.state.metrics.lobby_requested();
        Ok(self.reply.send(&packet).await?)
    }

    /// Next top-level line, or `None` on orderly close. No timeout: a
    /// registered server idles here until a client asks for it.
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        if self.lines.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(protocol::sanitize_line(&String::from_utf8_lossy(&buf))))
    }

    async fn read_arguments(&mut self, command: Command) -> Result<Vec<String>, ConnectionError> {
        let count = command.argument_count();
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            match timeout(ARGUMENT_TIMEOUT, self.read_line()).await {
                Ok(Ok(Some(line))) => args.push(line),
                Ok(Ok(None)) => return Err(ConnectionError::Truncated(command)),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ConnectionError::ArgumentTimeout(command)),
            }
        }
        Ok(args)
    }

    /// Close the socket and drop the server registration it owned.
    async fn teardown(self) {
        self.reply.close().await;
        if self.is_server && self.state.registry.release_server(&self.peer_ip, &self.reply) {
            tracing::info!(peer_addr = %self.peer_addr, "Server deleted");
        }
    }
}

/// Registry key for a peer: its IP, with IPv4-mapped IPv6 unwrapped
pub fn peer_ip(addr: SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}
