//! GATE.PUNCH mediator
//!
//! Brokers UDP hole punching between game servers and clients behind NAT.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use gatepunch::health::{self, HealthState};
use gatepunch::server::{self, MediatorConfig, ServerState};
use gatepunch::udp;

/// Number of fake servers inserted by `--debug-servers`
const DEBUG_SERVER_COUNT: usize = 50;

/// GATE.PUNCH - master server for UDP hole punching
#[derive(Parser, Debug)]
#[command(name = "gatepunchd", version)]
#[command(about = "Mediator for UDP hole punching between game servers and clients")]
struct Args {
    /// TCP and UDP port to listen on
    #[arg(short, long, default_value_t = 6510, env = "GATEPUNCH_PORT")]
    port: u16,

    /// Ignore all requests for the server listing
    #[arg(long, env = "GATEPUNCH_DISABLE_LOBBY")]
    disable_lobby: bool,

    /// Name of this master server, reported in testing mode
    #[arg(long, default_value = "", env = "GATEPUNCH_NAME")]
    name: String,

    /// Enable testing mode for debugging tools
    #[arg(long, env = "GATEPUNCH_TESTING")]
    testing: bool,

    /// Don't log to the console
    #[arg(short, long)]
    quiet: bool,

    /// Log additional information
    #[arg(short, long)]
    verbose: bool,

    /// Append log output to this file, even when quiet
    #[arg(short, long, value_name = "FILE", env = "GATEPUNCH_LOG")]
    log: Option<PathBuf>,

    /// Port for the health check HTTP endpoint (disabled if unset)
    #[arg(long, env = "GATEPUNCH_HEALTH_PORT")]
    health_port: Option<u16>,

    /// Maximum concurrent TCP connections
    #[arg(long, default_value_t = 10000, env = "GATEPUNCH_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Start with a set of fake servers in the lobby
    #[arg(long, hide = true)]
    debug_servers: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = (!args.quiet).then(|| tracing_subscriber::fmt::layer().with_filter(filter()));

    let file = match &args.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = MediatorConfig {
        listen_port: args.port,
        lobby_enabled: !args.disable_lobby,
        testing: args.testing,
        name: args.name.clone(),
        max_connections: args.max_connections,
        ..MediatorConfig::default()
    };

    tracing::info!(version = %config.version, "GATE.PUNCH started");
    tracing::info!(
        port = config.listen_port,
        lobby = config.lobby_enabled,
        testing = config.testing,
        name = %config.name,
        "Configuration"
    );

    let state = Arc::new(ServerState::new(config));

    if args.debug_servers {
        state.registry.seed_debug_servers(DEBUG_SERVER_COUNT);
        tracing::info!(count = DEBUG_SERVER_COUNT, "Seeded debug servers");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port));
    let tcp_listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP {addr}"))?;
    let udp_socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind UDP {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let udp_handle = tokio::spawn(udp::run_udp_listener(
        Arc::clone(&state),
        udp_socket,
        shutdown_rx.clone(),
    ));

    let tcp_handle = tokio::spawn(server::run_server(
        Arc::clone(&state),
        tcp_listener,
        shutdown_rx.clone(),
    ));

    let health_handle = match args.health_port {
        Some(port) => {
            let health_state = Arc::new(HealthState {
                server: Arc::clone(&state),
                start_time: Instant::now(),
            });
            let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
                .await
                .with_context(|| format!("failed to bind health port {port}"))?;
            Some(tokio::spawn(health::run_health_server(health_state, listener)))
        }
        None => None,
    };

    shutdown_signal().await;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    // Connections are not drained; peers re-register with the next instance
    udp_handle.abort();
    tcp_handle.abort();
    if let Some(handle) = health_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
