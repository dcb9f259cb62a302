//! UDP side of the mediator: records the public ports peers send from
//!
//! Nothing is ever sent back over UDP. Peers sit behind NATs that would drop
//! unsolicited replies; all answers travel over their TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::protocol::{ProtocolError, UdpCommand, INVALID_SERVER_MARKER};
use crate::registry::Registry;
use crate::server::{peer_ip, ServerState};

/// Largest datagram accepted; game clients send a few dozen bytes
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// A received datagram, copied out of the receive buffer
#[derive(Debug, Clone)]
pub struct Datagram {
    pub sender: SocketAddr,
    pub payload: Vec<u8>,
}

/// Apply one datagram to the registry.
pub fn handle_datagram(registry: &Registry, datagram: &Datagram) -> Result<UdpCommand, ProtocolError> {
    let command = UdpCommand::from_bytes(&datagram.payload)?;
    let ip = peer_ip(datagram.sender);
    let port = datagram.sender.port();

    match &command {
        UdpCommand::Register => {
            let mut record = registry.get_or_create_server(&ip);
            record.port = port;
            // Hidden from the lobby until the server confirms over TCP
            record.data[0] = INVALID_SERVER_MARKER.to_string();
            tracing::info!(sender = %datagram.sender, "Server registered");
        }
        UdpCommand::Connect => {
            registry.get_or_create_client(&ip).port = port;
            tracing::info!(sender = %datagram.sender, "Client registered");
        }
        UdpCommand::Unknown(token) => {
            tracing::debug!(sender = %datagram.sender, command = %token, "Unknown command");
        }
    }

    Ok(command)
}

/// Run the UDP receive loop
pub async fn run_udp_listener(
    state: Arc<ServerState>,
    socket: UdpSocket,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %socket.local_addr()?, "UDP listener ready");

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Shutdown signal received, stopping UDP loop");
                    break;
                }
            }

            recv_result = socket.recv_from(&mut buf) => {
                match recv_result {
                    Ok((len, sender)) => {
                        state.metrics.datagram_received();
                        let datagram = Datagram {
                            sender,
                            payload: buf[..len].to_vec(),
                        };
                        tracing::debug!(%sender, len, "Received datagram");

                        if let Err(e) = handle_datagram(&state.registry, &datagram) {
                            tracing::debug!(%sender, error = %e, "Could not read datagram");
                            state.metrics.datagram_rejected();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                    }
                }
            }
        }
    }

    Ok(())
}
