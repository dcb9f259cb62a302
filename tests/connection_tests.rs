use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gatepunch::registry::Registry;
use gatepunch::server::{handle_connection, run_server, MediatorConfig, ServerState};
use gatepunch::udp::{handle_datagram, Datagram};
use gatepunch::UDP_PREAMBLE_LEN;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn state(config: MediatorConfig) -> Arc<ServerState> {
    Arc::new(ServerState::new(config))
}

/// Open an in-memory connection to the handler, as a peer at `addr`.
fn connect_peer(state: &Arc<ServerState>, addr: &str) -> (DuplexStream, JoinHandle<()>) {
    let (peer, server_side) = tokio::io::duplex(64 * 1024);
    let peer_addr: SocketAddr = addr.parse().unwrap();
    let state = Arc::clone(state);
    let handle = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server_side);
        handle_connection(reader, writer, peer_addr, &state).await;
    });
    (peer, handle)
}

fn udp(registry: &Registry, addr: &str, command: &str) {
    let mut payload = vec![0u8; UDP_PREAMBLE_LEN];
    payload.extend_from_slice(command.as_bytes());
    let datagram = Datagram {
        sender: addr.parse().unwrap(),
        payload,
    };
    handle_datagram(registry, &datagram).unwrap();
}

async fn send_lines(peer: &mut DuplexStream, lines: &[&str]) {
    let mut text = lines.join("\n");
    text.push('\n');
    peer.write_all(text.as_bytes()).await.unwrap();
}

async fn register(peer: &mut DuplexStream, version: &str, data1: &str) {
    send_lines(peer, &["reg2", version, data1, "d2", "d3", "d4", "d5", "d6", "d7", "d8"]).await;
}

async fn read_bytes(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, peer.read_exact(&mut buf))
        .await
        .expect("timed out reading response")
        .unwrap();
    buf
}

async fn read_until_newline(peer: &mut DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = read_bytes(peer, 1).await[0];
        out.push(byte);
        if byte == b'\n' {
            return out;
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn has_live_server(registry: &Registry, ip: &str) -> bool {
    registry
        .server(ip)
        .and_then(|r| r.reply)
        .is_some_and(|reply| !reply.is_closed())
}

#[tokio::test]
async fn test_version_command() {
    let state = state(MediatorConfig::default());
    let (mut peer, _) = connect_peer(&state, "10.0.0.9:1000");

    send_lines(&mut peer, &["version"]).await;
    let response = read_until_newline(&mut peer).await;
    assert_eq!(response[0], 246);
    assert_eq!(&response[1..], format!("{}\n", env!("CARGO_PKG_VERSION")).as_bytes());
}

#[tokio::test]
async fn test_testing_commands() {
    let off = state(MediatorConfig::default());
    let (mut peer, _) = connect_peer(&off, "10.0.0.9:1000");
    send_lines(&mut peer, &["istesting", "testinginfos"]).await;
    assert_eq!(read_bytes(&mut peer, 2).await, vec![248, 0]);
    assert_eq!(read_bytes(&mut peer, 2).await, vec![247, 0]);

    let on = state(MediatorConfig {
        testing: true,
        name: "Main".to_string(),
        version: "1.2.5".to_string(),
        min_client_version: "1.2.0".to_string(),
        ..MediatorConfig::default()
    });
    let (mut peer, _) = connect_peer(&on, "10.0.0.9:1000");
    send_lines(&mut peer, &["istesting", "testinginfos"]).await;
    assert_eq!(read_bytes(&mut peer, 2).await, vec![248, 1]);
    let expected = b"\xF7Main\n1.2.5\n1.2.0\n";
    assert_eq!(read_bytes(&mut peer, expected.len()).await, expected.to_vec());
}

#[tokio::test]
async fn test_unknown_commands_are_ignored() {
    let state = state(MediatorConfig::default());
    let (mut peer, _) = connect_peer(&state, "10.0.0.9:1000");

    send_lines(&mut peer, &["hello", "", "\0\0", "version"]).await;
    assert_eq!(read_bytes(&mut peer, 1).await, vec![246]);
}

#[tokio::test]
async fn test_connect_to_unknown_server_fails() {
    let state = state(MediatorConfig::default());
    let (mut peer, _) = connect_peer(&state, "10.0.0.2:1000");

    send_lines(&mut peer, &["connect", "1.2.3.4", "version"]).await;
    // Exactly one failure byte, then the version response
    assert_eq!(read_bytes(&mut peer, 2).await, vec![254, 246]);
}

#[tokio::test]
async fn test_connect_to_udp_only_server_fails() {
    let state = state(MediatorConfig::default());
    udp(&state.registry, "10.0.0.1:40000", "reg");

    let (mut peer, _) = connect_peer(&state, "10.0.0.2:1000");
    send_lines(&mut peer, &["connect", "10.0.0.1"]).await;
    assert_eq!(read_bytes(&mut peer, 1).await, vec![254]);
}

#[tokio::test]
async fn test_register_and_punch() {
    let state = state(MediatorConfig::default());
    let registry = &state.registry;

    udp(registry, "10.0.0.1:40000", "reg");
    let (mut game_server, _) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut game_server, "1.2.0", "My Game").await;
    wait_until(|| has_live_server(registry, "10.0.0.1")).await;

    let record = registry.server("10.0.0.1").unwrap();
    assert_eq!(record.port, 40000);
    assert_eq!(record.data[0], "My Game");
    assert_eq!(record.data[7], "d8");
    assert!(!record.is_pending());

    udp(registry, "10.0.0.2:50000", "connect");
    let (mut client, _) = connect_peer(&state, "10.0.0.2:7000");
    send_lines(&mut client, &["connect", "10.0.0.1"]).await;

    let to_client = b"\xFF10.0.0.1\x0040000\x00";
    assert_eq!(read_bytes(&mut client, to_client.len()).await, to_client.to_vec());

    let to_server = b"\xFF10.0.0.2\x0050000\x00";
    assert_eq!(read_bytes(&mut game_server, to_server.len()).await, to_server.to_vec());

    // The client record is single-use
    wait_until(|| registry.client_count() == 0).await;
    assert_eq!(registry.get_or_create_client("10.0.0.2").port, 0);
    assert_eq!(state.metrics.snapshot().punches, 1);
}

#[tokio::test]
async fn test_punch_without_client_udp_sends_port_zero() {
    let state = state(MediatorConfig::default());
    let (mut game_server, _) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut game_server, "1.3", "g").await;
    wait_until(|| has_live_server(&state.registry, "10.0.0.1")).await;

    let (mut client, _) = connect_peer(&state, "10.0.0.2:7000");
    send_lines(&mut client, &["connect", "10.0.0.1"]).await;

    let to_client = b"\xFF10.0.0.1\x000\x00";
    assert_eq!(read_bytes(&mut client, to_client.len()).await, to_client.to_vec());
    let to_server = b"\xFF10.0.0.2\x000\x00";
    assert_eq!(read_bytes(&mut game_server, to_server.len()).await, to_server.to_vec());
}

#[tokio::test]
async fn test_old_version_is_rejected() {
    let state = state(MediatorConfig::default());
    let (mut peer, handle) = connect_peer(&state, "10.0.0.1:6000");

    register(&mut peer, "1.1.9", "g").await;
    timeout(WAIT, handle).await.unwrap().unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    assert!(state.registry.server("10.0.0.1").is_none());
}

#[tokio::test]
async fn test_invalid_version_is_rejected() {
    let state = state(MediatorConfig::default());
    let (mut peer, handle) = connect_peer(&state, "10.0.0.1:6000");

    register(&mut peer, "latest", "g").await;
    timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(state.registry.server("10.0.0.1").is_none());
}

#[tokio::test]
async fn test_disconnect_removes_server() {
    let state = state(MediatorConfig::default());
    let (mut game_server, handle) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut game_server, "1.2.5", "g").await;
    wait_until(|| has_live_server(&state.registry, "10.0.0.1")).await;

    drop(game_server);
    timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(state.registry.server("10.0.0.1").is_none());

    let (mut client, _) = connect_peer(&state, "10.0.0.2:7000");
    send_lines(&mut client, &["connect", "10.0.0.1"]).await;
    assert_eq!(read_bytes(&mut client, 1).await, vec![254]);
}

#[tokio::test]
async fn test_stalled_argument_times_out() {
    let state = state(MediatorConfig::default());
    let (mut game_server, handle) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut game_server, "1.2.5", "g").await;
    wait_until(|| has_live_server(&state.registry, "10.0.0.1")).await;

    // Only the command line; the target line never arrives
    send_lines(&mut game_server, &["connect"]).await;
    timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(state.registry.server("10.0.0.1").is_none());
}

#[tokio::test]
async fn test_idle_connection_is_kept_open() {
    let state = state(MediatorConfig::default());
    let (mut peer, handle) = connect_peer(&state, "10.0.0.1:6000");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!handle.is_finished());

    send_lines(&mut peer, &["version"]).await;
    assert_eq!(read_bytes(&mut peer, 1).await, vec![246]);
}

#[tokio::test]
async fn test_newer_registration_survives_older_disconnect() {
    let state = state(MediatorConfig::default());
    let (mut first, first_handle) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut first, "1.2.5", "first").await;
    wait_until(|| state.registry.server("10.0.0.1").is_some_and(|r| r.data[0] == "first")).await;

    let (mut second, _) = connect_peer(&state, "10.0.0.1:6001");
    register(&mut second, "1.2.5", "second").await;
    wait_until(|| state.registry.server("10.0.0.1").is_some_and(|r| r.data[0] == "second")).await;

    drop(first);
    timeout(WAIT, first_handle).await.unwrap().unwrap();
    assert!(has_live_server(&state.registry, "10.0.0.1"));
}

fn lobby_request<'a>(filter1: &'a str, sort: &'a str, dir: &'a str, limit: &'a str) -> Vec<&'a str> {
    vec!["lobby2", filter1, "", "", "", "", "", "", "", sort, dir, limit]
}

fn parse_lobby(response: &[u8]) -> Vec<serde_json::Value> {
    assert_eq!(response[0], 249);
    assert_eq!(*response.last().unwrap(), b'\n');
    serde_json::from_slice(&response[1..response.len() - 1]).unwrap()
}

#[tokio::test]
async fn test_lobby_lists_confirmed_servers() {
    let state = state(MediatorConfig::default());
    udp(&state.registry, "10.0.0.3:40000", "reg");

    let (mut foo, _) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut foo, "1.2.5", "foo").await;
    let (mut bar, _) = connect_peer(&state, "10.0.0.2:6000");
    register(&mut bar, "1.2.5", "bar").await;
    wait_until(|| {
        has_live_server(&state.registry, "10.0.0.1") && has_live_server(&state.registry, "10.0.0.2")
    })
    .await;

    let (mut client, _) = connect_peer(&state, "10.0.0.9:7000");
    send_lines(&mut client, &lobby_request("", "", "", "")).await;
    let all = parse_lobby(&read_until_newline(&mut client).await);
    assert_eq!(all.len(), 2);

    send_lines(&mut client, &lobby_request("foo", "", "", "")).await;
    let filtered = parse_lobby(&read_until_newline(&mut client).await);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["ip"], "10.0.0.1");
    assert_eq!(filtered[0]["data1"], "foo");
    assert_eq!(filtered[0]["data2"], "d2");
    assert!(filtered[0]["createdTime"].is_i64());
    assert!(filtered[0].get("port").is_none());
}

#[tokio::test]
async fn test_disabled_lobby_consumes_arguments() {
    let state = state(MediatorConfig {
        lobby_enabled: false,
        ..MediatorConfig::default()
    });
    let (mut client, _) = connect_peer(&state, "10.0.0.9:7000");

    let mut lines = lobby_request("", "", "", "");
    lines.push("version");
    send_lines(&mut client, &lines).await;

    // No listing; the next byte is the version marker
    assert_eq!(read_bytes(&mut client, 1).await, vec![246]);
}

#[tokio::test]
async fn test_testing_mode_enables_disabled_lobby() {
    let state = state(MediatorConfig {
        lobby_enabled: false,
        testing: true,
        ..MediatorConfig::default()
    });
    let (mut client, _) = connect_peer(&state, "10.0.0.9:7000");

    send_lines(&mut client, &lobby_request("", "", "", "")).await;
    assert_eq!(read_until_newline(&mut client).await, b"\xF9[]\n".to_vec());
}

#[tokio::test]
async fn test_malformed_lobby_limit_closes_connection() {
    let state = state(MediatorConfig::default());
    let (mut game_server, _) = connect_peer(&state, "10.0.0.1:6000");
    register(&mut game_server, "1.2.5", "g").await;
    wait_until(|| has_live_server(&state.registry, "10.0.0.1")).await;

    for limit in ["-1", "abc", "99999999999999999999"] {
        let (mut client, handle) = connect_peer(&state, "10.0.0.9:7000");
        send_lines(&mut client, &lobby_request("", "", "", limit)).await;
        timeout(WAIT, handle).await.unwrap().unwrap();

        // Closed without a listing
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "limit {limit:?} produced {rest:?}");
    }
    assert!(has_live_server(&state.registry, "10.0.0.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_and_lobby_queries() {
    const SERVERS: usize = 40;
    const QUERIES: usize = 20;

    let state = state(MediatorConfig::default());

    let mut servers = Vec::new();
    for n in 0..SERVERS {
        let state = Arc::clone(&state);
        servers.push(tokio::spawn(async move {
            let (mut peer, _) = connect_peer(&state, &format!("10.1.0.{n}:6000"));
            register(&mut peer, "1.2.5", &format!("game-{n}")).await;
            peer
        }));
    }

    let mut queries = Vec::new();
    for n in 0..QUERIES {
        let state = Arc::clone(&state);
        queries.push(tokio::spawn(async move {
            let (mut client, _) = connect_peer(&state, &format!("10.2.0.{n}:7000"));
            send_lines(&mut client, &lobby_request("", "", "", "")).await;
            let entries = parse_lobby(&read_until_newline(&mut client).await);
            assert!(entries.len() <= SERVERS);
        }));
    }

    let mut open = Vec::new();
    for handle in servers {
        open.push(handle.await.unwrap());
    }
    for handle in queries {
        handle.await.unwrap();
    }

    wait_until(|| state.registry.server_count() == SERVERS).await;
    wait_until(|| {
        state
            .registry
            .snapshot_servers()
            .iter()
            .all(|(_, r)| r.reply.is_some())
    })
    .await;

    let snapshot = state.registry.snapshot_servers();
    let mut ips: Vec<&str> = snapshot.iter().map(|(ip, _)| ip.as_str()).collect();
    ips.dedup();
    assert_eq!(ips.len(), SERVERS);
    drop(open);
}

#[tokio::test]
async fn test_tcp_listener_serves_commands() {
    let state = state(MediatorConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server(Arc::clone(&state), listener, shutdown_rx));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"connect\n10.9.9.9\nversion\n").await.unwrap();

    let mut buf = [0u8; 2];
    timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, [254, 246]);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_limit_drops_excess_peers() {
    let state = state(MediatorConfig {
        max_connections: 1,
        ..MediatorConfig::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server(Arc::clone(&state), listener, shutdown_rx));

    // Opened back to back, before the first connection's task gets to run
    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    let mut buf = [0u8; 1];
    let dropped = timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(dropped, Ok(0) | Err(_)));

    first.write_all(b"version\n").await.unwrap();
    timeout(WAIT, first.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, [246]);
    assert_eq!(state.metrics.snapshot().total_connections, 1);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}
