use std::sync::Arc;
use std::time::{Duration, Instant};

use gatepunch::health::{run_health_server, HealthState};
use gatepunch::server::{MediatorConfig, ServerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = Arc::new(ServerState::new(MediatorConfig {
        name: "Main".to_string(),
        ..MediatorConfig::default()
    }));
    server.registry.seed_debug_servers(3);
    server.registry.get_or_create_client("9.9.9.9").port = 1234;

    let state = Arc::new(HealthState {
        server,
        start_time: Instant::now(),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(run_health_server(state, listener));

    let livez = get(addr, "/livez").await;
    assert!(livez.starts_with("HTTP/1.1 200"));

    let health = get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""name":"Main""#));
    assert!(health.contains(r#""registered_servers":3"#));
    assert!(health.contains(r#""pending_clients":1"#));

    let metrics = get(addr, "/metrics").await;
    assert!(metrics.contains("gatepunch_registered_servers 3"));
    assert!(metrics.contains("gatepunch_pending_clients 1"));

    handle.abort();
}
