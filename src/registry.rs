//! Peer registry - tracks game servers and clients by their public IP
//!
//! Servers announce themselves over UDP (`reg`, records the public port) and
//! then over TCP (`reg2`, binds the connection as reply channel and fills in
//! the metadata). Clients announce their UDP port (`connect`) right before
//! asking for a punch over TCP. All state is in memory only.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::protocol::INVALID_SERVER_MARKER;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ReplyInner {
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
    peer_addr: SocketAddr,
}

/// Outbound half of a peer's TCP connection.
///
/// Cloned into the registry when a server completes `reg2` so that other
/// connections can deliver punch packets to it. Each `send` writes and
/// flushes one whole packet while holding the writer lock, so packets from
/// different connections never interleave.
#[derive(Clone)]
pub struct ReplyChannel {
    inner: Arc<ReplyInner>,
}

impl ReplyChannel {
    pub fn new<W>(writer: W, peer_addr: SocketAddr) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(ReplyInner {
                writer: Mutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                peer_addr,
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write one packet and flush it. A failed write closes the channel.
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let result = async {
            writer.write_all(packet).await?;
            writer.flush().await
        }
        .await;

        if result.is_err() {
            self.inner.closed.store(true, Ordering::Release);
        }
        result
    }

    /// Mark the channel dead and shut the write side down. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Whether both handles refer to the same connection
    pub fn same_channel(&self, other: &ReplyChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReplyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyChannel")
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A registered game server
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub ip: String,
    /// Public UDP port observed from the server's `reg` datagram
    pub port: u16,
    /// TCP connection that completed `reg2`
    pub reply: Option<ReplyChannel>,
    /// Free-form metadata `data1..data8`
    pub data: [String; 8],
    /// Seconds since the Unix epoch
    pub created_time: i64,
}

impl ServerRecord {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: 0,
            reply: None,
            data: Default::default(),
            created_time: chrono::Utc::now().timestamp(),
        }
    }

    /// Known through UDP only, never confirmed over TCP
    pub fn is_pending(&self) -> bool {
        self.data[0] == INVALID_SERVER_MARKER
    }
}

/// A client waiting to punch through to a server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRecord {
    /// Public UDP port observed from the client's `connect` datagram
    pub port: u16,
}

/// Shared registry of servers and clients, keyed by peer IP
#[derive(Default)]
pub struct Registry {
    servers: DashMap<String, ServerRecord>,
    clients: DashMap<String, ClientRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing record for `ip`, or a freshly inserted default one.
    ///
    /// The returned guard locks the record's shard; drop it before awaiting.
    pub fn get_or_create_server(&self, ip: &str) -> RefMut<'_, String, ServerRecord> {
        self.servers
            .entry(ip.to_string())
            .or_insert_with(|| ServerRecord::new(ip))
    }

    /// Existing record for `ip`, or a freshly inserted one with port 0.
    ///
    /// The returned guard locks the record's shard; drop it before awaiting.
    pub fn get_or_create_client(&self, ip: &str) -> RefMut<'_, String, ClientRecord> {
        self.clients.entry(ip.to_string()).or_default()
    }

    pub fn remove_server(&self, ip: &str) {
        self.servers.remove(ip);
    }

    pub fn remove_client(&self, ip: &str) {
        self.clients.remove(ip);
    }

    /// Remove the server record for `ip` only if `reply` is the channel bound
    /// to it. Returns whether a record was removed.
    pub fn release_server(&self, ip: &str, reply: &ReplyChannel) -> bool {
        self.servers
            .remove_if(ip, |_, record| {
                record
                    .reply
                    .as_ref()
                    .is_some_and(|bound| bound.same_channel(reply))
            })
            .is_some()
    }

    /// Copy of the server record for `ip`
    pub fn server(&self, ip: &str) -> Option<ServerRecord> {
        self.servers.get(ip).map(|record| record.value().clone())
    }

    /// Copy of every server record, ordered by IP
    pub fn snapshot_servers(&self) -> Vec<(String, ServerRecord)> {
        let mut snapshot: Vec<(String, ServerRecord)> = self
            .servers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Fill the lobby with `count` unreachable servers carrying random
    /// metadata, for exercising lobby tooling.
    pub fn seed_debug_servers(&self, count: usize) {
        for _ in 0..count {
            let ip = uuid::Uuid::new_v4().to_string();
            let mut record = self.get_or_create_server(&ip);
            record.data = std::array::from_fn(|_| uuid::Uuid::new_v4().to_string());
        }
    }
}
