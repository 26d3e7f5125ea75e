//! Pooled transport client for the operator node.
//!
//! `TransportClient` sends control messages to one logical peer. It keeps
//! warm connections in a shared `ConnectionPool` so that the steady-state
//! path skips both name resolution and the handshake probe:
//!
//! ```text
//! connect()
//!   ├─ idle pooled connection for the fresh cached address? ── yes ─▶ Warm
//!   └─ no ─▶ resolve ─▶ idle pooled connection? ── yes ─▶ Warm
//!                          └─ no ─▶ TCP connect ─▶ heartbeat probe ─▶ Cold
//!                                                   │ failed
//!                                                   └─▶ backoff, retry (bounded)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()`
//! - A connection that fails mid-exchange is dropped, never returned to
//!   the pool

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use avlink_core::LinkConfig;
use avlink_protocol::{Ack, ControlMessage, DecodeError, Frame, FramedMessageCodec};

use crate::error::{OperatorError, Result};
use crate::resolver::AddressResolver;

// ============================================================================
// Pooled Connection
// ============================================================================

/// An established, framed connection to a peer.
pub struct PooledConnection {
    pub peer_address: SocketAddr,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub in_use: bool,
    framed: Framed<TcpStream, FramedMessageCodec>,
}

impl PooledConnection {
    fn new(peer_address: SocketAddr, framed: Framed<TcpStream, FramedMessageCodec>) -> Self {
        let now = Instant::now();
        Self {
            peer_address,
            created_at: now,
            last_used_at: now,
            in_use: true,
            framed,
        }
    }

    /// Non-blocking liveness check for an idle connection.
    ///
    /// An idle connection must have nothing to read: EOF means the peer
    /// closed it, and unsolicited bytes would desynchronize the next
    /// request/response exchange.
    fn is_idle_and_open(&self) -> bool {
        if !self.framed.read_buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match self.framed.get_ref().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        }
    }

    /// Consumes the pooled wrapper, keeping any buffered bytes with the
    /// stream.
    pub fn into_framed(self) -> Framed<TcpStream, FramedMessageCodec> {
        self.framed
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("peer_address", &self.peer_address)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("in_use", &self.in_use)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Idle connections keyed by peer address.
///
/// Cheap to clone; clones share the same pool. Taking and returning
/// connections is a short critical section, so several clients can hold
/// distinct connections at the same time.
#[derive(Clone)]
pub struct ConnectionPool {
    idle: Arc<Mutex<HashMap<SocketAddr, Vec<PooledConnection>>>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            idle: Arc::new(Mutex::new(HashMap::new())),
            max_idle: config.pool_max_idle,
            idle_timeout: config.pool_idle_timeout,
        }
    }

    /// Takes the most recently used idle connection to `addr` that is
    /// still open. Closed or expired connections found on the way are
    /// dropped.
    pub fn take(&self, addr: SocketAddr) -> Option<PooledConnection> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let connections = idle.get_mut(&addr)?;

        while let Some(mut conn) = connections.pop() {
            let idle_for = now.saturating_duration_since(conn.last_used_at);
            if idle_for >= self.idle_timeout {
                debug!(peer = %addr, idle_ms = idle_for.as_millis() as u64, "Discarding expired pooled connection");
                continue;
            }
            if !conn.is_idle_and_open() {
                debug!(peer = %addr, "Discarding closed pooled connection");
                continue;
            }
            conn.in_use = true;
            return Some(conn);
        }
        None
    }

    /// Returns a connection to the pool. Returns false and closes it if the
    /// idle ceiling for its address is reached.
    pub fn put(&self, mut conn: PooledConnection) -> bool {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let connections = idle.entry(conn.peer_address).or_default();
        if connections.len() >= self.max_idle {
            debug!(peer = %conn.peer_address, max_idle = self.max_idle, "Pool full, closing connection");
            return false;
        }
        conn.in_use = false;
        conn.last_used_at = Instant::now();
        connections.push(conn);
        true
    }

    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.get(&addr).map_or(0, Vec::len)
    }

    /// Closes every idle connection to `addr`. Returns how many were closed.
    pub fn drain(&self, addr: SocketAddr) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.remove(&addr).map_or(0, |connections| connections.len())
    }

    /// Closes every idle connection.
    pub fn clear(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.drain().map(|(_, connections)| connections.len()).sum()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle", &self.max_idle)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transport Client
// ============================================================================

/// How `connect` obtained its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPath {
    /// Reused an idle pooled connection; no resolution, no probe
    Warm,
    /// Resolved, connected and probed a new connection
    Cold,
}

/// Client for one logical peer.
pub struct TransportClient {
    peer: String,
    port: u16,
    resolver: AddressResolver,
    pool: ConnectionPool,
    codec: FramedMessageCodec,
    connect_timeout: Duration,
    probe_timeout: Duration,
    response_timeout: Duration,
    retry_backoff: Duration,
    connect_retries: u32,
    current: Option<PooledConnection>,
}

impl TransportClient {
    /// `peer` is a logical name or a literal IP address.
    pub fn new(
        peer: impl Into<String>,
        resolver: AddressResolver,
        pool: ConnectionPool,
        config: &LinkConfig,
    ) -> Self {
        Self {
            peer: peer.into(),
            port: config.port,
            resolver,
            pool,
            codec: FramedMessageCodec::new(config.max_frame_size),
            connect_timeout: config.connect_timeout,
            probe_timeout: config.probe_timeout,
            response_timeout: config.response_timeout,
            retry_backoff: config.retry_backoff,
            connect_retries: config.connect_retries,
            current: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns true while the client holds a connection.
    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Ensures the client holds a usable connection.
    ///
    /// Fails with `Resolution` if no address is known, or `Connection` once
    /// the bounded retries are exhausted.
    pub async fn connect(&mut self) -> Result<ConnectPath> {
        if self.current.is_some() {
            return Ok(ConnectPath::Warm);
        }

        if let Some(addr) = self.known_address() {
            if let Some(conn) = self.pool.take(addr) {
                debug!(peer = %addr, "Reusing pooled connection");
                self.current = Some(conn);
                return Ok(ConnectPath::Warm);
            }
        }

        let resolved = self.resolver.resolve(&self.peer).await?;
        if resolved.stale {
            warn!(peer = %self.peer, address = %resolved.address, "Connecting with stale address");
        }
        let addr = SocketAddr::new(resolved.address, self.port);
        if let Some(conn) = self.pool.take(addr) {
            debug!(peer = %addr, "Reusing pooled connection after re-resolution");
            self.current = Some(conn);
            return Ok(ConnectPath::Warm);
        }

        let attempts = self.connect_retries.saturating_add(1);
        let mut delay = self.retry_backoff;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(peer = %addr, attempt, "Opening connection");

            match self.open_and_probe(addr).await {
                Ok(framed) => {
                    info!(peer = %addr, attempt, "Connected to peer");
                    self.current = Some(PooledConnection::new(addr, framed));
                    return Ok(ConnectPath::Cold);
                }
                Err(reason) if attempt < attempts => {
                    debug!(peer = %addr, attempt, reason = %reason, "Connection attempt failed");
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(reason) => {
                    warn!(peer = %addr, attempts, reason = %reason, "Could not connect to peer");
                    // The address may have moved; re-resolve next time.
                    self.resolver.invalidate(&self.peer);
                    return Err(OperatorError::Connection { addr, reason });
                }
            }
        }
    }

    /// Sends one request and, if `expect_response`, returns its `Ack`.
    ///
    /// The peer answers every request, so the `Ack` is read (and, for a
    /// one-way send, discarded) before the connection is used again.
    /// Connects first if needed. On any failure the connection is dropped
    /// rather than pooled.
    pub async fn send(
        &mut self,
        message: ControlMessage,
        expect_response: bool,
    ) -> Result<Option<Ack>> {
        self.connect().await?;
        let Some(conn) = self.current.as_mut() else {
            return Err(OperatorError::Timeout("connection"));
        };
        let addr = conn.peer_address;

        debug!(peer = %addr, message = %message, "Sending request");

        let written = timeout(
            self.response_timeout,
            conn.framed.send(Frame::Request(message)),
        )
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.current = None;
                return Err(e.into());
            }
            Err(_) => {
                self.current = None;
                return Err(OperatorError::Timeout("request write"));
            }
        }

        let ack = self.read_ack(addr).await?;
        if expect_response {
            debug!(peer = %addr, ack = %ack, "Received response");
            Ok(Some(ack))
        } else {
            debug!(peer = %addr, ack = %ack, "Discarded response to one-way request");
            Ok(None)
        }
    }

    /// Reads the response to the request just written on the current
    /// connection.
    async fn read_ack(&mut self, addr: SocketAddr) -> Result<Ack> {
        let Some(conn) = self.current.as_mut() else {
            return Err(OperatorError::Timeout("response"));
        };
        let reply = timeout(self.response_timeout, conn.framed.next()).await;
        match reply {
            Ok(Some(Ok(Frame::Response(ack)))) => {
                conn.last_used_at = Instant::now();
                Ok(ack)
            }
            Ok(Some(Ok(Frame::Request(unexpected)))) => {
                self.current = None;
                Err(OperatorError::Decode(DecodeError::InvalidAck(format!(
                    "expected a response, got request {unexpected}"
                ))))
            }
            Ok(Some(Err(e))) => {
                self.current = None;
                Err(e.into())
            }
            Ok(None) => {
                self.current = None;
                Err(OperatorError::Connection {
                    addr,
                    reason: "connection closed by peer".to_string(),
                })
            }
            Err(_) => {
                self.current = None;
                Err(OperatorError::Timeout("response"))
            }
        }
    }

    /// Releases the current connection, returning it to the pool when
    /// `reuse` is set and the pool has room.
    pub fn disconnect(&mut self, reuse: bool) {
        let Some(conn) = self.current.take() else {
            return;
        };
        let addr = conn.peer_address;
        if reuse && self.pool.put(conn) {
            debug!(peer = %addr, "Connection returned to pool");
        } else {
            debug!(peer = %addr, "Connection closed");
        }
    }

    /// Hands the current connection over to the caller. It is neither pooled
    /// nor closed by this client afterwards.
    pub fn take_connection(&mut self) -> Option<PooledConnection> {
        self.current.take()
    }

    /// Closes idle pooled connections to this client's peer.
    pub fn close_idle(&self) -> usize {
        self.known_address().map_or(0, |addr| self.pool.drain(addr))
    }

    /// Address of the peer if it is known without any I/O. Expired cache
    /// entries do not count.
    fn known_address(&self) -> Option<SocketAddr> {
        let ip = match self.peer.parse() {
            Ok(ip) => ip,
            Err(_) => self.resolver.fresh(&self.peer)?.address,
        };
        Some(SocketAddr::new(ip, self.port))
    }

    /// Connects and verifies the peer answers a heartbeat within the probe
    /// timeout.
    async fn open_and_probe(
        &self,
        addr: SocketAddr,
    ) -> std::result::Result<Framed<TcpStream, FramedMessageCodec>, String> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                return Err(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut framed = Framed::new(stream, self.codec.clone());
        let probe = async {
            framed
                .send(Frame::Request(ControlMessage::heartbeat()))
                .await
                .map_err(|e| e.to_string())?;
            match framed.next().await {
                Some(Ok(Frame::Response(ack))) if ack.is_ok() => Ok(()),
                Some(Ok(Frame::Response(ack))) => Err(format!("probe rejected: {ack}")),
                Some(Ok(Frame::Request(_))) => Err("probe answered with a request".to_string()),
                Some(Err(e)) => Err(e.to_string()),
                None => Err("connection closed during probe".to_string()),
            }
        };

        match timeout(self.probe_timeout, probe).await {
            Ok(Ok(())) => Ok(framed),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("peer", &self.peer)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (PooledConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = PooledConnection::new(addr, Framed::new(client, FramedMessageCodec::default()));
        (conn, server)
    }

    #[tokio::test]
    async fn test_pool_put_and_take() {
        let pool = ConnectionPool::new(&LinkConfig::default());
        let (conn, _server) = connected_pair().await;
        let addr = conn.peer_address;

        assert!(pool.put(conn));
        assert_eq!(pool.idle_count(addr), 1);

        let taken = pool.take(addr).expect("idle connection");
        assert!(taken.in_use);
        assert_eq!(pool.idle_count(addr), 0);
    }

    #[tokio::test]
    async fn test_pool_respects_idle_ceiling() {
        let config = LinkConfig {
            pool_max_idle: 1,
            ..LinkConfig::default()
        };
        let pool = ConnectionPool::new(&config);
        let (first, _s1) = connected_pair().await;
        let (mut second, _s2) = connected_pair().await;
        second.peer_address = first.peer_address;
        let addr = first.peer_address;

        assert!(pool.put(first));
        assert!(!pool.put(second));
        assert_eq!(pool.idle_count(addr), 1);
    }

    #[tokio::test]
    async fn test_pool_discards_connection_closed_by_peer() {
        let pool = ConnectionPool::new(&LinkConfig::default());
        let (conn, server) = connected_pair().await;
        let addr = conn.peer_address;

        assert!(pool.put(conn));
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.take(addr).is_none());
        assert_eq!(pool.idle_count(addr), 0);
    }

    #[tokio::test]
    async fn test_pool_discards_expired_connection() {
        let config = LinkConfig {
            pool_idle_timeout: Duration::from_millis(20),
            ..LinkConfig::default()
        };
        let pool = ConnectionPool::new(&config);
        let (conn, _server) = connected_pair().await;
        let addr = conn.peer_address;

        assert!(pool.put(conn));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(pool.take(addr).is_none());
    }

    #[tokio::test]
    async fn test_pool_drain() {
        let pool = ConnectionPool::new(&LinkConfig::default());
        let (conn, _server) = connected_pair().await;
        let addr = conn.peer_address;
        pool.put(conn);

        assert_eq!(pool.drain(addr), 1);
        assert_eq!(pool.idle_count(addr), 0);
    }
}
