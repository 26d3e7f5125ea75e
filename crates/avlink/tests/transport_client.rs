//! `TransportClient` against a real reception control server.
//!
//! The server side is `avlinkd::TransportServer` with a recording
//! `MessageHandler`, bound to an ephemeral loopback port.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use avlink::{AddressResolver, ConnectPath, ConnectionPool, OperatorError, TransportClient};
use avlink_core::collaborator::PeerDirectory;
use avlink_core::error::CollaboratorResult;
use avlink_core::{JoinTarget, LinkConfig};
use avlink_protocol::{Ack, AckStatus, ControlMessage, Params};
use avlinkd::{MessageHandler, SessionChannel, TransportServer};

// ============================================================================
// Fakes
// ============================================================================

/// Directory with no peers; the tests address the server by IP literal.
struct EmptyDirectory;

#[async_trait]
impl PeerDirectory for EmptyDirectory {
    async fn resolve(&self, _name: &str) -> CollaboratorResult<Option<IpAddr>> {
        Ok(None)
    }
}

/// Directory that maps every name to loopback and counts queries.
#[derive(Default)]
struct LoopbackDirectory {
    queries: AtomicUsize,
}

#[async_trait]
impl PeerDirectory for LoopbackDirectory {
    async fn resolve(&self, _name: &str) -> CollaboratorResult<Option<IpAddr>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(Some(IpAddr::from([127, 0, 0, 1])))
    }
}

/// Handler that counts notices and rejects commands.
#[derive(Default)]
struct RecordingHandler {
    notices: AtomicUsize,
    stall: Duration,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_join_target(&self, _target: JoinTarget, _channel: SessionChannel) -> Ack {
        Ack::ok("received")
    }

    async fn on_command(&self, name: &str, _params: &Params) -> Ack {
        Ack::error(format!("unknown command '{name}'"))
    }

    async fn on_notice(&self, _text: &str) -> Ack {
        self.notices.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            sleep(self.stall).await;
        }
        Ack::ok("noted")
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    handler: Arc<RecordingHandler>,
    cancel_token: CancellationToken,
}

impl TestServer {
    async fn spawn(handler: RecordingHandler) -> Self {
        let handler = Arc::new(handler);
        let cancel_token = CancellationToken::new();
        let server = TransportServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            handler.clone(),
            &LinkConfig::default(),
            cancel_token.clone(),
        )
        .await
        .expect("bind server");
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            handler,
            cancel_token,
        }
    }

    fn config(&self) -> LinkConfig {
        client_config(self.addr.port())
    }

    fn client(&self, pool: &ConnectionPool) -> TransportClient {
        let config = self.config();
        let resolver = AddressResolver::new(Arc::new(EmptyDirectory), &config);
        TransportClient::new("127.0.0.1", resolver, pool.clone(), &config)
    }

    fn shutdown(self) {
        self.cancel_token.cancel();
    }
}

fn client_config(port: u16) -> LinkConfig {
    LinkConfig {
        port,
        probe_timeout: Duration::from_millis(200),
        response_timeout: Duration::from_millis(500),
        retry_backoff: Duration::from_millis(20),
        ..LinkConfig::default()
    }
}

/// Returns a loopback port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ============================================================================
// Pool Tests
// ============================================================================

#[tokio::test]
async fn test_pooled_reconnect_skips_handshake_and_is_faster() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    let started = Instant::now();
    let path = client.connect().await.unwrap();
    let cold = started.elapsed();
    assert_eq!(path, ConnectPath::Cold);

    let ack = client
        .send(ControlMessage::notice("hello"), true)
        .await
        .unwrap()
        .expect("ack");
    assert!(ack.is_ok());

    client.disconnect(true);
    assert!(!client.is_connected());
    assert_eq!(pool.idle_count(server.addr), 1);

    let started = Instant::now();
    let path = client.connect().await.unwrap();
    let warm = started.elapsed();
    assert_eq!(path, ConnectPath::Warm);
    assert!(warm < cold, "warm path {warm:?} should beat cold path {cold:?}");

    // The reused connection still carries requests.
    let ack = client
        .send(ControlMessage::notice("again"), true)
        .await
        .unwrap()
        .expect("ack");
    assert!(ack.is_ok());
    assert_eq!(server.handler.notices.load(Ordering::SeqCst), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_pool_is_shared_between_clients() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());

    let mut first = server.client(&pool);
    first.connect().await.unwrap();
    first.disconnect(true);

    let mut second = server.client(&pool);
    assert_eq!(second.connect().await.unwrap(), ConnectPath::Warm);
    assert_eq!(pool.idle_count(server.addr), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_without_reuse_closes() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    client.connect().await.unwrap();
    client.disconnect(false);
    assert_eq!(pool.idle_count(server.addr), 0);
    assert_eq!(client.connect().await.unwrap(), ConnectPath::Cold);

    server.shutdown();
}

#[tokio::test]
async fn test_close_idle_drains_pool() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    client.connect().await.unwrap();
    client.disconnect(true);
    assert_eq!(client.close_idle(), 1);
    assert_eq!(pool.idle_count(server.addr), 0);

    server.shutdown();
}

// ============================================================================
// Request Tests
// ============================================================================

#[tokio::test]
async fn test_send_connects_on_demand() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    let ack = client
        .send(ControlMessage::join_target(JoinTarget::new("https://meet.example/abc")).unwrap(), true)
        .await
        .unwrap()
        .expect("ack");
    assert_eq!(ack.detail, "received");
    assert!(client.is_connected());

    server.shutdown();
}

#[tokio::test]
async fn test_error_ack_is_returned_not_raised() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    let ack = client
        .send(ControlMessage::command("reboot", Params::new()).unwrap(), true)
        .await
        .unwrap()
        .expect("ack");
    assert_eq!(ack.status, AckStatus::Error);

    server.shutdown();
}

#[tokio::test]
async fn test_one_way_send_does_not_shift_later_responses() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    let none = client
        .send(ControlMessage::notice("first"), false)
        .await
        .unwrap();
    assert!(none.is_none());

    let ack = client
        .send(ControlMessage::command("reboot", Params::new()).unwrap(), true)
        .await
        .unwrap()
        .expect("ack");
    assert_eq!(ack.status, AckStatus::Error, "got {ack}");
    assert!(ack.detail.contains("reboot"));

    // The connection is clean enough to pool after the exchange.
    client.disconnect(true);
    assert_eq!(client.connect().await.unwrap(), ConnectPath::Warm);
    let ack = client
        .send(ControlMessage::notice("second"), true)
        .await
        .unwrap()
        .expect("ack");
    assert_eq!(ack.detail, "noted");
    assert_eq!(server.handler.notices.load(Ordering::SeqCst), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_missing_response_times_out_and_drops_connection() {
    let server = TestServer::spawn(RecordingHandler {
        stall: Duration::from_secs(2),
        ..RecordingHandler::default()
    })
    .await;
    let pool = ConnectionPool::new(&server.config());
    let mut client = server.client(&pool);

    let err = client
        .send(ControlMessage::notice("slow"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, OperatorError::Timeout(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert!(!client.is_connected());

    server.shutdown();
}

// ============================================================================
// Connection Failure Tests
// ============================================================================

#[tokio::test]
async fn test_closed_port_is_connection_error() {
    let port = closed_port().await;
    let config = client_config(port);
    let resolver = AddressResolver::new(Arc::new(EmptyDirectory), &config);
    let mut client =
        TransportClient::new("127.0.0.1", resolver, ConnectionPool::new(&config), &config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, OperatorError::Connection { .. }), "got {err:?}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_silent_peer_fails_handshake() {
    // Accepts connections but never answers the heartbeat.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = client_config(port);
    let resolver = AddressResolver::new(Arc::new(EmptyDirectory), &config);
    let mut client =
        TransportClient::new("127.0.0.1", resolver, ConnectionPool::new(&config), &config);

    let err = client.connect().await.unwrap_err();
    match err {
        OperatorError::Connection { reason, .. } => assert!(reason.contains("probe")),
        other => panic!("Expected Connection, got {other:?}"),
    }
    accepted.abort();
}

#[tokio::test]
async fn test_unknown_peer_name_is_resolution_error() {
    let config = client_config(closed_port().await);
    let resolver = AddressResolver::new(Arc::new(EmptyDirectory), &config);
    let mut client =
        TransportClient::new("reception", resolver, ConnectionPool::new(&config), &config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, OperatorError::Resolution { .. }), "got {err:?}");
}

// ============================================================================
// Address Freshness Tests
// ============================================================================

#[tokio::test]
async fn test_expired_address_is_resolved_again_before_reuse() {
    let server = TestServer::spawn(RecordingHandler::default()).await;
    let config = LinkConfig {
        resolver_ttl: Duration::from_millis(50),
        ..server.config()
    };
    let directory = Arc::new(LoopbackDirectory::default());
    let resolver = AddressResolver::new(directory.clone(), &config);
    let pool = ConnectionPool::new(&config);
    let mut client = TransportClient::new("reception", resolver, pool.clone(), &config);

    assert_eq!(client.connect().await.unwrap(), ConnectPath::Cold);
    client.disconnect(true);

    // Fresh entry: straight to the pool.
    assert_eq!(client.connect().await.unwrap(), ConnectPath::Warm);
    assert_eq!(directory.queries.load(Ordering::SeqCst), 1);
    client.disconnect(true);

    sleep(Duration::from_millis(80)).await;

    // Expired entry: the directory is asked again, then the pool is used.
    assert_eq!(client.connect().await.unwrap(), ConnectPath::Warm);
    assert_eq!(directory.queries.load(Ordering::SeqCst), 2);
    assert_eq!(pool.idle_count(server.addr), 0);

    server.shutdown();
}
