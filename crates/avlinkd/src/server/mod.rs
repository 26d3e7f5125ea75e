//! TCP control-channel server for the reception node.
//!
//! The server:
//! - Listens on the fixed control port
//! - Spawns a `ConnectionHandler` for each accepted connection
//! - Dispatches decoded requests to one `MessageHandler`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ TransportServer │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│ MessageHandler  │
//! │ (per connection)│     │ (SessionHandle) │
//! └─────────────────┘     └─────────────────┘
//!         ▲                       │
//!         │ SessionChannel        │ notice / command("end")
//!         └───────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{ChannelId, ConnectionError, ConnectionHandler, SessionChannel};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use avlink_core::{JoinTarget, LinkConfig};
use avlink_protocol::{Ack, ControlMessage, FramedMessageCodec, Params};

// ============================================================================
// Message Handler
// ============================================================================

/// Receives the requests decoded by the server.
///
/// Dispatch is a closed match over the message kind, so every kind has
/// exactly one entry point here. Each returns the acknowledgment written
/// back to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// A join target arrived on `channel`.
    async fn on_join_target(&self, target: JoinTarget, channel: SessionChannel) -> Ack;

    async fn on_command(&self, name: &str, params: &Params) -> Ack;

    /// A non-heartbeat notice. Heartbeats are answered by the server.
    async fn on_notice(&self, text: &str) -> Ack;

    /// Called once the acknowledgment for `message` has been written.
    async fn after_ack(&self, _message: &ControlMessage, _ack: &Ack, _channel: &SessionChannel) {}

    /// The connection with this id has closed.
    async fn on_channel_closed(&self, _channel: ChannelId) {}
}

// ============================================================================
// Transport Server
// ============================================================================

/// TCP server for the control channel.
pub struct TransportServer {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    codec: FramedMessageCodec,
    idle_timeout: Duration,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl TransportServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        config: &LinkConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            handler,
            codec: FramedMessageCodec::new(config.max_frame_size),
            idle_timeout: config.connection_idle_timeout,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        })
    }

    /// Returns the bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    /// Accepts connections until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "Control server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                            self.spawn_connection(stream, peer, id);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        debug!("Server accept loop stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr, id: ChannelId) {
        let handler = ConnectionHandler::new(
            stream,
            peer,
            id,
            Arc::clone(&self.handler),
            self.codec.clone(),
            self.idle_timeout,
            self.cancel_token.child_token(),
        );
        tokio::spawn(handler.run());
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:9999".parse().unwrap(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:9999"));
        assert!(err.to_string().contains("address in use"));
    }
}
