//! Per-connection handling for the reception server.
//!
//! Each accepted TCP connection gets its own `ConnectionHandler` that:
//! - Decodes frames with `FramedMessageCodec`
//! - Dispatches requests to the registered `MessageHandler`
//! - Writes exactly one `Ack` back per request
//! - Routes response frames to the `SessionChannel` waiting on them
//!
//! A malformed frame drops only this connection; other connections are
//! unaffected.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avlink_protocol::{Ack, ControlMessage, Frame, FrameError, FramedMessageCodec, Payload};

use super::MessageHandler;

/// Write timeout for a single frame.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies one accepted connection.
pub type ChannelId = u64;

// ============================================================================
// Session Channel
// ============================================================================

/// Outbound side of an accepted connection.
///
/// The reception session keeps the channel its join target arrived on and
/// uses it to push `notice` and `command("end")` back to the operator.
/// Cheap to clone.
#[derive(Clone)]
pub struct SessionChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    peer: SocketAddr,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FramedMessageCodec>>,
    /// Serializes outbound requests so at most one response is pending.
    request_lock: Mutex<()>,
    pending: StdMutex<Option<oneshot::Sender<Ack>>>,
    closed: CancellationToken,
}

impl SessionChannel {
    fn new(
        id: ChannelId,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        codec: FramedMessageCodec,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                peer,
                writer: Mutex::new(FramedWrite::new(writer, codec)),
                request_lock: Mutex::new(()),
                pending: StdMutex::new(None),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Returns true once the connection has been closed in either direction.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Writes one frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        match timeout(WRITE_TIMEOUT, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Sends a request to the peer and waits for its acknowledgment.
    pub async fn request(
        &self,
        message: ControlMessage,
        response_timeout: Duration,
    ) -> Result<Ack, ConnectionError> {
        let _guard = self.inner.request_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        self.set_pending(Some(tx));

        if let Err(e) = self.send_frame(Frame::Request(message)).await {
            self.set_pending(None);
            return Err(e);
        }

        match timeout(response_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.set_pending(None);
                Err(ConnectionError::ResponseTimeout)
            }
        }
    }

    fn set_pending(&self, sender: Option<oneshot::Sender<Ack>>) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = sender;
    }

    /// Hands a response frame to the waiting request. Returns false if no
    /// request was waiting.
    fn deliver_response(&self, ack: Ack) -> bool {
        let sender = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    fn mark_closed(&self) {
        self.inner.closed.cancel();
        // Dropping the sender wakes a waiting request with `Closed`.
        self.set_pending(None);
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Handler for a single accepted connection.
pub struct ConnectionHandler {
    reader: FramedRead<OwnedReadHalf, FramedMessageCodec>,
    channel: SessionChannel,
    handler: Arc<dyn MessageHandler>,
    idle_timeout: Duration,
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        id: ChannelId,
        handler: Arc<dyn MessageHandler>,
        codec: FramedMessageCodec,
        idle_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: FramedRead::new(reader, codec.clone()),
            channel: SessionChannel::new(id, peer, writer, codec),
            handler,
            idle_timeout,
            cancel_token,
        }
    }

    /// Returns the outbound channel of this connection.
    pub fn channel(&self) -> SessionChannel {
        self.channel.clone()
    }

    /// Processes frames until the connection closes, then notifies the
    /// handler that the channel is gone.
    pub async fn run(mut self) {
        let id = self.channel.id();
        let peer = self.channel.peer();
        debug!(connection = id, %peer, "Connection accepted");

        match self.process_frames().await {
            Ok(()) => debug!(connection = id, %peer, "Connection closed"),
            Err(e @ ConnectionError::Frame(FrameError::Decode(_))) => {
                warn!(connection = id, %peer, error = %e, "Malformed frame, dropping connection");
            }
            Err(e) => debug!(connection = id, %peer, error = %e, "Connection ended"),
        }

        self.channel.mark_closed();
        self.handler.on_channel_closed(id).await;
    }

    async fn process_frames(&mut self) -> Result<(), ConnectionError> {
        loop {
            let next = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    return Ok(());
                }

                next = timeout(self.idle_timeout, self.reader.next()) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Ok(()),
                Err(_) => return Err(ConnectionError::IdleTimeout),
            };

            match frame {
                Frame::Request(message) => {
                    debug!(connection = self.channel.id(), message = %message, "Received request");
                    let ack = self.dispatch(&message).await;
                    self.channel.send_frame(Frame::Response(ack.clone())).await?;
                    self.handler.after_ack(&message, &ack, &self.channel).await;
                }
                Frame::Response(ack) => {
                    if !self.channel.deliver_response(ack.clone()) {
                        debug!(connection = self.channel.id(), ack = %ack, "Unsolicited response ignored");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: &ControlMessage) -> Ack {
        match &message.payload {
            Payload::JoinTarget(target) => {
                info!(connection = self.channel.id(), target = %target, "Join target received");
                self.handler
                    .on_join_target(target.clone(), self.channel.clone())
                    .await
            }
            Payload::Command { name, params } => self.handler.on_command(name, params).await,
            Payload::Notice(_) if message.is_heartbeat() => Ack::ok(avlink_protocol::HEARTBEAT),
            Payload::Notice(text) => self.handler.on_notice(text).await,
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection idle for too long")]
    IdleTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("No response within the timeout")]
    ResponseTimeout,
}
