//! The operator's session channel.
//!
//! Once the reception node has acknowledged the join target, the connection
//! that carried it stays open for the rest of the session as a `PeerLink`.
//! Both directions share it:
//!
//! - the reader task answers the reception node's requests (`end`, notices)
//!   and routes acknowledgments to the pending outbound request
//! - the heartbeat task checks the peer periodically
//!
//! Termination signals surface as `LinkEvent`s on an mpsc channel that the
//! `SessionController` selects on.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avlink_protocol::{Ack, ControlMessage, Frame, FramedMessageCodec, Payload, END_COMMAND};

use crate::client::PooledConnection;
use crate::error::{OperatorError, Result};

/// Write timeout for a single frame.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Link event buffer size
const EVENT_BUFFER: usize = 8;

type LinkWriter = SplitSink<Framed<TcpStream, FramedMessageCodec>, Frame>;
type LinkReader = SplitStream<Framed<TcpStream, FramedMessageCodec>>;

/// Termination signals raised by the session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The reception node sent `command("end")`
    PeerEnded,
    /// The channel closed, failed to decode, or missed a heartbeat
    PeerLost(String),
}

/// Timing for a `PeerLink`.
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub heartbeat_interval: Duration,
    pub response_timeout: Duration,
}

/// Session channel to the reception node.
pub struct PeerLink {
    shared: Arc<LinkShared>,
    reader_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

struct LinkShared {
    peer: SocketAddr,
    writer: Mutex<LinkWriter>,
    /// Serializes outbound requests so at most one response is pending.
    request_lock: Mutex<()>,
    pending: StdMutex<Option<oneshot::Sender<Ack>>>,
    closed: CancellationToken,
}

impl PeerLink {
    /// Takes over a connection whose join target was just acknowledged.
    pub fn start(conn: PooledConnection, timing: LinkTiming) -> (Self, mpsc::Receiver<LinkEvent>) {
        let peer = conn.peer_address;
        let (writer, reader) = conn.into_framed().split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let shared = Arc::new(LinkShared {
            peer,
            writer: Mutex::new(writer),
            request_lock: Mutex::new(()),
            pending: StdMutex::new(None),
            closed: CancellationToken::new(),
        });

        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader, events_tx.clone()));
        let heartbeat_task = tokio::spawn(heartbeat_loop(Arc::clone(&shared), timing, events_tx));

        info!(peer = %peer, "Session channel open");

        (
            Self {
                shared,
                reader_task,
                heartbeat_task,
            },
            events_rx,
        )
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Sends a request over the session channel and waits for its `Ack`.
    pub async fn request(&self, message: ControlMessage, response_timeout: Duration) -> Result<Ack> {
        self.shared.request(message, response_timeout).await
    }

    /// Closes the channel. No `LinkEvent` is raised for a deliberate close.
    pub async fn close(mut self) {
        self.shared.closed.cancel();
        self.shared.set_pending(None);
        self.heartbeat_task.abort();

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!(peer = %self.shared.peer, error = %e, "Error closing session channel");
        }
        drop(writer);

        if let Err(e) = (&mut self.reader_task).await {
            debug!(error = %e, "Session channel reader ended abnormally");
        }
        info!(peer = %self.shared.peer, "Session channel closed");
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        self.heartbeat_task.abort();
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LinkShared {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(OperatorError::Connection {
                addr: self.peer,
                reason: "session channel closed".to_string(),
            });
        }
        let mut writer = self.writer.lock().await;
        match timeout(WRITE_TIMEOUT, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(OperatorError::Timeout("frame write")),
        }
    }

    async fn request(&self, message: ControlMessage, response_timeout: Duration) -> Result<Ack> {
        let _guard = self.request_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        self.set_pending(Some(tx));

        if let Err(e) = self.send_frame(Frame::Request(message)).await {
            self.set_pending(None);
            return Err(e);
        }

        match timeout(response_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(OperatorError::Connection {
                addr: self.peer,
                reason: "session channel closed while awaiting response".to_string(),
            }),
            Err(_) => {
                self.set_pending(None);
                Err(OperatorError::Timeout("response"))
            }
        }
    }

    fn set_pending(&self, sender: Option<oneshot::Sender<Ack>>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn deliver_response(&self, ack: Ack) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Marks the channel lost and reports it, unless it was closed on
    /// purpose.
    async fn lost(&self, events: &mpsc::Sender<LinkEvent>, reason: String) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.set_pending(None);
        warn!(peer = %self.peer, reason = %reason, "Session channel lost");
        let _ = events.send(LinkEvent::PeerLost(reason)).await;
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

async fn read_loop(shared: Arc<LinkShared>, mut reader: LinkReader, events: mpsc::Sender<LinkEvent>) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = shared.closed.cancelled() => return,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Request(message))) => {
                let (ack, event) = answer(&message);
                if let Err(e) = shared.send_frame(Frame::Response(ack)).await {
                    shared.lost(&events, format!("failed to acknowledge: {e}")).await;
                    return;
                }
                if let Some(event) = event {
                    let _ = events.send(event).await;
                }
            }
            Some(Ok(Frame::Response(ack))) => {
                if !shared.deliver_response(ack) {
                    debug!(peer = %shared.peer, "Dropping unsolicited response");
                }
            }
            Some(Err(e)) => {
                shared.lost(&events, format!("malformed frame: {e}")).await;
                return;
            }
            None => {
                shared.lost(&events, "connection closed by peer".to_string()).await;
                return;
            }
        }
    }
}

/// Acknowledgment for an inbound request, plus the event it raises.
fn answer(message: &ControlMessage) -> (Ack, Option<LinkEvent>) {
    match &message.payload {
        Payload::Command { name, .. } if name == END_COMMAND => {
            info!("Reception node ended the session");
            (Ack::ok("ending"), Some(LinkEvent::PeerEnded))
        }
        Payload::Command { name, .. } => {
            warn!(command = %name, "Unknown command from reception node");
            (Ack::error(format!("unknown command '{name}'")), None)
        }
        Payload::Notice(_) if message.is_heartbeat() => (Ack::ok("alive"), None),
        Payload::Notice(text) => {
            info!(notice = %text, "Notice from reception node");
            (Ack::ok("noted"), None)
        }
        Payload::JoinTarget(_) => (
            Ack::error("operator node does not accept join targets"),
            None,
        ),
    }
}

async fn heartbeat_loop(shared: Arc<LinkShared>, timing: LinkTiming, events: mpsc::Sender<LinkEvent>) {
    let period = timing.heartbeat_interval;
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shared.closed.cancelled() => return,
            _ = tick.tick() => {}
        }

        match shared
            .request(ControlMessage::heartbeat(), timing.response_timeout)
            .await
        {
            Ok(ack) if ack.is_ok() => debug!(peer = %shared.peer, "Heartbeat acknowledged"),
            Ok(ack) => debug!(peer = %shared.peer, ack = %ack, "Heartbeat answered with error"),
            Err(e) => {
                shared.lost(&events, format!("heartbeat failed: {e}")).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avlink_core::JoinTarget;
    use avlink_protocol::{AckStatus, Params};

    #[test]
    fn test_end_raises_peer_ended() {
        let (ack, event) = answer(&ControlMessage::end());
        assert!(ack.is_ok());
        assert_eq!(event, Some(LinkEvent::PeerEnded));
    }

    #[test]
    fn test_notice_is_acknowledged_without_event() {
        let (ack, event) = answer(&ControlMessage::notice("join failed on reception"));
        assert!(ack.is_ok());
        assert!(event.is_none());

        let (ack, event) = answer(&ControlMessage::heartbeat());
        assert!(ack.is_ok());
        assert!(event.is_none());
    }

    #[test]
    fn test_unexpected_requests_are_rejected() {
        let (ack, event) = answer(&ControlMessage::command("force_cleanup", Params::new()).unwrap());
        assert_eq!(ack.status, AckStatus::Error);
        assert!(event.is_none());

        let (ack, _) = answer(
            &ControlMessage::join_target(JoinTarget::new("https://meet.example/x")).unwrap(),
        );
        assert_eq!(ack.status, AckStatus::Error);
    }
}
