//! Client interface for interacting with the SessionActor.
//!
//! `SessionHandle` is the `MessageHandler` the server dispatches to. It is
//! cheap to clone and forwards every request to the actor, so all session
//! transitions happen on the actor's task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors become `Ack::error` or `HandlerError::ChannelClosed`

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use avlink_core::{JoinTarget, ReceptionState};
use avlink_protocol::{Ack, ControlMessage, Params, Payload};

use super::commands::{HandlerError, SessionCommand, SessionSnapshot};
use crate::server::{ChannelId, MessageHandler, SessionChannel};

/// Handle for interacting with the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ReceptionState>,
}

impl SessionHandle {
    pub fn new(sender: mpsc::Sender<SessionCommand>, state: watch::Receiver<ReceptionState>) -> Self {
        Self { sender, state }
    }

    /// Current reception state.
    pub fn state(&self) -> ReceptionState {
        *self.state.borrow()
    }

    /// A receiver that observes every published state.
    pub fn state_watch(&self) -> watch::Receiver<ReceptionState> {
        self.state.clone()
    }

    /// Returns a snapshot of the session.
    ///
    /// # Errors
    ///
    /// - `HandlerError::ChannelClosed` if the actor has stopped
    pub async fn snapshot(&self) -> Result<SessionSnapshot, HandlerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| HandlerError::ChannelClosed)?;
        rx.await.map_err(|_| HandlerError::ChannelClosed)
    }

    /// Tears down any active session, relaying `end` to the operator, and
    /// stops the actor.
    pub async fn shutdown(&self) -> Result<(), HandlerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| HandlerError::ChannelClosed)?;
        rx.await.map_err(|_| HandlerError::ChannelClosed)
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<Ack>) -> SessionCommand) -> Ack {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(build(tx)).await.is_err() {
            return Ack::error(HandlerError::ChannelClosed.to_string());
        }
        rx.await
            .unwrap_or_else(|_| Ack::error(HandlerError::ChannelClosed.to_string()))
    }
}

#[async_trait]
impl MessageHandler for SessionHandle {
    async fn on_join_target(&self, target: JoinTarget, channel: SessionChannel) -> Ack {
        self.request(|respond_to| SessionCommand::JoinTarget {
            target,
            channel,
            respond_to,
        })
        .await
    }

    async fn on_command(&self, name: &str, params: &Params) -> Ack {
        let name = name.to_string();
        let params = params.clone();
        self.request(|respond_to| SessionCommand::Command {
            name,
            params,
            respond_to,
        })
        .await
    }

    async fn on_notice(&self, text: &str) -> Ack {
        info!(notice = text, "Notice from operator");
        Ack::ok("received")
    }

    async fn after_ack(&self, message: &ControlMessage, ack: &Ack, channel: &SessionChannel) {
        if matches!(message.payload, Payload::JoinTarget(_)) && ack.is_ok() {
            let _ = self
                .sender
                .send(SessionCommand::BeginJoin {
                    channel: channel.id(),
                })
                .await;
        }
    }

    async fn on_channel_closed(&self, channel: ChannelId) {
        if self
            .sender
            .send(SessionCommand::ChannelClosed { channel })
            .await
            .is_err()
        {
            debug!(channel, "Session actor gone, ignoring closed channel");
        }
    }
}
