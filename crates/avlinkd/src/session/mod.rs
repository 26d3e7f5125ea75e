//! Reception session handler using the Actor pattern.
//!
//! The session actor is the single owner of the reception node's
//! `ReceptionState`. The server's connection handlers, the join task, the
//! process monitor and the peer-disconnect grace timer all talk to it
//! through a `SessionCommand` channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  SessionActor   │────▶│  watch channel  │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!         │                  ▲     ▲     ▲                │
//!         │ SessionCommand   │     │     │                ▼
//!         ▼                join  monitor grace      ReceptionState
//!   join-target/command    task   exit   timer       observers
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use avlink_core::collaborator::{LivenessProbe, Notifier, VideoCollaborator};
use avlink_core::{LinkConfig, ReceptionState};

mod actor;
mod commands;
mod handle;

pub use actor::SessionActor;
pub use commands::{HandlerError, SessionCommand, SessionSnapshot};
pub use handle::SessionHandle;

/// Command channel buffer size
const COMMAND_BUFFER: usize = 32;

/// Spawns the session actor and returns a handle for interaction.
///
/// The handle doubles as the server's `MessageHandler`. The actor stops
/// once `SessionHandle::shutdown` is called or every handle is dropped.
///
/// # Example
///
/// ```ignore
/// let session = spawn_session_handler(&config, video, probe, notifier);
/// let server = TransportServer::bind(addr, Arc::new(session.clone()), &config, token).await?;
/// ```
pub fn spawn_session_handler(
    config: &LinkConfig,
    video: Arc<dyn VideoCollaborator>,
    probe: Arc<dyn LivenessProbe>,
    notifier: Arc<dyn Notifier>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(ReceptionState::Listening);

    let actor = SessionActor::new(
        cmd_rx,
        cmd_tx.downgrade(),
        state_tx,
        config,
        video,
        probe,
        notifier,
    );
    tokio::spawn(actor.run());

    SessionHandle::new(cmd_tx, state_rx)
}
