//! Interfaces to the external collaborators both nodes depend on.
//!
//! The control channel never drives a browser, a video provider or an avatar
//! application directly. It talks to them only through these traits so that
//! session logic can be exercised against in-process fakes.

mod command;

pub use command::{CommandAvatar, CommandNotifier, CommandVideo};

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::CollaboratorResult;
use crate::model::{JoinTarget, Notification, ProcessIdentity, Role};

/// The video-conferencing collaborator.
#[async_trait]
pub trait VideoCollaborator: Send + Sync {
    /// Creates a new session and returns the target peers use to enter it.
    async fn create_session(&self) -> CollaboratorResult<JoinTarget>;

    /// Enters the session at `target`. Returns `Ok(false)` when the provider
    /// refused the join without an error of its own.
    async fn join(&self, target: &JoinTarget, role: Role) -> CollaboratorResult<bool>;

    /// Application-level liveness: does the collaborator still report itself
    /// as in session?
    async fn is_active(&self) -> bool;

    /// Process the `ProcessMonitor` should watch while a session is active.
    fn process_identity(&self) -> ProcessIdentity;

    /// Leaves the current session. Called during cleanup.
    async fn leave(&self) -> CollaboratorResult<()>;
}

/// The avatar-control collaborator.
#[async_trait]
pub trait AvatarCollaborator: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Starts the application. Idempotent if it is already running.
    async fn launch(&self) -> bool;
}

/// Overlay-network peer directory mapping logical names to addresses.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Returns `Ok(None)` when the directory answered but has no such peer.
    async fn resolve(&self, name: &str) -> CollaboratorResult<Option<IpAddr>>;

    /// Checks that the directory itself is usable.
    async fn health(&self) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// OS-level process liveness check.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, identity: &ProcessIdentity) -> bool;
}

/// Sink for usage and error reports, e.g. a team chat webhook.
///
/// Delivery is best effort. Implementations log their own failures; a
/// notification never affects session state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Notifier that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: Notification) {}
}
