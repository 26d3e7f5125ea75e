//! avlink Core - Shared types for the avatar control channel
//!
//! This crate provides the domain types shared between the reception
//! node (avlinkd) and the operator node (avlink):
//! - `config` - the `LinkConfig` value object passed to every component
//! - `model` - join targets, process identities, session state enums, exit codes
//! - `collaborator` - interfaces to the video, avatar, overlay-network and notification collaborators
//! - `monitor` - the polling `ProcessMonitor` that drives teardown
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod collaborator;
pub mod config;
pub mod error;
pub mod model;
pub mod monitor;

// Re-exports for convenience
pub use collaborator::{
    AvatarCollaborator, LivenessProbe, NoopNotifier, Notifier, PeerDirectory, VideoCollaborator,
};
pub use config::LinkConfig;
pub use error::{CollaboratorError, ConfigError};
pub use model::{
    ExitStatus, JoinTarget, Notification, NotificationKind, OperatorState, ProcessIdentity,
    ReceptionState, Role, TeardownCause,
};
pub use monitor::{ProcessMonitor, SysinfoProbe};
