//! Error types for the operator node.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use avlink_core::{CollaboratorError, ExitStatus};
use avlink_protocol::{DecodeError, FrameError};

/// Failures seen by the operator node.
///
/// Transport-level variants (`Connection`, `Timeout`) are retried up to the
/// configured bound before they reach the session controller.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// No address is available for the peer.
    #[error("cannot resolve peer '{name}': {reason}")]
    Resolution { name: String, reason: String },

    /// The peer did not accept or verify a connection.
    #[error("cannot connect to {addr}: {reason}")]
    Connection { addr: SocketAddr, reason: String },

    /// A response did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The peer sent a malformed frame.
    #[error("malformed frame from peer: {0}")]
    Decode(#[from] DecodeError),

    /// The avatar collaborator (or overlay network) could not be brought up.
    #[error("prerequisite not met: {0}")]
    Prerequisite(String),

    /// The video collaborator could not provide a join target.
    #[error("no join target: {0}")]
    JoinTarget(#[source] CollaboratorError),

    /// The join target could not be delivered within the retry bound.
    #[error("peer unreachable after {attempts} attempts: {last_error}")]
    PeerUnreachable { attempts: u32, last_error: String },

    /// The peer answered with an error acknowledgment.
    #[error("peer rejected the request: {0}")]
    Rejected(String),

    /// The local host join failed after the peer had been informed.
    #[error("local join failed: {0}")]
    HostJoin(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OperatorError {
    /// Process exit status for this failure.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Prerequisite(_) => ExitStatus::PrerequisiteFailure,
            Self::PeerUnreachable { .. } | Self::Resolution { .. } | Self::Connection { .. } => {
                ExitStatus::PeerUnreachable
            }
            Self::Decode(_) | Self::Rejected(_) => ExitStatus::ProtocolError,
            Self::Timeout(_) | Self::JoinTarget(_) | Self::HostJoin(_) | Self::Io(_) => {
                ExitStatus::Failure
            }
        }
    }

    /// Returns true for failures that the transport retry policy covers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<FrameError> for OperatorError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Io(e),
            FrameError::Decode(e) => Self::Decode(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(
            OperatorError::Prerequisite("avatar".into()).exit_status(),
            ExitStatus::PrerequisiteFailure
        );
        assert_eq!(
            OperatorError::PeerUnreachable {
                attempts: 3,
                last_error: "refused".into()
            }
            .exit_status(),
            ExitStatus::PeerUnreachable
        );
        assert_eq!(
            OperatorError::Decode(DecodeError::MissingKind).exit_status(),
            ExitStatus::ProtocolError
        );
        assert_eq!(OperatorError::Timeout("ack").exit_status(), ExitStatus::Failure);
    }

    #[test]
    fn test_retryable() {
        assert!(OperatorError::Timeout("ack").is_retryable());
        assert!(!OperatorError::Rejected("busy".into()).is_retryable());
        assert!(!OperatorError::Decode(DecodeError::MissingKind).is_retryable());
    }
}
