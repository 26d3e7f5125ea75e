//! Protocol error types.

use std::io;

use thiserror::Error;

/// A frame or frame body that cannot be turned into a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("message has no type")]
    MissingKind,

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    #[error("{kind} payload does not match its type: {reason}")]
    PayloadMismatch { kind: &'static str, reason: String },

    #[error("invalid acknowledgment: {0}")]
    InvalidAck(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("length prefix announces {expected} bytes but only {actual} are present")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Errors surfaced by the streaming codec.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
