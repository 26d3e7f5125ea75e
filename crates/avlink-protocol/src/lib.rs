//! avlink Protocol - Wire protocol for the avlink control channel
//!
//! This crate provides the message types exchanged between the operator
//! and reception nodes and the length-delimited codec that frames them.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, decode_frame, encode, encode_frame, FramedMessageCodec};
pub use error::{DecodeError, FrameError};
pub use message::{
    Ack, AckStatus, ControlMessage, Frame, MessageKind, Params, Payload, Scalar, END_COMMAND,
    FORCE_CLEANUP_COMMAND, HEARTBEAT, JOIN_MEETING_COMMAND, LEAVE_MEETING_COMMAND, MEET_URL_PARAM,
};
