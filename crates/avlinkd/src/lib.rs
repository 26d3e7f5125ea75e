//! avlinkd - reception node library
//!
//! Provides the control-channel server and the reception session handler:
//! - `server` - TCP server, per-connection handling, `SessionChannel` return path
//! - `session` - the actor that owns `ReceptionState` and drives join and teardown
//!
//! The `avlinkd` binary wires these to the command-line collaborator
//! adapters; tests wire them to in-process fakes.

pub mod server;
pub mod session;

pub use server::{
    ChannelId, ConnectionError, MessageHandler, ServerError, SessionChannel, TransportServer,
};
pub use session::{spawn_session_handler, HandlerError, SessionHandle, SessionSnapshot};
