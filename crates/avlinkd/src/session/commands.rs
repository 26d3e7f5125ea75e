//! Session actor commands, errors, and snapshots.
//!
//! This module defines the message types for communicating with the
//! `SessionActor`:
//! - `SessionCommand`: commands sent to the actor
//! - `HandlerError`: errors surfaced by the `SessionHandle`
//! - `SessionSnapshot`: a point-in-time view of the reception session

use thiserror::Error;
use tokio::sync::oneshot;

use avlink_core::error::CollaboratorResult;
use avlink_core::{JoinTarget, ReceptionState};
use avlink_protocol::{Ack, Params};

use crate::server::{ChannelId, SessionChannel};

// ============================================================================
// Session Commands
// ============================================================================

/// Commands sent to the session actor.
///
/// Requests from the network carry a oneshot channel for the `Ack`. Events
/// raised by spawned tasks (join, grace timer) carry the session generation
/// they belong to, and monitor exits their monitor cycle, so that late events
/// from a finished session or a replaced join are ignored.
#[derive(Debug)]
pub enum SessionCommand {
    /// A join target arrived on `channel`.
    JoinTarget {
        target: JoinTarget,
        channel: SessionChannel,
        respond_to: oneshot::Sender<Ack>,
    },

    /// The acknowledgment for the join target on `channel` has been written;
    /// the join may start.
    BeginJoin { channel: ChannelId },

    /// The video collaborator's join operation completed.
    JoinFinished {
        generation: u64,
        result: CollaboratorResult<bool>,
    },

    /// A named command from the operator.
    Command {
        name: String,
        params: Params,
        respond_to: oneshot::Sender<Ack>,
    },

    /// The process monitor of cycle `cycle` observed the collaborator exit.
    MonitorExited { cycle: u64 },

    /// A connection closed.
    ChannelClosed { channel: ChannelId },

    /// The session channel stayed closed for the whole grace period.
    PeerLost { generation: u64 },

    /// Tear down any active session (relaying `end`) and stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },

    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of the reception session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ReceptionState,

    /// Join target of the current session, if any
    pub target: Option<JoinTarget>,

    /// True while the video collaborator is joined; false after
    /// `leave_meeting` even though the session continues
    pub in_video_session: bool,

    /// `command("end")` messages received since the last join target
    pub ends_received: u32,

    /// Sessions that reached `Cleaned` since the actor started
    pub sessions_completed: u64,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by `SessionHandle` queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The actor has stopped.
    #[error("session actor is not running")]
    ChannelClosed,
}
