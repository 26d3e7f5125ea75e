//! Session domain model shared by both nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier that lets a peer enter the shared video session.
///
/// Usually a meeting URL such as `https://meet.example/abc`. The control
/// channel never interprets it; only the video collaborator does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinTarget(String);

impl JoinTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the target carries no characters at all.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JoinTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JoinTarget {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JoinTarget {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies the external process a `ProcessMonitor` watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessIdentity {
    /// A specific process id
    Pid(u32),
    /// Any process whose executable name contains this (case-insensitive)
    Name(String),
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Name(name) => write!(f, "process '{name}'"),
        }
    }
}

/// Role a node takes when joining the video session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Operator side; owns the session and admits guests
    Host,
    /// Reception side; joins under its display name
    Guest,
}

/// Lifecycle of the operator-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorState {
    Idle,
    PrerequisitesChecked,
    JoinTargetAcquired,
    PeerNotified,
    SessionActive,
    Ending,
    Cleaned,
}

impl OperatorState {
    /// Returns true once teardown has begun.
    pub fn is_ending_or_cleaned(self) -> bool {
        matches!(self, Self::Ending | Self::Cleaned)
    }
}

impl fmt::Display for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::PrerequisitesChecked => "prerequisites-checked",
            Self::JoinTargetAcquired => "join-target-acquired",
            Self::PeerNotified => "peer-notified",
            Self::SessionActive => "session-active",
            Self::Ending => "ending",
            Self::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Lifecycle of the reception-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceptionState {
    Listening,
    JoinTargetReceived,
    Joining,
    SessionActive,
    Ending,
    Cleaned,
}

impl ReceptionState {
    /// Returns true once teardown has begun.
    pub fn is_ending_or_cleaned(self) -> bool {
        matches!(self, Self::Ending | Self::Cleaned)
    }

    /// Returns true if a new join target may start a session.
    pub fn accepts_join_target(self) -> bool {
        matches!(self, Self::Listening | Self::Cleaned)
    }
}

impl fmt::Display for ReceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Listening => "listening",
            Self::JoinTargetReceived => "join-target-received",
            Self::Joining => "joining",
            Self::SessionActive => "session-active",
            Self::Ending => "ending",
            Self::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Why a session is being torn down.
///
/// Whichever side detects termination first is the initiator and relays
/// `command("end")` to its peer; a peer-requested teardown never relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownCause {
    /// The local ProcessMonitor observed the collaborator exit
    LocalExit,
    /// The peer sent `command("end")`
    PeerEnded,
    /// The session channel to the peer was lost
    PeerLost(String),
    /// The local join failed after the peer had been informed
    JoinFailed(String),
    /// The operator of this process asked to stop (Ctrl-C, service stop)
    Shutdown,
    /// `force_cleanup` from the peer; clean up without relaying
    ForceCleanup,
}

impl TeardownCause {
    /// Returns true if this node initiated the teardown and must relay `end`.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::LocalExit | Self::PeerLost(_) | Self::JoinFailed(_) | Self::Shutdown
        )
    }
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalExit => write!(f, "local collaborator exited"),
            Self::PeerEnded => write!(f, "peer ended the session"),
            Self::PeerLost(reason) => write!(f, "peer lost: {reason}"),
            Self::JoinFailed(reason) => write!(f, "join failed: {reason}"),
            Self::Shutdown => write!(f, "shutdown requested"),
            Self::ForceCleanup => write!(f, "forced cleanup"),
        }
    }
}

/// Terminal outcome as seen at the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal clean shutdown
    Clean,
    /// Configuration or join-target failure
    Failure,
    /// A collaborator prerequisite could not be met
    PrerequisiteFailure,
    /// The peer could not be reached within the retry bound
    PeerUnreachable,
    /// Malformed frames or a rejected request
    ProtocolError,
}

impl ExitStatus {
    /// Process exit code for this outcome.
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Failure => 1,
            Self::PrerequisiteFailure => 2,
            Self::PeerUnreachable => 3,
            Self::ProtocolError => 4,
        }
    }
}

/// Category of a `Notification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Usage record: a session started or ended
    Usage,
    /// Something failed and an operator should look
    Error,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

/// Usage or error report handed to a `Notifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    /// Ordered key/value context, e.g. the join target
    pub details: Vec<(String, String)>,
}

impl Notification {
    pub fn usage(title: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Usage,
            title: title.into(),
            details: Vec::new(),
        }
    }

    /// An error report carrying `error` as its first detail.
    pub fn error(title: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            details: vec![("error".to_string(), error.to_string())],
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Notification {
    /// `[kind] title (key: value, key: value)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.title)?;
        let mut details = self.details.iter();
        if let Some((key, value)) = details.next() {
            write!(f, " ({key}: {value}")?;
            for (key, value) in details {
                write!(f, ", {key}: {value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}
