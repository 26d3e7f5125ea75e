//! Session actor - owns the reception session state and processes commands.
//!
//! The SessionActor is the single owner of `ReceptionState`. Network
//! requests, join results, monitor exits and grace-timer expiries all
//! arrive as `SessionCommand`s and are processed sequentially, so every
//! transition is serialized.
//!
//! ```text
//! Listening ─join-target─▶ JoinTargetReceived ─ack written─▶ Joining
//!     ▲                                                        │ joined
//!     │                                                        ▼
//!  Cleaned ◀──────────── Ending ◀── exit / end / lost ── SessionActive
//! ```
//!
//! `Cleaned` accepts the next join target just like `Listening`. While a
//! session is active, `leave_meeting` leaves the video session without
//! ending it and `join_meeting` goes back through `Joining`.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel send failures are logged but don't panic
//! - Cleanup never fails; collaborator errors are logged and swallowed

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avlink_core::collaborator::{LivenessProbe, Notifier, VideoCollaborator};
use avlink_core::error::CollaboratorResult;
use avlink_core::{
    JoinTarget, LinkConfig, Notification, ProcessMonitor, ReceptionState, Role, TeardownCause,
};
use avlink_protocol::{
    Ack, ControlMessage, Params, END_COMMAND, FORCE_CLEANUP_COMMAND, JOIN_MEETING_COMMAND,
    LEAVE_MEETING_COMMAND, MEET_URL_PARAM,
};

use super::commands::{SessionCommand, SessionSnapshot};
use crate::server::{ChannelId, SessionChannel};

// ============================================================================
// Session Actor
// ============================================================================

/// The session actor - owns all reception session state.
pub struct SessionActor {
    receiver: mpsc::Receiver<SessionCommand>,

    /// Used by spawned tasks to report back without keeping the actor alive
    sender: mpsc::WeakSender<SessionCommand>,

    state: ReceptionState,
    state_tx: watch::Sender<ReceptionState>,

    /// Incremented for every new session and every teardown
    generation: u64,

    target: Option<JoinTarget>,

    /// Connection the join target arrived on; used to reach the operator
    channel: Option<SessionChannel>,

    /// Pending peer-disconnect grace timer
    grace_timer: Option<CancellationToken>,

    /// Joined to the video session (false after `leave_meeting`)
    in_video_session: bool,

    video: Arc<dyn VideoCollaborator>,
    monitor: ProcessMonitor,
    /// Incremented per monitor start; exits of older cycles are ignored
    monitor_cycle: u64,
    notifier: Arc<dyn Notifier>,

    response_timeout: Duration,
    peer_disconnect_grace: Duration,

    ends_received: u32,
    sessions_completed: u64,
}

impl SessionActor {
    pub fn new(
        receiver: mpsc::Receiver<SessionCommand>,
        sender: mpsc::WeakSender<SessionCommand>,
        state_tx: watch::Sender<ReceptionState>,
        config: &LinkConfig,
        video: Arc<dyn VideoCollaborator>,
        probe: Arc<dyn LivenessProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            receiver,
            sender,
            state: ReceptionState::Listening,
            state_tx,
            generation: 0,
            target: None,
            channel: None,
            grace_timer: None,
            in_video_session: false,
            video,
            monitor: ProcessMonitor::new(probe, config.poll_interval),
            monitor_cycle: 0,
            notifier,
            response_timeout: config.response_timeout,
            peer_disconnect_grace: config.peer_disconnect_grace,
            ends_received: 0,
            sessions_completed: 0,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Session actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd).await {
                break;
            }
        }

        self.monitor.stop();
        info!(
            sessions_completed = self.sessions_completed,
            "Session actor stopped"
        );
    }

    /// Dispatches a command. Returns false once the actor should stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::JoinTarget {
                target,
                channel,
                respond_to,
            } => {
                let ack = self.handle_join_target(target, channel);
                let _ = respond_to.send(ack);
            }
            SessionCommand::BeginJoin { channel } => {
                self.handle_begin_join(channel);
            }
            SessionCommand::JoinFinished { generation, result } => {
                self.handle_join_finished(generation, result).await;
            }
            SessionCommand::Command {
                name,
                params,
                respond_to,
            } => {
                self.handle_named_command(&name, &params, respond_to).await;
            }
            SessionCommand::MonitorExited { cycle } => {
                if cycle == self.monitor_cycle && self.state == ReceptionState::SessionActive {
                    self.teardown(TeardownCause::LocalExit).await;
                } else {
                    debug!(cycle, "Ignoring stale monitor exit");
                }
            }
            SessionCommand::ChannelClosed { channel } => {
                self.handle_channel_closed(channel);
            }
            SessionCommand::PeerLost { generation } => {
                if generation == self.generation && self.is_active() {
                    self.teardown(TeardownCause::PeerLost("session channel closed".to_string()))
                        .await;
                }
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionCommand::Shutdown { respond_to } => {
                self.handle_shutdown().await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_join_target(&mut self, target: JoinTarget, channel: SessionChannel) -> Ack {
        if !self.state.accepts_join_target() {
            if self.target.as_ref() == Some(&target) {
                // The operator retried after losing our ack; its new
                // connection is the session channel from now on.
                info!(
                    target = %target,
                    channel = channel.id(),
                    state = %self.state,
                    "Join target redelivered, adopting new session channel"
                );
                self.channel = Some(channel);
                self.cancel_grace_timer();
                return Ack::ok("already received");
            }
            warn!(state = %self.state, target = %target, "Rejecting join target, session in progress");
            return Ack::error(format!("session already {}", self.state));
        }
        if target.is_empty() {
            return Ack::error("empty join target");
        }

        self.generation += 1;
        self.ends_received = 0;
        self.target = Some(target.clone());
        self.channel = Some(channel);
        self.cancel_grace_timer();
        self.set_state(ReceptionState::JoinTargetReceived);

        info!(target = %target, generation = self.generation, "Join target accepted");
        Ack::ok("received")
    }

    fn handle_begin_join(&mut self, channel: ChannelId) {
        if self.state != ReceptionState::JoinTargetReceived
            || self.channel.as_ref().map(SessionChannel::id) != Some(channel)
        {
            debug!(channel, state = %self.state, "Ignoring join start for inactive channel");
            return;
        }
        let Some(target) = self.target.clone() else {
            return;
        };

        self.set_state(ReceptionState::Joining);
        self.spawn_join(target, false);
    }

    async fn handle_join_finished(&mut self, generation: u64, result: CollaboratorResult<bool>) {
        if generation != self.generation || self.state != ReceptionState::Joining {
            debug!(generation, "Ignoring stale join result");
            return;
        }

        match result {
            Ok(true) => {
                self.in_video_session = true;
                self.set_state(ReceptionState::SessionActive);
                self.start_monitor();
                info!(target = ?self.target.as_ref().map(JoinTarget::as_str), "Session active");

                let mut notification = Notification::usage("Reception joined the video session");
                if let Some(target) = &self.target {
                    notification = notification.with_detail("target", target);
                }
                self.notify(notification);
            }
            Ok(false) => {
                self.teardown(TeardownCause::JoinFailed("video collaborator refused the join".into()))
                    .await;
            }
            Err(e) => {
                self.teardown(TeardownCause::JoinFailed(e.to_string())).await;
            }
        }
    }

    async fn handle_named_command(
        &mut self,
        name: &str,
        params: &Params,
        respond_to: tokio::sync::oneshot::Sender<Ack>,
    ) {
        match name {
            END_COMMAND => {
                self.ends_received = self.ends_received.saturating_add(1);
                if self.is_active() {
                    let _ = respond_to.send(Ack::ok("ending"));
                    self.teardown(TeardownCause::PeerEnded).await;
                } else {
                    debug!(state = %self.state, "End received with no active session");
                    let _ = respond_to.send(Ack::ok("no active session"));
                }
            }
            FORCE_CLEANUP_COMMAND => {
                let _ = respond_to.send(Ack::ok("cleaning up"));
                if self.is_active() {
                    self.teardown(TeardownCause::ForceCleanup).await;
                }
            }
            JOIN_MEETING_COMMAND => {
                let ack = self.handle_join_meeting(params);
                let _ = respond_to.send(ack);
            }
            LEAVE_MEETING_COMMAND => {
                let ack = self.handle_leave_meeting().await;
                let _ = respond_to.send(ack);
            }
            other => {
                warn!(command = other, "Unknown command");
                let _ = respond_to.send(Ack::error(format!("unknown command '{other}'")));
            }
        }
    }

    /// Re-joins the video session of the active session, at `meet_url` if
    /// given or at the current target otherwise.
    fn handle_join_meeting(&mut self, params: &Params) -> Ack {
        if self.state != ReceptionState::SessionActive {
            debug!(state = %self.state, "Rejecting join_meeting");
            return Ack::error(format!("cannot join while {}", self.state));
        }
        let target = match params.get(MEET_URL_PARAM) {
            Some(value) => match value.as_str() {
                Some(url) if !url.trim().is_empty() => JoinTarget::new(url),
                _ => return Ack::error(format!("'{MEET_URL_PARAM}' must be a non-empty string")),
            },
            None => match self.target.clone() {
                Some(target) => target,
                None => return Ack::error("no join target to join"),
            },
        };

        self.monitor.stop();
        let leave_first = self.in_video_session;
        self.in_video_session = false;
        self.target = Some(target.clone());
        self.set_state(ReceptionState::Joining);
        info!(target = %target, leave_first, "Re-joining video session");

        self.spawn_join(target, leave_first);
        Ack::ok("joining")
    }

    /// Leaves the video session but keeps the control session and its
    /// channel. The monitor stays off until the next join.
    async fn handle_leave_meeting(&mut self) -> Ack {
        if self.state == ReceptionState::Joining {
            return Ack::error("join in progress");
        }
        if !self.in_video_session {
            debug!(state = %self.state, "leave_meeting with no video session");
            return Ack::ok("not in a video session");
        }

        self.monitor.stop();
        self.in_video_session = false;
        match self.video.leave().await {
            Ok(()) => {
                info!("Left video session, control session continues");
                Ack::ok("left")
            }
            Err(e) => {
                warn!(error = %e, "Failed to leave video session");
                self.notify(Notification::error("Reception could not leave the video session", &e));
                Ack::error(e.to_string())
            }
        }
    }

    fn handle_channel_closed(&mut self, channel: ChannelId) {
        let is_session_channel = self.channel.as_ref().map(SessionChannel::id) == Some(channel);
        if !is_session_channel {
            return;
        }
        self.channel = None;

        if !self.is_active() {
            return;
        }

        warn!(
            grace_ms = self.peer_disconnect_grace.as_millis() as u64,
            "Session channel closed, waiting for the operator"
        );

        let token = CancellationToken::new();
        self.grace_timer = Some(token.clone());
        let sender = self.sender.clone();
        let generation = self.generation;
        let grace = self.peer_disconnect_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(sender) = sender.upgrade() {
                        let _ = sender.send(SessionCommand::PeerLost { generation }).await;
                    }
                }
            }
        });
    }

    async fn handle_shutdown(&mut self) {
        if self.is_active() {
            if let Some(relay) = self.teardown(TeardownCause::Shutdown).await {
                // Give the operator the chance to see our `end` before exiting.
                let _ = relay.await;
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Runs `Ending → Cleaned`. Returns the task relaying messages to the
    /// operator, if any.
    async fn teardown(&mut self, cause: TeardownCause) -> Option<JoinHandle<()>> {
        let joined = self.state == ReceptionState::Joining || self.in_video_session;
        info!(cause = %cause, state = %self.state, "Session ending");
        self.set_state(ReceptionState::Ending);

        self.monitor.stop();
        self.cancel_grace_timer();
        // Late join results and monitor exits now belong to a dead session.
        self.generation += 1;

        let mut outbound = Vec::new();
        if let TeardownCause::JoinFailed(reason) = &cause {
            outbound.push(ControlMessage::notice(format!("join failed: {reason}")));
        }
        if cause.is_local() {
            outbound.push(ControlMessage::end());
        }

        let relay = match self.channel.take() {
            Some(channel) if !outbound.is_empty() => {
                Some(spawn_relay(channel, outbound, self.response_timeout))
            }
            _ => None,
        };

        self.in_video_session = false;
        if joined {
            if let Err(e) = self.video.leave().await {
                warn!(error = %e, "Failed to leave video session during cleanup");
                self.notify(Notification::error(
                    "Reception could not leave the video session during cleanup",
                    &e,
                ));
            }
        }

        let mut notification = match &cause {
            TeardownCause::JoinFailed(reason) => {
                Notification::error("Reception could not join the video session", reason)
            }
            _ => Notification::usage("Reception session ended").with_detail("cause", &cause),
        };
        if let Some(target) = self.target.take() {
            notification = notification.with_detail("target", target);
        }
        self.notify(notification);

        self.sessions_completed += 1;
        self.set_state(ReceptionState::Cleaned);
        info!(cause = %cause, "Session cleaned up");

        relay
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ReceptionState::JoinTargetReceived
                | ReceptionState::Joining
                | ReceptionState::SessionActive
        )
    }

    fn set_state(&mut self, state: ReceptionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Reception state transition");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Runs the guest join off the actor task and reports back with
    /// `JoinFinished`.
    fn spawn_join(&self, target: JoinTarget, leave_first: bool) {
        let video = Arc::clone(&self.video);
        let sender = self.sender.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if leave_first {
                if let Err(e) = video.leave().await {
                    debug!(error = %e, "Leave before re-join failed");
                }
            }
            let result = video.join(&target, Role::Guest).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(SessionCommand::JoinFinished { generation, result })
                    .await;
            }
        });
    }

    fn notify(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move { notifier.notify(notification).await });
    }

    fn start_monitor(&mut self) {
        self.monitor_cycle += 1;
        let sender = self.sender.clone();
        let cycle = self.monitor_cycle;
        self.monitor.start(
            self.video.process_identity(),
            Arc::clone(&self.video),
            Box::new(move || {
                if let Some(sender) = sender.upgrade() {
                    // The callback runs on the monitor task; never block it.
                    if sender
                        .try_send(SessionCommand::MonitorExited { cycle })
                        .is_err()
                    {
                        tokio::spawn(async move {
                            let _ = sender.send(SessionCommand::MonitorExited { cycle }).await;
                        });
                    }
                }
            }),
        );
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(token) = self.grace_timer.take() {
            token.cancel();
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            target: self.target.clone(),
            in_video_session: self.in_video_session,
            ends_received: self.ends_received,
            sessions_completed: self.sessions_completed,
        }
    }
}

/// Sends `messages` to the operator in order. Failures are logged only.
fn spawn_relay(
    channel: SessionChannel,
    messages: Vec<ControlMessage>,
    response_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for message in messages {
            match channel.request(message.clone(), response_timeout).await {
                Ok(ack) if ack.is_ok() => {
                    debug!(message = %message, "Operator acknowledged");
                }
                Ok(ack) => {
                    warn!(message = %message, ack = %ack, "Operator rejected message");
                }
                Err(e) => {
                    warn!(message = %message, error = %e, "Failed to reach operator during cleanup");
                    return;
                }
            }
        }
    })
}
