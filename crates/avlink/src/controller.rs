//! Operator-side session lifecycle.
//!
//! `SessionController` drives one session from prerequisite checks to
//! cleanup:
//!
//! ```text
//! Idle ─▶ PrerequisitesChecked ─▶ JoinTargetAcquired ─▶ PeerNotified
//!                                                           │ host join
//!                                                           ▼
//!          Cleaned ◀── Ending ◀── LocalExit / PeerEnded ── SessionActive
//!                                 PeerLost / Shutdown
//! ```
//!
//! Every failure before `SessionActive` aborts the attempt. Once active,
//! whichever event arrives first decides the `TeardownCause`; a locally
//! caused teardown relays `command("end")` to the reception node.
//!
//! # Panic-Free Guarantees
//!
//! - Cleanup never fails: every error on the teardown path is logged and
//!   swallowed
//! - Channel closure is handled gracefully

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use avlink_core::collaborator::{
    AvatarCollaborator, LivenessProbe, Notifier, PeerDirectory, VideoCollaborator,
};
use avlink_core::error::CollaboratorError;
use avlink_core::{
    ExitStatus, JoinTarget, LinkConfig, Notification, OperatorState, ProcessMonitor, Role,
    TeardownCause,
};
use avlink_protocol::ControlMessage;

use crate::client::{ConnectionPool, TransportClient};
use crate::error::{OperatorError, Result};
use crate::link::{LinkEvent, LinkTiming, PeerLink};
use crate::resolver::AddressResolver;

/// Session event buffer size
const EVENT_BUFFER: usize = 16;

/// Upper bound on the avatar readiness poll period.
const AVATAR_POLL_PERIOD: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

/// Events that end an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The local ProcessMonitor observed the video collaborator exit
    LocalExit,
    /// The reception node sent `command("end")`
    PeerEnded,
    /// The session channel closed or missed a heartbeat
    PeerLost(String),
    /// The operator asked to stop (Ctrl-C)
    ShutdownRequested,
}

impl SessionEvent {
    fn into_cause(self) -> TeardownCause {
        match self {
            Self::LocalExit => TeardownCause::LocalExit,
            Self::PeerEnded => TeardownCause::PeerEnded,
            Self::PeerLost(reason) => TeardownCause::PeerLost(reason),
            Self::ShutdownRequested => TeardownCause::Shutdown,
        }
    }
}

impl From<LinkEvent> for SessionEvent {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::PeerEnded => Self::PeerEnded,
            LinkEvent::PeerLost(reason) => Self::PeerLost(reason),
        }
    }
}

/// External collaborators the operator node drives.
#[derive(Clone)]
pub struct Collaborators {
    pub video: Arc<dyn VideoCollaborator>,
    pub avatar: Arc<dyn AvatarCollaborator>,
    pub directory: Arc<dyn PeerDirectory>,
    pub probe: Arc<dyn LivenessProbe>,
    /// Receives usage reports for session start and end, and error reports
    pub notifier: Arc<dyn Notifier>,
}

/// Prerequisite checks the operator chose to skip.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    pub skip_avatar_check: bool,
    pub skip_overlay_check: bool,
}

/// Terminal result of `SessionController::run`.
#[derive(Debug)]
pub struct SessionOutcome {
    pub status: ExitStatus,
    /// Why the session ended, if it became active
    pub cause: Option<TeardownCause>,
    /// Why the attempt failed, if it did
    pub error: Option<OperatorError>,
    pub target: Option<JoinTarget>,
}

impl SessionOutcome {
    fn failed(error: OperatorError, target: Option<JoinTarget>) -> Self {
        Self {
            status: error.exit_status(),
            cause: None,
            error: Some(error),
            target,
        }
    }
}

/// Cloneable handle for observing and stopping a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::Sender<SessionEvent>,
    state: watch::Receiver<OperatorState>,
}

impl ControllerHandle {
    pub fn state(&self) -> OperatorState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<OperatorState> {
        self.state.clone()
    }

    /// Requests a locally triggered teardown.
    pub fn shutdown(&self) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(SessionEvent::ShutdownRequested)
        {
            let events = self.events.clone();
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Runs one operator session against one reception peer.
pub struct SessionController {
    session: OperatorSession,
    events_rx: mpsc::Receiver<SessionEvent>,
}

/// Everything but the event receiver, so establishment can borrow it while
/// the receiver is polled for shutdown.
struct OperatorSession {
    peer: String,
    config: LinkConfig,
    collaborators: Collaborators,
    options: ControllerOptions,
    resolver: AddressResolver,
    pool: ConnectionPool,
    monitor: ProcessMonitor,
    state: watch::Sender<OperatorState>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SessionController {
    /// `peer` is a logical overlay-network name or a literal IP address.
    pub fn new(
        peer: impl Into<String>,
        config: LinkConfig,
        collaborators: Collaborators,
        options: ControllerOptions,
    ) -> Self {
        let resolver = AddressResolver::new(Arc::clone(&collaborators.directory), &config);
        let pool = ConnectionPool::new(&config);
        let monitor = ProcessMonitor::new(Arc::clone(&collaborators.probe), config.poll_interval);
        let (state, _) = watch::channel(OperatorState::Idle);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        Self {
            session: OperatorSession {
                peer: peer.into(),
                config,
                collaborators,
                options,
                resolver,
                pool,
                monitor,
                state,
                events_tx,
            },
            events_rx,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            events: self.session.events_tx.clone(),
            state: self.session.state.subscribe(),
        }
    }

    pub fn state(&self) -> OperatorState {
        *self.session.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<OperatorState> {
        self.session.state.subscribe()
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.session.resolver
    }

    /// Resolves the peer and parks one probed connection in the pool so the
    /// join target can go out over a warm connection.
    pub async fn warm_up(&self) -> Result<()> {
        self.session.warm_up().await
    }

    /// Runs the session to completion.
    pub async fn run(self) -> SessionOutcome {
        let Self {
            session,
            mut events_rx,
        } = self;
        info!(peer = %session.peer, "Starting operator session");

        let prepared = tokio::select! {
            result = session.prepare() => result,
            _ = wait_for_shutdown(&mut events_rx) => {
                info!("Shutdown requested before the session became active");
                session.release(OperatorState::Cleaned);
                return SessionOutcome {
                    status: ExitStatus::Clean,
                    cause: Some(TeardownCause::Shutdown),
                    error: None,
                    target: None,
                };
            }
        };

        let (target, link, link_events) = match prepared {
            Ok(prepared) => prepared,
            Err(failure) => {
                error!(error = %failure.error, "Session attempt failed");
                session.release(OperatorState::Cleaned);
                session
                    .notify(
                        Notification::error("Operator session could not start", &failure.error)
                            .with_detail("peer", &session.peer),
                    )
                    .await;
                return SessionOutcome::failed(failure.error, failure.target);
            }
        };

        if let Err(e) = session.host_join(&target).await {
            error!(error = %e, "Local host join failed");
            session
                .teardown(TeardownCause::JoinFailed(e.to_string()), link)
                .await;
            return SessionOutcome::failed(e, Some(target));
        }

        session.start_monitor();
        session.set_state(OperatorState::SessionActive);
        info!(target = %target, "Session active");
        session
            .notify(
                Notification::usage("Operator session started")
                    .with_detail("peer", &session.peer)
                    .with_detail("target", &target),
            )
            .await;

        let cause = wait_for_end(&mut events_rx, link_events).await;
        session.teardown(cause.clone(), link).await;

        SessionOutcome {
            status: ExitStatus::Clean,
            cause: Some(cause),
            error: None,
            target: Some(target),
        }
    }
}

impl OperatorSession {
    async fn warm_up(&self) -> Result<()> {
        let mut client = self.client();
        let path = client.connect().await?;
        client.disconnect(true);
        debug!(peer = %self.peer, path = ?path, "Connection warmed up");
        Ok(())
    }

    // ========================================================================
    // Establishment
    // ========================================================================

    /// Idle through PeerNotified.
    async fn prepare(
        &self,
    ) -> std::result::Result<(JoinTarget, PeerLink, mpsc::Receiver<LinkEvent>), PrepareFailure>
    {
        // Warm the connection while the collaborators come up.
        let (prerequisites, warmed) = tokio::join!(self.check_prerequisites(), self.warm_up());
        if let Err(e) = warmed {
            debug!(error = %e, "Connection warm-up failed, will connect on demand");
        }
        prerequisites.map_err(PrepareFailure::before_target)?;
        self.set_state(OperatorState::PrerequisitesChecked);

        let target = self
            .acquire_target()
            .await
            .map_err(PrepareFailure::before_target)?;
        self.set_state(OperatorState::JoinTargetAcquired);
        info!(target = %target, "Join target acquired");

        match self.notify_peer(&target).await {
            Ok((link, events)) => {
                self.set_state(OperatorState::PeerNotified);
                Ok((target, link, events))
            }
            Err(error) => Err(PrepareFailure {
                error,
                target: Some(target),
            }),
        }
    }

    async fn check_prerequisites(&self) -> Result<()> {
        if self.options.skip_avatar_check {
            debug!("Skipping avatar check");
        } else {
            self.ensure_avatar().await?;
        }

        if self.options.skip_overlay_check {
            debug!("Skipping overlay network check");
        } else {
            self.collaborators
                .directory
                .health()
                .await
                .map_err(|e| OperatorError::Prerequisite(e.to_string()))?;
        }
        Ok(())
    }

    async fn ensure_avatar(&self) -> Result<()> {
        let avatar = &self.collaborators.avatar;
        if avatar.is_running().await {
            debug!("Avatar application already running");
            return Ok(());
        }

        info!("Launching avatar application");
        if !avatar.launch().await {
            return Err(OperatorError::Prerequisite(
                "avatar application failed to launch".to_string(),
            ));
        }

        let grace = self.config.avatar_startup_grace;
        let deadline = Instant::now() + grace;
        let period = AVATAR_POLL_PERIOD.min(grace);
        loop {
            if avatar.is_running().await {
                info!("Avatar application is up");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OperatorError::Prerequisite(format!(
                    "avatar application not running {}ms after launch",
                    grace.as_millis()
                )));
            }
            sleep(period).await;
        }
    }

    async fn acquire_target(&self) -> Result<JoinTarget> {
        let target = self
            .collaborators
            .video
            .create_session()
            .await
            .map_err(OperatorError::JoinTarget)?;
        if target.is_empty() {
            return Err(OperatorError::JoinTarget(CollaboratorError::Malformed {
                collaborator: "video",
                reason: "empty join target".to_string(),
            }));
        }
        Ok(target)
    }

    /// Delivers the join target and keeps its connection as the session
    /// channel.
    async fn notify_peer(
        &self,
        target: &JoinTarget,
    ) -> Result<(PeerLink, mpsc::Receiver<LinkEvent>)> {
        let attempts = self.config.notify_attempts.max(1);
        let mut delay = self.config.retry_backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let mut client = self.client();
            let message = ControlMessage::join_target(target.clone())?;

            match client.send(message, true).await {
                Ok(Some(ack)) if ack.is_ok() => {
                    info!(peer = %self.peer, attempt, ack = %ack, "Reception node acknowledged join target");
                    if let Some(conn) = client.take_connection() {
                        let timing = LinkTiming {
                            heartbeat_interval: self.config.heartbeat_interval,
                            response_timeout: self.config.response_timeout,
                        };
                        return Ok(PeerLink::start(conn, timing));
                    }
                    last_error = "connection lost after acknowledgment".to_string();
                }
                Ok(Some(ack)) => return Err(OperatorError::Rejected(ack.detail)),
                Ok(None) => last_error = "no acknowledgment".to_string(),
                Err(e) if e.is_retryable() => {
                    warn!(peer = %self.peer, attempt, error = %e, "Join target delivery failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(OperatorError::PeerUnreachable {
            attempts,
            last_error,
        })
    }

    async fn host_join(&self, target: &JoinTarget) -> Result<()> {
        match self.collaborators.video.join(target, Role::Host).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(OperatorError::HostJoin(
                "video collaborator refused the join".to_string(),
            )),
            Err(e) => Err(OperatorError::HostJoin(e.to_string())),
        }
    }

    fn start_monitor(&self) {
        let video = Arc::clone(&self.collaborators.video);
        let identity = video.process_identity();
        let events = self.events_tx.clone();

        self.monitor.start(
            identity,
            video,
            Box::new(move || {
                if let Err(TrySendError::Full(event)) = events.try_send(SessionEvent::LocalExit) {
                    tokio::spawn(async move {
                        let _ = events.send(event).await;
                    });
                }
            }),
        );
    }

    // ========================================================================
    // Active session and teardown
    // ========================================================================

    /// Ending through Cleaned. Never fails.
    async fn teardown(&self, cause: TeardownCause, link: PeerLink) {
        self.set_state(OperatorState::Ending);
        self.monitor.stop();

        let mut errors = Vec::new();
        if cause.is_local() {
            match link
                .request(ControlMessage::end(), self.config.response_timeout)
                .await
            {
                Ok(ack) if ack.is_ok() => debug!(ack = %ack, "Reception node acknowledged end"),
                Ok(ack) => warn!(ack = %ack, "Reception node rejected end"),
                Err(e) => {
                    warn!(error = %e, "Failed to relay end to reception node");
                    errors.push(Notification::error("Could not relay end to the reception node", &e));
                }
            }
        }
        link.close().await;

        if let Err(e) = self.collaborators.video.leave().await {
            warn!(error = %e, "Failed to leave video session during cleanup");
            errors.push(Notification::error("Operator could not leave the video session", &e));
        }

        self.release(OperatorState::Cleaned);
        info!(cause = %cause, "Session cleaned up");

        let summary = match &cause {
            TeardownCause::JoinFailed(reason) => {
                Notification::error("Operator could not join the video session", reason)
            }
            _ => Notification::usage("Operator session ended").with_detail("cause", &cause),
        };
        for notification in std::iter::once(summary).chain(errors) {
            self.notify(notification.with_detail("peer", &self.peer)).await;
        }
    }

    async fn notify(&self, notification: Notification) {
        self.collaborators.notifier.notify(notification).await;
    }

    /// Stops the monitor and closes every pooled connection.
    fn release(&self, final_state: OperatorState) {
        self.monitor.stop();
        let closed = self.pool.clear();
        if closed > 0 {
            debug!(closed, "Closed pooled connections");
        }
        self.set_state(final_state);
    }

    fn client(&self) -> TransportClient {
        TransportClient::new(
            self.peer.clone(),
            self.resolver.clone(),
            self.pool.clone(),
            &self.config,
        )
    }

    fn set_state(&self, next: OperatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Operator state changed");
        }
    }
}

/// A failed establishment, with the join target if one was acquired.
struct PrepareFailure {
    error: OperatorError,
    target: Option<JoinTarget>,
}

impl PrepareFailure {
    fn before_target(error: OperatorError) -> Self {
        Self {
            error,
            target: None,
        }
    }
}

async fn wait_for_end(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut link_events: mpsc::Receiver<LinkEvent>,
) -> TeardownCause {
    let event = tokio::select! {
        // The controller holds a sender, so `None` cannot occur here.
        event = events.recv() => event.unwrap_or(SessionEvent::ShutdownRequested),
        event = link_events.recv() => match event {
            Some(event) => event.into(),
            None => SessionEvent::PeerLost("session channel closed".to_string()),
        },
    };
    let cause = event.into_cause();
    info!(cause = %cause, "Session ending");
    cause
}

/// Resolves on `ShutdownRequested`. Other events cannot occur before the
/// session is active and are discarded.
async fn wait_for_shutdown(events: &mut mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if event == SessionEvent::ShutdownRequested {
            return;
        }
        debug!(event = ?event, "Ignoring event before session is active");
    }
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_causes() {
        assert_eq!(SessionEvent::LocalExit.into_cause(), TeardownCause::LocalExit);
        assert!(SessionEvent::ShutdownRequested.into_cause().is_local());
        assert!(!SessionEvent::PeerEnded.into_cause().is_local());
        assert!(SessionEvent::PeerLost("eof".into()).into_cause().is_local());
    }

    #[test]
    fn test_link_event_conversion() {
        assert_eq!(SessionEvent::from(LinkEvent::PeerEnded), SessionEvent::PeerEnded);
        assert_eq!(
            SessionEvent::from(LinkEvent::PeerLost("eof".into())),
            SessionEvent::PeerLost("eof".into())
        );
    }
}
