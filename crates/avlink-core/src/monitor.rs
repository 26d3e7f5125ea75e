//! Process liveness monitoring.
//!
//! A `ProcessMonitor` polls an external collaborator process and invokes an
//! exit callback once it has terminated. Termination requires two
//! independent signals to agree:
//! - the `LivenessProbe` no longer finds the process, and
//! - the video collaborator no longer reports itself as in session.
//!
//! The callback is expected to enqueue a transition request for the owning
//! session, never to mutate session state itself.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered with `PoisonError::into_inner`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, System};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborator::{LivenessProbe, VideoCollaborator};
use crate::model::ProcessIdentity;

/// Callback invoked when the watched process has exited.
pub type ExitCallback = Box<dyn FnOnce() + Send + 'static>;

/// One start/stop cycle. Whoever takes it out of the slot owns its ending.
struct Cycle {
    id: u64,
    token: CancellationToken,
}

/// Polls one collaborator process per start/stop cycle.
///
/// Dropping the monitor stops it.
pub struct ProcessMonitor {
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    current: Arc<Mutex<Option<Cycle>>>,
    next_cycle: AtomicU64,
}

impl ProcessMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            current: Arc::new(Mutex::new(None)),
            next_cycle: AtomicU64::new(0),
        }
    }

    /// Starts polling `identity`. A cycle already in progress is stopped
    /// first, so `on_exit` of the previous cycle can no longer fire.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        identity: ProcessIdentity,
        video: Arc<dyn VideoCollaborator>,
        on_exit: ExitCallback,
    ) {
        let token = CancellationToken::new();
        let id = self.next_cycle.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let cycle = Cycle {
                id,
                token: token.clone(),
            };
            if let Some(previous) = slot.replace(cycle) {
                previous.token.cancel();
            }
        }

        let probe = Arc::clone(&self.probe);
        let period = self.interval;
        let current = Arc::clone(&self.current);

        info!(%identity, interval_ms = period.as_millis() as u64, "Process monitor started");

        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!(%identity, "Process monitor stopped");
                        return;
                    }

                    _ = tick.tick() => {
                        if probe.is_alive(&identity).await {
                            continue;
                        }
                        if video.is_active().await {
                            debug!(%identity, "Process not found but collaborator still reports active");
                            continue;
                        }
                        break;
                    }
                }
            }

            // Claimed under the slot lock: a stop() or restart that got
            // there first leaves nothing to claim.
            let claimed = {
                let mut slot = current.lock().unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    Some(cycle) if cycle.id == id => slot.take(),
                    _ => None,
                }
            };
            let Some(cycle) = claimed else {
                debug!(%identity, "Process monitor stopped before exit was reported");
                return;
            };
            cycle.token.cancel();
            info!(%identity, "Watched process exited");
            on_exit();
        });
    }

    /// Stops the current cycle. Safe to call at any time, including after
    /// the monitor fired or when it was never started. Once this returns,
    /// the stopped cycle's `on_exit` can no longer start.
    pub fn stop(&self) {
        let mut slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cycle) = slot.take() {
            cycle.token.cancel();
        }
    }

    /// Returns true while a cycle is polling.
    pub fn is_running(&self) -> bool {
        let slot = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|cycle| !cycle.token.is_cancelled())
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `LivenessProbe` backed by the `sysinfo` process table.
pub struct SysinfoProbe {
    system: Arc<Mutex<System>>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for SysinfoProbe {
    async fn is_alive(&self, identity: &ProcessIdentity) -> bool {
        let system = Arc::clone(&self.system);
        let identity = identity.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_all();
            process_exists(&system, &identity)
        })
        .await;

        match result {
            Ok(alive) => alive,
            Err(e) => {
                // Report alive so a failed probe never triggers teardown.
                warn!(error = %e, "Process table refresh failed");
                true
            }
        }
    }
}

fn process_exists(system: &System, identity: &ProcessIdentity) -> bool {
    match identity {
        ProcessIdentity::Pid(pid) => system.process(Pid::from_u32(*pid)).is_some(),
        ProcessIdentity::Name(name) => {
            let needle = name.to_lowercase();
            system
                .processes()
                .values()
                .any(|p| p.name().to_string_lossy().to_lowercase().contains(&needle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorResult;
    use crate::model::{JoinTarget, Role};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::OnceLock;

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl LivenessProbe for FlagProbe {
        async fn is_alive(&self, _identity: &ProcessIdentity) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FlagVideo(Arc<AtomicBool>);

    #[async_trait]
    impl VideoCollaborator for FlagVideo {
        async fn create_session(&self) -> CollaboratorResult<JoinTarget> {
            Ok(JoinTarget::new("https://meet.example/abc"))
        }
        async fn join(&self, _target: &JoinTarget, _role: Role) -> CollaboratorResult<bool> {
            Ok(true)
        }
        async fn is_active(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        fn process_identity(&self) -> ProcessIdentity {
            ProcessIdentity::Name("fake".to_string())
        }
        async fn leave(&self) -> CollaboratorResult<()> {
            Ok(())
        }
    }

    struct Harness {
        alive: Arc<AtomicBool>,
        active: Arc<AtomicBool>,
        fired: Arc<AtomicUsize>,
        monitor: ProcessMonitor,
    }

    impl Harness {
        fn new() -> Self {
            let alive = Arc::new(AtomicBool::new(true));
            let active = Arc::new(AtomicBool::new(true));
            let monitor = ProcessMonitor::new(
                Arc::new(FlagProbe(Arc::clone(&alive))),
                Duration::from_secs(2),
            );
            Self {
                alive,
                active,
                fired: Arc::new(AtomicUsize::new(0)),
                monitor,
            }
        }

        fn start(&self) {
            let fired = Arc::clone(&self.fired);
            self.monitor.start(
                ProcessIdentity::Pid(42),
                Arc::new(FlagVideo(Arc::clone(&self.active))),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        fn fired(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    async fn polls(n: u32) {
        for _ in 0..n {
            tokio::time::advance(Duration::from_secs(2)).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_when_both_signals_agree() {
        let h = Harness::new();
        h.start();
        polls(2).await;
        assert_eq!(h.fired(), 0);

        h.alive.store(false, Ordering::SeqCst);
        h.active.store(false, Ordering::SeqCst);
        polls(3).await;

        assert_eq!(h.fired(), 1);
        assert!(!h.monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_gone_but_still_active_does_not_fire() {
        let h = Harness::new();
        h.start();
        h.alive.store(false, Ordering::SeqCst);
        polls(3).await;
        assert_eq!(h.fired(), 0);
        assert!(h.monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_but_process_alive_does_not_fire() {
        let h = Harness::new();
        h.start();
        h.active.store(false, Ordering::SeqCst);
        polls(3).await;
        assert_eq!(h.fired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_callback() {
        let h = Harness::new();
        h.start();
        h.monitor.stop();
        h.alive.store(false, Ordering::SeqCst);
        h.active.store(false, Ordering::SeqCst);
        polls(3).await;
        assert_eq!(h.fired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_always_safe() {
        let h = Harness::new();
        h.monitor.stop();
        h.start();
        h.alive.store(false, Ordering::SeqCst);
        h.active.store(false, Ordering::SeqCst);
        polls(2).await;
        assert_eq!(h.fired(), 1);
        h.monitor.stop();
        h.monitor.stop();
        assert_eq!(h.fired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_begins_new_cycle() {
        let h = Harness::new();
        h.start();
        h.alive.store(false, Ordering::SeqCst);
        h.active.store(false, Ordering::SeqCst);
        polls(2).await;
        assert_eq!(h.fired(), 1);

        h.start();
        polls(2).await;
        assert_eq!(h.fired(), 2);
    }

    /// Reports inactive, but stops the monitor first, as a concurrent
    /// teardown would while the final poll is in flight.
    struct StoppingVideo(Arc<OnceLock<Arc<ProcessMonitor>>>);

    #[async_trait]
    impl VideoCollaborator for StoppingVideo {
        async fn create_session(&self) -> CollaboratorResult<JoinTarget> {
            Ok(JoinTarget::new("https://meet.example/abc"))
        }
        async fn join(&self, _target: &JoinTarget, _role: Role) -> CollaboratorResult<bool> {
            Ok(true)
        }
        async fn is_active(&self) -> bool {
            if let Some(monitor) = self.0.get() {
                monitor.stop();
            }
            false
        }
        fn process_identity(&self) -> ProcessIdentity {
            ProcessIdentity::Name("fake".to_string())
        }
        async fn leave(&self) -> CollaboratorResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_final_poll_suppresses_callback() {
        let monitor = Arc::new(ProcessMonitor::new(
            Arc::new(FlagProbe(Arc::new(AtomicBool::new(false)))),
            Duration::from_secs(2),
        ));
        let slot = Arc::new(OnceLock::new());
        let _ = slot.set(Arc::clone(&monitor));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        monitor.start(
            ProcessIdentity::Pid(42),
            Arc::new(StoppingVideo(slot)),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        polls(3).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_sysinfo_probe_finds_current_process() {
        let probe = SysinfoProbe::new();
        assert!(probe.is_alive(&ProcessIdentity::Pid(std::process::id())).await);
        assert!(!probe.is_alive(&ProcessIdentity::Pid(999_999_999)).await);
    }
}
