//! Collaborators backed by configured shell commands.
//!
//! Each operation runs `sh -c <command>` with `{target}` and `{name}`
//! substituted (single-quoted for the shell). Unconfigured operations are
//! reported as unavailable rather than silently succeeding.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{AvatarCollaborator, LivenessProbe, Notifier, VideoCollaborator};
use crate::config::{AvatarCommands, NotifyCommands, VideoCommands};
use crate::error::{CollaboratorError, CollaboratorResult};
use crate::model::{JoinTarget, Notification, NotificationKind, ProcessIdentity, Role};

/// Process watched when `[video] process_name` is not set.
pub const DEFAULT_VIDEO_PROCESS: &str = "chrome";

/// Process checked when `[avatar] process_name` is not set.
pub const DEFAULT_AVATAR_PROCESS: &str = "VTube Studio";

const VIDEO: &str = "video";
const AVATAR: &str = "avatar";
const NOTIFY: &str = "notify";

/// Video collaborator driven by external commands.
pub struct CommandVideo {
    commands: VideoCommands,
    display_name: String,
}

impl CommandVideo {
    pub fn new(commands: VideoCommands, display_name: impl Into<String>) -> Self {
        Self {
            commands,
            display_name: display_name.into(),
        }
    }

    fn render(&self, template: &str, target: Option<&JoinTarget>) -> String {
        let mut rendered = template.replace("{name}", &shell_quote(&self.display_name));
        if let Some(target) = target {
            rendered = rendered.replace("{target}", &shell_quote(target.as_str()));
        }
        rendered
    }
}

#[async_trait]
impl VideoCollaborator for CommandVideo {
    async fn create_session(&self) -> CollaboratorResult<JoinTarget> {
        let template = configured(&self.commands.create_command, VIDEO, "create_command")?;
        let stdout = run_capture(VIDEO, "create a session", &self.render(template, None)).await?;

        let target = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(JoinTarget::new)
            .ok_or_else(|| CollaboratorError::Malformed {
                collaborator: VIDEO,
                reason: "create_command printed no join target".to_string(),
            })?;

        info!(target = %target, "Video session created");
        Ok(target)
    }

    async fn join(&self, target: &JoinTarget, role: Role) -> CollaboratorResult<bool> {
        let (template, key) = match role {
            Role::Host => (&self.commands.host_join_command, "host_join_command"),
            Role::Guest => (&self.commands.join_command, "join_command"),
        };
        let template = configured(template, VIDEO, key)?;
        let status = run_status(VIDEO, "join", &self.render(template, Some(target))).await?;
        debug!(target = %target, ?role, success = status, "Join command finished");
        Ok(status)
    }

    async fn is_active(&self) -> bool {
        // Without a status command the process table is the only signal.
        let Some(template) = &self.commands.status_command else {
            return false;
        };
        run_status(VIDEO, "report status", &self.render(template, None))
            .await
            .unwrap_or(false)
    }

    fn process_identity(&self) -> ProcessIdentity {
        ProcessIdentity::Name(
            self.commands
                .process_name
                .clone()
                .unwrap_or_else(|| DEFAULT_VIDEO_PROCESS.to_string()),
        )
    }

    async fn leave(&self) -> CollaboratorResult<()> {
        let Some(template) = &self.commands.leave_command else {
            return Ok(());
        };
        if run_status(VIDEO, "leave", &self.render(template, None)).await? {
            Ok(())
        } else {
            Err(CollaboratorError::OperationFailed {
                collaborator: VIDEO,
                operation: "leave",
                reason: "leave_command exited with failure".to_string(),
            })
        }
    }
}

/// Avatar collaborator detected by process name and started by command.
pub struct CommandAvatar {
    commands: AvatarCommands,
    probe: Arc<dyn LivenessProbe>,
}

impl CommandAvatar {
    pub fn new(commands: AvatarCommands, probe: Arc<dyn LivenessProbe>) -> Self {
        Self { commands, probe }
    }

    fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::Name(
            self.commands
                .process_name
                .clone()
                .unwrap_or_else(|| DEFAULT_AVATAR_PROCESS.to_string()),
        )
    }
}

#[async_trait]
impl AvatarCollaborator for CommandAvatar {
    async fn is_running(&self) -> bool {
        self.probe.is_alive(&self.identity()).await
    }

    async fn launch(&self) -> bool {
        if self.is_running().await {
            return true;
        }
        let Some(command) = &self.commands.launch_command else {
            warn!("Avatar application is not running and no launch_command is configured");
            return false;
        };

        // The application keeps running after launch; do not wait for it.
        match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_) => {
                info!(command = %command, "Avatar application launched");
                true
            }
            Err(e) => {
                warn!(collaborator = AVATAR, error = %e, "Failed to launch avatar application");
                false
            }
        }
    }
}

/// Notifier that hands each notification to `[notify] command`.
///
/// `{node}` names the sending node (`operator` or `reception`) and `{host}`
/// the machine it runs on. Without a command the notification is only
/// logged.
pub struct CommandNotifier {
    command: Option<String>,
    timeout: Duration,
    node: String,
    host: String,
}

impl CommandNotifier {
    pub fn new(commands: NotifyCommands, node: impl Into<String>) -> Self {
        Self {
            command: commands.command,
            timeout: commands.timeout,
            node: node.into(),
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        }
    }

    fn render(&self, template: &str, notification: &Notification) -> String {
        template
            .replace("{kind}", &shell_quote(notification.kind.as_str()))
            .replace("{title}", &shell_quote(&notification.title))
            .replace("{text}", &shell_quote(&notification.to_string()))
            .replace("{node}", &shell_quote(&self.node))
            .replace("{host}", &shell_quote(&self.host))
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Usage => info!(notification = %notification, "Notification"),
            NotificationKind::Error => warn!(notification = %notification, "Notification"),
        }
        let Some(template) = &self.command else {
            return;
        };

        let command = self.render(template, &notification);
        match tokio::time::timeout(self.timeout, run_status(NOTIFY, "deliver", &command)).await {
            Ok(Ok(true)) => debug!(title = %notification.title, "Notification delivered"),
            Ok(Ok(false)) => warn!(title = %notification.title, "Notification command failed"),
            Ok(Err(e)) => warn!(error = %e, "Notification command could not run"),
            Err(_) => warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "Notification command timed out"
            ),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn configured<'a>(
    template: &'a Option<String>,
    collaborator: &'static str,
    key: &str,
) -> CollaboratorResult<&'a str> {
    template.as_deref().ok_or_else(|| CollaboratorError::Unavailable {
        collaborator,
        reason: format!("{key} is not configured"),
    })
}

async fn run_capture(
    collaborator: &'static str,
    operation: &'static str,
    command: &str,
) -> CollaboratorResult<String> {
    debug!(collaborator, command, "Running collaborator command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CollaboratorError::Unavailable {
            collaborator,
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(CollaboratorError::OperationFailed {
            collaborator,
            operation,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_status(
    collaborator: &'static str,
    operation: &'static str,
    command: &str,
) -> CollaboratorResult<bool> {
    debug!(collaborator, operation, command, "Running collaborator command");
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .map_err(|e| CollaboratorError::Unavailable {
            collaborator,
            reason: e.to_string(),
        })
}

/// Wraps `value` in single quotes for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverAlive;

    #[async_trait]
    impl LivenessProbe for NeverAlive {
        async fn is_alive(&self, _identity: &ProcessIdentity) -> bool {
            false
        }
    }

    fn video(commands: VideoCommands) -> CommandVideo {
        CommandVideo::new(commands, "Front Desk")
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let v = video(VideoCommands::default());
        let target = JoinTarget::new("https://meet.example/abc?x=1&y=2");
        let rendered = v.render("join --url {target} --as {name}", Some(&target));
        assert_eq!(
            rendered,
            "join --url 'https://meet.example/abc?x=1&y=2' --as 'Front Desk'"
        );
    }

    #[tokio::test]
    async fn test_create_session_reads_first_line() {
        let v = video(VideoCommands {
            create_command: Some("printf '\\nhttps://meet.example/abc\\n'".to_string()),
            ..Default::default()
        });
        let target = v.create_session().await.unwrap();
        assert_eq!(target.as_str(), "https://meet.example/abc");
    }

    #[tokio::test]
    async fn test_create_session_empty_output_is_malformed() {
        let v = video(VideoCommands {
            create_command: Some("true".to_string()),
            ..Default::default()
        });
        let err = v.create_session().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_join_is_unavailable() {
        let v = video(VideoCommands::default());
        let err = v
            .join(&JoinTarget::new("x"), Role::Guest)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_join_reports_command_status() {
        let v = video(VideoCommands {
            join_command: Some("true".to_string()),
            host_join_command: Some("false".to_string()),
            ..Default::default()
        });
        let target = JoinTarget::new("x");
        assert!(v.join(&target, Role::Guest).await.unwrap());
        assert!(!v.join(&target, Role::Host).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_active_without_status_command() {
        let v = video(VideoCommands::default());
        assert!(!v.is_active().await);
        assert_eq!(
            v.process_identity(),
            ProcessIdentity::Name(DEFAULT_VIDEO_PROCESS.to_string())
        );
    }

    #[test]
    fn test_notifier_render_quotes_every_placeholder() {
        let notifier = CommandNotifier::new(NotifyCommands::default(), "reception");
        let notification =
            Notification::error("Leave failed", "it's gone").with_detail("target", "x");
        let rendered = notifier.render("post {kind} {title} {text} {node}", &notification);
        assert_eq!(
            rendered,
            r"post 'error' 'Leave failed' '[error] Leave failed (error: it'\''s gone, target: x)' 'reception'"
        );
    }

    #[tokio::test]
    async fn test_notifier_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("sent");
        let notifier = CommandNotifier::new(
            NotifyCommands {
                command: Some(format!("printf '%s' {{title}} > '{}'", out.display())),
                ..NotifyCommands::default()
            },
            "operator",
        );

        notifier.notify(Notification::usage("Session started")).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "Session started");
    }

    #[tokio::test]
    async fn test_notifier_failure_is_swallowed() {
        let notifier = CommandNotifier::new(
            NotifyCommands {
                command: Some("sleep 5".to_string()),
                timeout: Duration::from_millis(50),
            },
            "operator",
        );
        // Returns once the timeout elapses instead of waiting for the command.
        let started = std::time::Instant::now();
        notifier.notify(Notification::error("Join failed", "refused")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_avatar_launch_without_command_fails() {
        let avatar = CommandAvatar::new(AvatarCommands::default(), Arc::new(NeverAlive));
        assert!(!avatar.is_running().await);
        assert!(!avatar.launch().await);
    }
}
