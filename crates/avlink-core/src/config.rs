//! Configuration for both avlink nodes.
//!
//! `LinkConfig` is an explicit value object handed to each component at
//! construction. There is no global configuration state.
//!
//! The file format is TOML with durations in milliseconds:
//!
//! ```toml
//! port = 9999
//! probe_timeout_ms = 300
//! resolver_ttl_ms = 300000
//!
//! [video]
//! process_name = "chrome"
//! join_command = "open-meeting --url {target}"
//!
//! [notify]
//! command = "curl -fsS --data-urlencode text={text} https://hooks.example/avlink"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default control port shared by both nodes.
pub const DEFAULT_PORT: u16 = 9999;

/// Default maximum body size of a single frame (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Timeouts, retry bounds and pool limits for the control channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Fixed control port.
    pub port: u16,

    /// Bound on a single TCP connect.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Bound on the handshake liveness probe of a fresh connection.
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Bound on waiting for the one response frame of a request.
    #[serde(rename = "response_timeout_ms", with = "duration_ms")]
    pub response_timeout: Duration,

    /// Initial backoff before a retry; doubles per attempt.
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,

    /// Extra connection attempts after a failed probe.
    pub connect_retries: u32,

    /// Attempts to deliver the join target before giving up.
    pub notify_attempts: u32,

    /// Lifetime of a resolved address in the cache.
    #[serde(rename = "resolver_ttl_ms", with = "duration_ms")]
    pub resolver_ttl: Duration,

    /// Bound on a single peer-directory query.
    #[serde(rename = "resolve_timeout_ms", with = "duration_ms")]
    pub resolve_timeout: Duration,

    /// Idle connections kept per peer address.
    pub pool_max_idle: usize,

    /// Idle connections older than this are closed instead of reused.
    #[serde(rename = "pool_idle_timeout_ms", with = "duration_ms")]
    pub pool_idle_timeout: Duration,

    /// The server closes connections that stay silent this long.
    #[serde(rename = "connection_idle_timeout_ms", with = "duration_ms")]
    pub connection_idle_timeout: Duration,

    /// ProcessMonitor polling period.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Operator heartbeat period while a session is active.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// How long the reception node tolerates a lost session channel.
    #[serde(rename = "peer_disconnect_grace_ms", with = "duration_ms")]
    pub peer_disconnect_grace: Duration,

    /// How long to wait for the avatar collaborator after launching it.
    #[serde(rename = "avatar_startup_grace_ms", with = "duration_ms")]
    pub avatar_startup_grace: Duration,

    /// Frames announcing a larger body are rejected.
    pub max_frame_size: usize,

    /// External-command video collaborator.
    pub video: VideoCommands,

    /// External-command avatar collaborator.
    pub avatar: AvatarCommands,

    /// Usage and error notifications.
    pub notify: NotifyCommands,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_millis(1500),
            probe_timeout: Duration::from_millis(300),
            response_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
            connect_retries: 1,
            notify_attempts: 3,
            resolver_ttl: Duration::from_secs(300),
            resolve_timeout: Duration::from_secs(15),
            pool_max_idle: 4,
            pool_idle_timeout: Duration::from_secs(25),
            connection_idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(20),
            peer_disconnect_grace: Duration::from_secs(30),
            avatar_startup_grace: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            video: VideoCommands::default(),
            avatar: AvatarCommands::default(),
            notify: NotifyCommands::default(),
        }
    }
}

impl LinkConfig {
    /// Loads configuration from `path`, or from the default location when
    /// `path` is `None`. A missing default file yields the defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(&contents).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }
}

/// Returns `$XDG_CONFIG_HOME/avlink/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("avlink").join("config.toml"))
}

/// Shell commands backing the external video collaborator.
///
/// `{target}` and `{name}` placeholders are substituted before running.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoCommands {
    /// Prints a fresh join target on stdout.
    pub create_command: Option<String>,
    /// Joins the session at `{target}` as host.
    pub host_join_command: Option<String>,
    /// Joins the session at `{target}` as guest named `{name}`.
    pub join_command: Option<String>,
    /// Leaves the current session.
    pub leave_command: Option<String>,
    /// Exit status 0 while the collaborator reports itself in session.
    pub status_command: Option<String>,
    /// Executable name of the collaborator process.
    pub process_name: Option<String>,
}

/// Shell commands backing the external avatar collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AvatarCommands {
    /// Executable name of the avatar application.
    pub process_name: Option<String>,
    /// Starts the avatar application.
    pub launch_command: Option<String>,
}

/// Shell command that delivers a notification, typically a webhook POST.
///
/// `{kind}`, `{title}`, `{text}`, `{node}` and `{host}` are substituted
/// before running. Without a command, notifications are only logged.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyCommands {
    pub command: Option<String>,
    /// Bound on one run of `command`.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for NotifyCommands {
    fn default() -> Self {
        Self {
            command: None,
            timeout: Duration::from_secs(10),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.port, 9999);
        assert_eq!(config.probe_timeout, Duration::from_millis(300));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.resolver_ttl, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LinkConfig::from_toml(
            r#"
            port = 7000
            probe_timeout_ms = 150

            [video]
            process_name = "chrome"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.probe_timeout, Duration::from_millis(150));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.video.process_name.as_deref(), Some("chrome"));
        assert!(config.avatar.launch_command.is_none());
        assert!(config.notify.command.is_none());
        assert_eq!(config.notify.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_notify_section() {
        let config = LinkConfig::from_toml(
            r#"
            [notify]
            command = "notify-send {title}"
            timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.notify.command.as_deref(), Some("notify-send {title}"));
        assert_eq!(config.notify.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(LinkConfig::from_toml("port = \"not a number\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool_max_idle = 9").unwrap();

        let config = LinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool_max_idle, 9);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = LinkConfig::load(Some(Path::new("/nonexistent/avlink.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
