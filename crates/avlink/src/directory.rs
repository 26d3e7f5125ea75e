//! Overlay-network peer directory backed by the Tailscale CLI.
//!
//! `tailscale status --json` lists every device in the tailnet. A logical
//! peer name is matched against device host names: an exact match wins,
//! otherwise the first host name containing the name (case-insensitive).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use avlink_core::collaborator::PeerDirectory;
use avlink_core::error::{CollaboratorError, CollaboratorResult};

const COLLABORATOR: &str = "tailscale";

/// CLI bundled with the macOS app, preferred when present.
const MACOS_APP_CLI: &str = "/Applications/Tailscale.app/Contents/MacOS/Tailscale";

/// Backend state reported by a logged-in, connected node.
const RUNNING_STATE: &str = "Running";

// ============================================================================
// Status JSON
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailnetStatus {
    #[serde(default)]
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<DeviceStatus>,
    #[serde(default)]
    peer: HashMap<String, DeviceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceStatus {
    #[serde(default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
}

impl DeviceStatus {
    fn first_address(&self) -> Option<IpAddr> {
        self.tailscale_ips.iter().find_map(|ip| ip.parse().ok())
    }
}

impl TailnetStatus {
    fn parse(json: &[u8]) -> CollaboratorResult<Self> {
        serde_json::from_slice(json).map_err(|e| CollaboratorError::Malformed {
            collaborator: COLLABORATOR,
            reason: e.to_string(),
        })
    }

    /// Host name to first address, peers first and this node last.
    fn devices(&self) -> Vec<(&str, IpAddr)> {
        let mut peers: Vec<&DeviceStatus> = self.peer.values().collect();
        // HashMap order is arbitrary; keep substring matches deterministic.
        peers.sort_by(|a, b| a.host_name.cmp(&b.host_name));

        peers
            .into_iter()
            .chain(self.self_node.iter())
            .filter(|d| !d.host_name.is_empty())
            .filter_map(|d| d.first_address().map(|ip| (d.host_name.as_str(), ip)))
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<IpAddr> {
        let devices = self.devices();

        if let Some((_, ip)) = devices.iter().find(|(host, _)| *host == name) {
            return Some(*ip);
        }

        let needle = name.to_lowercase();
        devices
            .iter()
            .find(|(host, _)| host.to_lowercase().contains(&needle))
            .map(|(host, ip)| {
                info!(name, host, %ip, "Resolved peer by partial host name");
                *ip
            })
    }
}

// ============================================================================
// Directory
// ============================================================================

/// `PeerDirectory` that shells out to the Tailscale CLI on every query.
///
/// Caching is the `AddressResolver`'s job.
#[derive(Debug, Clone)]
pub struct TailscaleDirectory {
    program: String,
}

impl TailscaleDirectory {
    /// Uses the macOS app's bundled CLI when installed, else `tailscale`
    /// from `PATH`.
    pub fn new() -> Self {
        let program = if Path::new(MACOS_APP_CLI).exists() {
            MACOS_APP_CLI.to_string()
        } else {
            "tailscale".to_string()
        };
        Self { program }
    }

    /// Uses a specific CLI binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn status(&self) -> CollaboratorResult<TailnetStatus> {
        let output = Command::new(&self.program)
            .args(["status", "--json"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollaboratorError::Unavailable {
                collaborator: COLLABORATOR,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CollaboratorError::OperationFailed {
                collaborator: COLLABORATOR,
                operation: "report status",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        TailnetStatus::parse(&output.stdout)
    }
}

impl Default for TailscaleDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDirectory for TailscaleDirectory {
    async fn resolve(&self, name: &str) -> CollaboratorResult<Option<IpAddr>> {
        let status = self.status().await?;
        let found = status.lookup(name);
        debug!(name, found = ?found, "Tailnet lookup");
        Ok(found)
    }

    async fn health(&self) -> CollaboratorResult<()> {
        let status = self.status().await?;
        if status.backend_state != RUNNING_STATE {
            return Err(CollaboratorError::OperationFailed {
                collaborator: COLLABORATOR,
                operation: "connect",
                reason: format!("backend state is '{}'", status.backend_state),
            });
        }
        match &status.self_node {
            Some(node) => {
                info!(host = %node.host_name, "Tailscale is running");
                Ok(())
            }
            None => Err(CollaboratorError::Malformed {
                collaborator: COLLABORATOR,
                reason: "status has no Self entry".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = r#"{
        "BackendState": "Running",
        "Self": {"HostName": "operator-mac", "TailscaleIPs": ["100.64.0.1", "fd7a::1"]},
        "Peer": {
            "nodekey:a": {"HostName": "reception-front", "TailscaleIPs": ["100.64.0.7"]},
            "nodekey:b": {"HostName": "Reception", "TailscaleIPs": ["100.64.0.9"]},
            "nodekey:c": {"HostName": "printer", "TailscaleIPs": []}
        }
    }"#;

    fn status() -> TailnetStatus {
        TailnetStatus::parse(STATUS.as_bytes()).unwrap()
    }

    #[test]
    fn test_exact_match_preferred() {
        assert_eq!(status().lookup("Reception"), Some("100.64.0.9".parse().unwrap()));
    }

    #[test]
    fn test_substring_match_is_case_insensitive() {
        assert_eq!(status().lookup("FRONT"), Some("100.64.0.7".parse().unwrap()));
    }

    #[test]
    fn test_self_node_is_resolvable() {
        assert_eq!(status().lookup("operator-mac"), Some("100.64.0.1".parse().unwrap()));
    }

    #[test]
    fn test_device_without_address_is_skipped() {
        assert_eq!(status().lookup("printer"), None);
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(status().lookup("kiosk"), None);
    }

    #[test]
    fn test_malformed_status() {
        let err = TailnetStatus::parse(b"not json").unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed { .. }));
    }

    #[test]
    fn test_missing_sections_default() {
        let status = TailnetStatus::parse(br#"{"BackendState":"NeedsLogin"}"#).unwrap();
        assert!(status.devices().is_empty());
        assert_eq!(status.backend_state, "NeedsLogin");
    }

    #[tokio::test]
    async fn test_missing_cli_is_unavailable() {
        let directory = TailscaleDirectory::with_program("/nonexistent/tailscale");
        let err = directory.resolve("reception").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable { .. }));
    }
}
