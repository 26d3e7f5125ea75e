//! avlink - operator node
//!
//! Runs one avatar session against a reception node: makes sure the avatar
//! application is up, creates a video session, hands its join target to the
//! reception node and keeps both sides in lockstep until either ends.
//!
//! # Usage
//!
//! ```bash
//! # Connect to the reception node by its tailnet host name
//! avlink connect reception-front
//!
//! # Connect by address, skipping the avatar check
//! avlink connect 100.64.0.7 --skip-avatar-check
//!
//! # Enable debug logging
//! RUST_LOG=avlink=debug avlink connect reception-front
//! ```
//!
//! Ctrl-C ends the session on both sides. The exit code is 0 for a clean
//! session, 2 for a prerequisite failure, 3 when the reception node cannot
//! be reached, 4 for a protocol error and 1 otherwise.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use avlink::{Collaborators, ControllerOptions, SessionController, TailscaleDirectory};
use avlink_core::collaborator::{CommandAvatar, CommandNotifier, CommandVideo};
use avlink_core::{ExitStatus, LinkConfig, SysinfoProbe};

/// avlink - operator node of the avatar control channel
#[derive(Parser, Debug)]
#[command(name = "avlink", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one session with a reception node
    Connect {
        /// Reception node: tailnet host name or IP address
        peer: String,

        /// Control port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Name to host the video session under
        #[arg(long, default_value = "Operator")]
        display_name: String,

        /// Do not check for (or launch) the avatar application
        #[arg(long)]
        skip_avatar_check: bool,

        /// Do not check the overlay network
        #[arg(long)]
        skip_overlay_check: bool,

        /// Config file (default: $XDG_CONFIG_HOME/avlink/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let args = Args::parse();

    let status = match args.command {
        Command::Connect {
            peer,
            port,
            display_name,
            skip_avatar_check,
            skip_overlay_check,
            config,
        } => {
            let options = ControllerOptions {
                skip_avatar_check,
                skip_overlay_check,
            };
            match load_config(config, port) {
                Ok(config) => run_session(peer, display_name, config, options),
                Err(e) => {
                    eprintln!("avlink: {e:#}");
                    ExitStatus::Failure
                }
            }
        }
    };

    process::exit(status.code());
}

fn load_config(path: Option<PathBuf>, port: Option<u16>) -> Result<LinkConfig> {
    let mut config = LinkConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = port {
        config.port = port;
    }
    Ok(config)
}

fn log_filter() -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["avlink=info", "avlink_core=info", "avlink_protocol=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

#[tokio::main]
async fn run_session(
    peer: String,
    display_name: String,
    config: LinkConfig,
    options: ControllerOptions,
) -> ExitStatus {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        peer = %peer,
        port = config.port,
        "Operator node starting"
    );

    let probe = Arc::new(SysinfoProbe::new());
    let collaborators = Collaborators {
        video: Arc::new(CommandVideo::new(config.video.clone(), display_name)),
        avatar: Arc::new(CommandAvatar::new(config.avatar.clone(), probe.clone())),
        directory: Arc::new(TailscaleDirectory::new()),
        notifier: Arc::new(CommandNotifier::new(config.notify.clone(), "operator")),
        probe,
    };

    let controller = SessionController::new(peer, config, collaborators, options);
    let handle = controller.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, ending session");
                handle.shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let outcome = controller.run().await;
    match &outcome.error {
        Some(e) => {
            error!(error = %e, "Session failed");
            eprintln!("avlink: {e}");
        }
        None => {
            if let Some(cause) = &outcome.cause {
                info!(cause = %cause, "Session finished");
            }
        }
    }
    outcome.status
}
