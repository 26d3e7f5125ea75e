//! avlinkd - reception node
//!
//! Listens on the control port for the operator's join target, joins the
//! video session as a guest, watches the local video collaborator and
//! relays termination back to the operator.
//!
//! # Usage
//!
//! ```bash
//! # Start in the foreground
//! avlinkd start --display-name "Front Desk"
//!
//! # Start in the background
//! avlinkd start -d
//!
//! # Stop / check the background process
//! avlinkd stop
//! avlinkd status
//!
//! # Enable debug logging
//! RUST_LOG=avlinkd=debug avlinkd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: end the active session (relaying `end` to the
//!   operator), then stop listening

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use avlink_core::collaborator::{CommandNotifier, CommandVideo};
use avlink_core::{LinkConfig, SysinfoProbe};
use avlinkd::{spawn_session_handler, TransportServer};

/// Name the reception node joins the video session under by default.
const DEFAULT_DISPLAY_NAME: &str = "Reception";

/// avlinkd - reception node of the avatar control channel
#[derive(Parser, Debug)]
#[command(name = "avlinkd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start listening for the operator
    Start {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen: IpAddr,

        /// Control port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Name to join the video session under
        #[arg(long, default_value = DEFAULT_DISPLAY_NAME)]
        display_name: String,

        /// Run as a background process
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (default: $XDG_CONFIG_HOME/avlink/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the background process
    Stop,
    /// Show whether the background process is running
    Status,
}

struct StartOptions {
    listen: SocketAddr,
    display_name: String,
    config: LinkConfig,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("avlink")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("avlinkd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("avlinkd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 checks for existence without delivering anything.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Returns the PID of a running instance, removing a stale PID file.
fn running_instance() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn stop_instance(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        listen: IpAddr::from([0, 0, 0, 0]),
        port: None,
        display_name: DEFAULT_DISPLAY_NAME.to_string(),
        daemon: false,
        config: None,
    });

    match command {
        Command::Start {
            listen,
            port,
            display_name,
            daemon,
            config,
        } => {
            if let Some(pid) = running_instance() {
                eprintln!("avlinkd is already running (PID {})", pid);
                eprintln!("Use 'avlinkd stop' to stop it first.");
                process::exit(1);
            }

            let mut config =
                LinkConfig::load(config.as_deref()).context("Failed to load configuration")?;
            if let Some(port) = port {
                config.port = port;
            }
            let options = StartOptions {
                listen: SocketAddr::new(listen, config.port),
                display_name,
                config,
            };

            if daemon {
                // Must happen before the tokio runtime starts.
                daemonize()?;
            }

            write_pid()?;
            let result = run_reception(options);
            remove_pid_file();
            result
        }
        Command::Stop => match running_instance() {
            Some(pid) => {
                println!("Stopping avlinkd (PID {})...", pid);
                stop_instance(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("avlinkd stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("avlinkd did not stop within 5 seconds.");
                process::exit(1);
            }
            None => {
                println!("avlinkd is not running.");
                Ok(())
            }
        },
        Command::Status => match running_instance() {
            Some(pid) => {
                println!("avlinkd is running (PID {})", pid);
                println!("Log: {}", log_file_path().display());
                Ok(())
            }
            None => {
                println!("avlinkd is not running.");
                process::exit(1);
            }
        },
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_reception(options: StartOptions) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("avlinkd=info".parse()?)
                .add_directive("avlink_core=info".parse()?)
                .add_directive("avlink_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        display_name = %options.display_name,
        "Reception node starting"
    );

    let config = options.config;
    let video = Arc::new(CommandVideo::new(config.video.clone(), options.display_name));
    let probe = Arc::new(SysinfoProbe::new());
    let notifier = Arc::new(CommandNotifier::new(config.notify.clone(), "reception"));
    let session = spawn_session_handler(&config, video, probe, notifier);

    let cancel_token = CancellationToken::new();
    let server = TransportServer::bind(
        options.listen,
        Arc::new(session.clone()),
        &config,
        cancel_token.clone(),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", options.listen))?;

    let shutdown_token = cancel_token.clone();
    let shutdown_session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        if let Err(e) = shutdown_session.shutdown().await {
            warn!(error = %e, "Session handler already stopped");
        }
        shutdown_token.cancel();
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Reception node stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
