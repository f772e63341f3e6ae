//! CLI entry point for recall.
//!
//! # Architecture overview
//!
//! `main.rs` is the thin coordination layer between the CLI surface and the
//! library crate. Its responsibilities are:
//!
//! 1. Parse CLI arguments (via `clap`)
//! 2. Load `.aicf/config.json` and initialize tracing (JSON to stderr;
//!    daemon mode mirrors the stream to `.watcher.log` and errors to
//!    `.watcher.error.log`)
//! 3. Dispatch to the pipeline (`tick`, `watch`) or the control surface
//!    (`permissions`, `status`)
//!
//! # Exit behavior
//!
//! `run()` returns `Result<(), RecallError>`; `main()` prints the error and
//! exits 1. Only irrecoverable startup conditions reach that path (an
//! unreadable permissions file, an unusable storage root). A cancelled
//! watch loop exits 0 after finishing its current stage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use recall::config::{Config, WatcherMode};
use recall::error::RecallError;
use recall::layout::{Layout, Tier};
use recall::model::Platform;
use recall::permissions::PermissionStore;
use recall::watcher::{CancelToken, Watcher};

#[derive(Parser)]
#[command(name = "recall", about = "Consolidate AI coding conversations into durable memory")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Storage root holding .aicf/, .ai/, and .cache/ (defaults to the
    /// current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pipeline pass and exit
    Tick,
    /// Run the periodic watcher until interrupted
    Watch {
        /// Override the configured tick interval
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Override the configured mode: daemon or foreground
        #[arg(long)]
        mode: Option<String>,
    },
    /// Show per-tier record counts
    Status,
    /// Inspect or change per-platform consent
    Permissions {
        #[command(subcommand)]
        action: PermissionsAction,
    },
}

#[derive(Subcommand)]
enum PermissionsAction {
    /// List consent state for every known platform
    List,
    /// Grant consent for a platform
    Grant {
        /// Platform id: augment, claude-cli, claude-desktop, warp
        platform: Platform,
        /// Consent type recorded with the grant
        #[arg(long, default_value = "full_access")]
        consent_type: String,
    },
    /// Revoke consent for a platform
    Revoke {
        /// Platform id: augment, claude-cli, claude-desktop, warp
        platform: Platform,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RecallError> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let layout = Layout::new(root);
    let config = Config::load(&layout.config_file());

    match cli.command {
        Command::Tick => {
            init_tracing(WatcherMode::Foreground, &layout)?;
            let mut permissions = PermissionStore::load(&layout.permissions_file())?;
            let watcher = Watcher::with_default_platforms(layout, config, CancelToken::new());
            watcher.tick(&mut permissions);
            Ok(())
        }
        Command::Watch { interval_ms, mode } => {
            let mode = match mode.as_deref() {
                Some("daemon") => WatcherMode::Daemon,
                Some("foreground") => WatcherMode::Foreground,
                Some(other) => {
                    return Err(RecallError::Other(format!(
                        "Unknown mode: {other}. Valid: daemon, foreground"
                    )));
                }
                None => config.watcher.mode,
            };
            init_tracing(mode, &layout)?;

            let interval = Duration::from_millis(interval_ms.unwrap_or(config.tick_interval_ms));
            let mut permissions = PermissionStore::load(&layout.permissions_file())?;
            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || handler_token.cancel())
                .map_err(|e| RecallError::Other(format!("Failed to install signal handler: {e}")))?;

            let watcher = Watcher::with_default_platforms(layout, config, cancel);
            watcher.start(interval, &mut permissions);
            Ok(())
        }
        Command::Status => {
            let mut rows = Vec::new();
            for tier in [Tier::Recent, Tier::Medium, Tier::Old, Tier::Archive] {
                rows.push((tier.dir_name(), count_aicf(&layout.tier_dir(tier))));
            }
            rows.push(("sessions", count_aicf(&layout.sessions_dir())));
            for (name, count) in rows {
                println!("{name:>9}: {count}");
            }
            Ok(())
        }
        Command::Permissions { action } => {
            let mut permissions = PermissionStore::load(&layout.permissions_file())?;
            match action {
                PermissionsAction::List => {
                    for platform in Platform::ALL {
                        match permissions.get(platform) {
                            Some(entry) => println!(
                                "{:>15}: {} ({})",
                                platform.id(),
                                entry.status,
                                entry.consent_type
                            ),
                            None => println!("{:>15}: no consent recorded", platform.id()),
                        }
                    }
                    Ok(())
                }
                PermissionsAction::Grant {
                    platform,
                    consent_type,
                } => {
                    permissions.grant(platform, &consent_type)?;
                    eprintln!("Granted {} ({consent_type})", platform.id());
                    Ok(())
                }
                PermissionsAction::Revoke { platform } => {
                    permissions.revoke(platform)?;
                    eprintln!("Revoked {}", platform.id());
                    Ok(())
                }
            }
        }
    }
}

fn count_aicf(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "aicf"))
        .count()
}

/// Structured JSON logs to stderr; daemon mode mirrors the stream to
/// `.watcher.log` and errors to `.watcher.error.log`. No network sink.
fn init_tracing(mode: WatcherMode, layout: &Layout) -> Result<(), RecallError> {
    use tracing_subscriber::Layer;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().json().with_writer(std::io::stderr);

    match mode {
        WatcherMode::Foreground => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
        WatcherMode::Daemon => {
            let log = Arc::new(open_append(&layout.watcher_log_file())?);
            let error_log = Arc::new(open_append(&layout.watcher_error_log_file())?);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().json().with_ansi(false).with_writer(log))
                .with(
                    fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(error_log)
                        .with_filter(LevelFilter::ERROR),
                )
                .init();
        }
    }
    Ok(())
}

fn open_append(path: &std::path::Path) -> Result<std::fs::File, RecallError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}
