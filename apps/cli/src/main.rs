//! mtp-server CLI - MTP storage daemon.
//!
//! Runs the storage lifecycle daemon, or probes the environment it would
//! run in.

mod daemon;
mod probe;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use log::{LevelFilter, error};
use mtp_server_core::{Config, Result, Settings};
use snafu::Report;

/// MTP storage daemon.
#[derive(Parser)]
#[command(name = "mtp-server")]
#[command(about = "Expose home and removable storage over MTP while the session is unlocked", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: /etc/mtp-server/config.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device node of the MTP gadget function
    #[arg(long, global = true)]
    transport: Option<PathBuf>,

    /// Directory the automounter mounts removable volumes under
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,

    /// Do not track the screen lock, expose storage unconditionally
    #[arg(long, global = true)]
    no_session_lock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the daemon (default).
    Run,
    /// Print the resolved configuration, the tracked session and the
    /// mounted volumes, then exit.
    Probe,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // RUST_LOG takes precedence over the verbosity flags
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(transport) = &cli.transport {
        config.transport_path = transport.clone();
    }
    if let Some(media_root) = &cli.media_root {
        config.media_root = Some(media_root.clone());
    }
    if cli.no_session_lock {
        config.track_session_lock = false;
    }
    config.resolve()
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = load_settings(&cli).and_then(|settings| {
        match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => daemon::run_daemon(&settings),
            Commands::Probe => probe::run_probe(&settings),
        }
    });

    if let Err(e) = result {
        error!("{}", Report::from_error(&e));
        std::process::exit(1);
    }
}
