//! CLI entry point for the disc ripper daemon
//!
//! Parses command line arguments, loads configuration and runs the daemon
//! until SIGINT or SIGTERM.

use clap::Parser;
use disc_ripper::{Config, Daemon, DaemonError, EXIT_CONFIG, EXIT_OK};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Disc Ripper - unattended optical disc archiving
#[derive(Parser, Debug)]
#[command(name = "disc-ripper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Optical drive device, overrides drive.device
    #[arg(short, long)]
    drive: Option<PathBuf>,

    /// Work-in-progress root, overrides paths.wip_root
    #[arg(long)]
    wip_root: Option<PathBuf>,

    /// Output root, overrides paths.out_root
    #[arg(long)]
    out_root: Option<PathBuf>,

    /// Leave finished discs in the drive
    #[arg(long, default_value = "false")]
    skip_eject: bool,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    debug: bool,

    /// Skip external tool checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(drive) = &self.drive {
            config.drive.device = drive.clone();
        }
        if let Some(wip_root) = &self.wip_root {
            config.paths.wip_root = wip_root.clone();
        }
        if let Some(out_root) = &self.out_root {
            config.paths.out_root = out_root.clone();
        }
        if self.skip_eject {
            config.drive.eject_on_completion = false;
        }
        if self.debug {
            config.logging.debug = true;
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

async fn run(config: Config, check_tools: bool) -> Result<(), DaemonError> {
    let mut daemon = Daemon::new(config, check_tools)?;
    let listener = daemon.spawn_signal_listener()?;
    let result = daemon.run().await;
    listener.abort();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (mut config, found) = match Config::load(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_tracing(args.debug);
            error!(config = %args.config.display(), "Failed to load configuration: {}", e);
            return exit(EXIT_CONFIG);
        }
    };
    args.apply(&mut config);
    init_tracing(config.logging.debug);

    if found {
        info!(config = %args.config.display(), "Configuration loaded");
    } else {
        warn!(config = %args.config.display(), "Configuration file not found, using defaults");
    }
    if args.skip_checks {
        warn!("Skipping external tool checks (--skip-checks enabled)");
    }

    match run(config, !args.skip_checks).await {
        Ok(()) => exit(EXIT_OK),
        Err(e) => {
            error!("Daemon error: {}", e);
            exit(e.exit_code())
        }
    }
}
