//! devflash CLI - Command-line tool for updating USB headset docks and camera bars.
//!
//! ## Features
//!
//! - Update dock firmware over the HID protocol
//! - Update camera firmware over the bulk protocol
//! - Device listing with JSON output
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors raised by the CLI itself, mapped to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing input (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user declined or interrupted the operation (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// devflash - Firmware updates for USB headset docks and camera bars.
///
/// Environment variables:
///   DEVFLASH_DEVICE            - Device to update as VID:PID
///   DEVFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "devflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Device to use as VID:PID in hex (first supported device if not specified).
    #[arg(short, long, global = true, env = "DEVFLASH_DEVICE")]
    device: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (never prompt).
    #[arg(long, global = true, env = "DEVFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a firmware image to the attached device.
    Update {
        /// Firmware image file.
        firmware: PathBuf,

        /// Dock partition to write (repeatable, default 1).
        #[arg(short, long = "partition", value_name = "N")]
        partitions: Vec<u8>,

        /// Version triplet committed after a dock update, e.g. 3.8.1.
        #[arg(long, value_name = "A.B.C", value_parser = parse_fw_version)]
        fw_version: Option<[u8; 3]>,

        /// Chunks between acknowledgements on docks.
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
        preload: Option<u16>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the firmware version running on the attached device.
    Version {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List attached USB devices.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,

        /// Include devices without a supported update interface.
        #[arg(short, long)]
        all: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a dotted `major.minor.patch` version into its three bytes.
fn parse_fw_version(s: &str) -> Result<[u8; 3], String> {
    let parts: Vec<&str> = s
        .trim()
        .split('.')
        .collect();
    if parts.len() != 3 {
        return Err(format!("expected A.B.C, got '{s}'"));
    }
    let mut version = [0u8; 3];
    for (slot, part) in version
        .iter_mut()
        .zip(&parts)
    {
        *slot = part
            .parse()
            .map_err(|_| format!("'{part}' is not a number between 0 and 255"))?;
    }
    Ok(version)
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }

    let device_err = err
        .chain()
        .find_map(|e| e.downcast_ref::<devflash::Error>())
        .map(devflash::Error::root);
    match device_err {
        Some(devflash::Error::Interrupted) => 130,
        Some(devflash::Error::Config(_)) => 2,
        Some(devflash::Error::NotSupported(_)) => 4,
        _ => 1,
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "devflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    devflash::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Update {
            firmware,
            partitions,
            fw_version,
            preload,
            yes,
        } => {
            let args = commands::update::UpdateArgs {
                firmware,
                partitions,
                fw_version: *fw_version,
                preload: *preload,
                yes: *yes,
            };
            commands::update::cmd_update(cli, &config, &args)?;
        },
        Commands::Version { json } => {
            commands::version::cmd_version(cli, &config, *json)?;
        },
        Commands::List { json, all } => {
            commands::list::cmd_list(*json, *all);
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}
