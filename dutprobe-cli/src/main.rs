//! dutprobe CLI - Command-line runner for serial-console board tests.
//!
//! ## Features
//!
//! - Run bootloader and OS-shell tests against a board on the bench
//! - Interactive serial port selection
//! - Watch for the board appearing and disappearing on USB
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use dutprobe::TestKind;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if spinners and colours should be used (TTY and colours enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// dutprobe - Serial-console hardware tests for boards on the line.
///
/// Environment variables:
///   DUTPROBE_PORT              - Default serial port
///   DUTPROBE_BAUD              - Bootloader baud rate (default: 115200)
///   DUTPROBE_OS_BAUD           - OS console baud rate (default: 921600)
///   DUTPROBE_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "dutprobe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "DUTPROBE_PORT")]
    pub(crate) port: Option<String>,

    /// Bootloader baud rate.
    #[arg(short, long, global = true, env = "DUTPROBE_BAUD")]
    pub(crate) baud: Option<u32>,

    /// OS console baud rate.
    #[arg(long, global = true, env = "DUTPROBE_OS_BAUD")]
    pub(crate) os_baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress the live transcript).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DUTPROBE_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Offer all ports during selection (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run one or more tests against the connected board.
    Run {
        /// Tests to run, in order (see `list-tests`).
        #[arg(required_unless_present = "all")]
        tests: Vec<TestKind>,

        /// Run every test in catalogue order.
        #[arg(long, conflicts_with = "tests")]
        all: bool,

        /// Print a JSON summary to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List the available tests.
    ListTests {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Watch for the board by USB identity and report connects, disconnects
    /// and prompts until Ctrl-C.
    Watch {
        /// USB vendor ID (hex), defaults to the first configured usb_device.
        #[arg(long, value_parser = parse_hex_u16)]
        vid: Option<u16>,

        /// USB product ID (hex).
        #[arg(long, value_parser = parse_hex_u16, requires = "vid")]
        pid: Option<u16>,
    },

    /// Print a shell completion script.
    Completions {
        /// Shell type.
        shell: Option<Shell>,
    },
}

/// Parse a hex u16 with or without the 0x prefix.
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID '{s}': {e}"))
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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
        "dutprobe v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            match err.downcast_ref::<CliError>() {
                Some(cli_err) => ExitCode::from(cli_err.exit_code()),
                None => ExitCode::FAILURE,
            }
        },
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Run { tests, all, json } => {
            let kinds = if *all { TestKind::ALL.to_vec() } else { tests.clone() };
            commands::run::cmd_run(cli, &mut config, &kinds, *json)
        },
        Commands::ListTests { json } => {
            commands::list::cmd_list_tests(*json)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::ListPorts { json } => {
            commands::list::cmd_list_ports(&config, *json)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Watch { vid, pid } => {
            commands::watch::cmd_watch(cli, &config, *vid, *pid)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Completions { shell } => {
            let shell = shell.ok_or_else(|| {
                CliError::Usage("specify a shell type, e.g.: dutprobe completions bash".to_string())
            })?;
            commands::completions::cmd_completions(shell);
            Ok(ExitCode::SUCCESS)
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config, &dutprobe::NativeBackend)?;

    // Offer to remember ports that were picked by hand
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
