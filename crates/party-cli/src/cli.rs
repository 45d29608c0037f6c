//! CLI argument definitions for `partyctl`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colorchoice_clap::Color;

/// Command line of `partyctl`.
#[derive(Debug, Parser)]
#[command(
    name = "partyctl",
    version,
    about = "Manage and supervise the mihomo proxy core",
    long_about = "Manage and supervise the mihomo proxy core.\n\n\
                  Lists and installs core releases, switches between core variants\n\
                  and runs the core under supervision with a small console."
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (default: platform config directory).
    #[arg(long = "settings", value_name = "PATH", global = true)]
    pub settings: Option<PathBuf>,

    /// Data directory holding `cores/` and `work/` (overrides settings).
    #[arg(long = "data-dir", value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Adjust log verbosity (-v for info, -vv for debug, -q for errors only).
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Control ANSI color output (auto, always, never).
    #[command(flatten)]
    pub color: Color,

    /// Explicit log level (overrides -v/-q flags).
    #[arg(long = "log-level", value_enum, global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Log output format (pretty for human, json for machine parsing).
    #[arg(
        long = "log-format",
        value_enum,
        default_value = "pretty",
        global = true
    )]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr.
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List published core versions.
    Versions(VersionsArgs),

    /// Download and install a core version into the specific slot.
    Install(InstallArgs),

    /// Select the core variant to run.
    Use(UseArgs),

    /// Show the release asset for this machine.
    Platform,

    /// Check or grant the privileges TUN mode needs.
    Permissions {
        /// Action.
        #[command(subcommand)]
        action: PermissionsAction,
    },

    /// Remove files left behind by interrupted installs.
    Cleanup,

    /// Run the core in the foreground with an interactive console.
    Run,
}

/// Arguments of `versions`.
#[derive(Debug, Parser)]
pub struct VersionsArgs {
    /// Bypass the cache and fetch the list again.
    #[arg(long = "refresh")]
    pub refresh: bool,

    /// Only show versions containing this text (case-insensitive).
    #[arg(long = "filter", value_name = "TEXT")]
    pub filter: Option<String>,

    /// Show at most this many versions.
    #[arg(long = "limit", value_name = "N", default_value_t = 30)]
    pub limit: usize,
}

/// Arguments of `install`.
#[derive(Debug, Parser)]
pub struct InstallArgs {
    /// Version tag, e.g. v1.18.0.
    #[arg(value_name = "VERSION")]
    pub version: String,

    /// Install without selecting the new version.
    #[arg(long = "no-switch")]
    pub no_switch: bool,
}

/// Arguments of `use`.
#[derive(Debug, Parser)]
pub struct UseArgs {
    /// Core variant: stable, alpha, smart or specific.
    #[arg(value_name = "KIND")]
    pub kind: String,

    /// Version for the specific variant.
    #[arg(long = "version", value_name = "VERSION")]
    pub version: Option<String>,
}

/// `permissions` actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum PermissionsAction {
    /// Report whether the core may enable TUN.
    Check,
    /// Grant the core binary the needed privileges (or relaunch elevated on Windows).
    Grant,
}

/// CLI log level choices.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Lifecycle information.
    Info,
    /// Debugging details.
    Debug,
    /// Everything.
    Trace,
}

/// CLI log format choices.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable.
    Pretty,
    /// Single line.
    Compact,
    /// JSON lines.
    Json,
}
