//! `partyctl`: mihomo core manager.

use std::io::{self, IsTerminal};

use clap::{ColorChoice, Parser};
use party_cli::cli::{Cli, Command, LogFormatArg, LogLevelArg};
use party_cli::logging::{LogConfig, LogFormat, init_logging};
use tracing::level_filters::LevelFilter;

mod commands;
mod console;

use crate::commands::AppContext;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.color.write_global();
    let log_config = log_config_from_cli(&cli);
    if let Err(error) = init_logging(&log_config) {
        eprintln!("error: failed to initialize logging: {error}");
        std::process::exit(1);
    }

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error:#}");
            if let Some(message) = commands::user_message(&error) {
                eprintln!("  {message}");
            }
            1
        }
    };
    // Exits without waiting on the blocking stdin reader of the console.
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Command::Platform = cli.command {
        return commands::run_platform();
    }
    let ctx = AppContext::load(cli.settings, cli.data_dir)?;
    match cli.command {
        Command::Versions(args) => commands::run_versions(&ctx, &args).await,
        Command::Install(args) => commands::run_install(&ctx, &args).await,
        Command::Use(args) => commands::run_use(&ctx, &args).await,
        Command::Platform => commands::run_platform(),
        Command::Permissions { action } => commands::run_permissions(&ctx, action).await,
        Command::Cleanup => commands::run_cleanup(&ctx),
        Command::Run => console::run_session(&ctx).await,
    }
}

/// Build logging configuration from CLI flags with consistent precedence.
fn log_config_from_cli(cli: &Cli) -> LogConfig {
    let mut config = LogConfig {
        level_filter: cli.verbosity.tracing_level_filter(),
        ..LogConfig::default()
    };
    config.use_env_filter = !(cli.verbosity.is_present() || cli.log_level.is_some());
    if let Some(level) = cli.log_level {
        config.level_filter = match level {
            LogLevelArg::Error => LevelFilter::ERROR,
            LogLevelArg::Warn => LevelFilter::WARN,
            LogLevelArg::Info => LevelFilter::INFO,
            LogLevelArg::Debug => LevelFilter::DEBUG,
            LogLevelArg::Trace => LevelFilter::TRACE,
        };
    }
    config.format = match cli.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    // Long-running sessions get timestamps.
    config.with_timestamps = matches!(cli.command, Command::Run);
    config.log_file = cli.log_file.clone();
    config.with_ansi = match cli.color.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => cli.log_file.is_none() && io::stderr().is_terminal(),
    };
    config
}
