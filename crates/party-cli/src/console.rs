//! The `run` session: supervised core plus a line console.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;

use party_core::{CoreEvent, Orchestrator, ProxyMode};
use party_updater::ReleaseSource;

use crate::commands::{self, AppContext};

const HELP: &str = "\
commands:
  status                      show core state
  mode <rule|global|direct>   switch proxy mode
  tun <on|off>                toggle TUN mode
  restart                     restart the core
  use <kind> [version]        select stable, alpha, smart or specific <version>
  install <version>           install a version and switch to it
  versions [filter]           list published versions
  upgrade                     let the core upgrade itself
  quit                        stop the core and exit";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Mode(ProxyMode),
    Tun(bool),
    Restart,
    Use {
        kind: String,
        version: Option<String>,
    },
    Install(String),
    Versions(Option<String>),
    Upgrade,
    Help,
    Quit,
}

/// Parses one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let extra = words.next();

    let command = match (head.to_ascii_lowercase().as_str(), arg, extra) {
        ("status", None, None) => ConsoleCommand::Status,
        ("mode", Some(mode), None) => {
            ConsoleCommand::Mode(mode.parse().map_err(|e| format!("{e}"))?)
        }
        ("tun", Some(state), None) => match state {
            "on" | "true" | "1" => ConsoleCommand::Tun(true),
            "off" | "false" | "0" => ConsoleCommand::Tun(false),
            other => return Err(format!("tun expects on or off, got '{other}'")),
        },
        ("restart", None, None) => ConsoleCommand::Restart,
        ("use", Some(kind), version) => ConsoleCommand::Use {
            kind: kind.to_string(),
            version: version.map(str::to_string),
        },
        ("install", Some(version), None) => ConsoleCommand::Install(version.to_string()),
        ("versions", filter, None) => ConsoleCommand::Versions(filter.map(str::to_string)),
        ("upgrade", None, None) => ConsoleCommand::Upgrade,
        ("help" | "?", None, None) => ConsoleCommand::Help,
        ("quit" | "exit" | "q", None, None) => ConsoleCommand::Quit,
        _ => return Err(format!("unrecognized command '{}'; type 'help'", line.trim())),
    };
    Ok(Some(command))
}

/// Runs the core until `quit`, end of input or Ctrl-C.
pub async fn run_session(ctx: &AppContext) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let source = ctx.release_source()?;

    let removed = orchestrator.cleanup_stale();
    if removed > 0 {
        info!(removed, "removed leftover install files");
    }
    let printer = tokio::spawn(print_events(orchestrator.events().subscribe()));

    match orchestrator.start_core().await {
        Ok(pid) => println!(
            "core running (pid {})",
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        ),
        Err(e) => report_error(&anyhow::Error::new(e)),
    }
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read console input")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&orchestrator, &source, command).await {
                            report_error(&e);
                        }
                    }
                    Err(message) => eprintln!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("interrupted");
                break;
            }
        }
    }

    orchestrator.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn execute(
    orchestrator: &Arc<Orchestrator>,
    source: &ReleaseSource,
    command: ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Status => {
            let status = orchestrator.status()?;
            println!(
                "core: {} (pid {})",
                status.state,
                status.pid.map_or_else(|| "-".to_string(), |p| p.to_string())
            );
            println!("selection: {}", status.selection);
            println!(
                "mode: {}",
                status.mode.map_or_else(|| "unknown".to_string(), |m| m.to_string())
            );
            println!("tun: {}", if status.tun { "on" } else { "off" });
        }
        ConsoleCommand::Mode(mode) => orchestrator.set_mode(mode).await?,
        ConsoleCommand::Tun(enable) => orchestrator.set_tun(enable).await?,
        ConsoleCommand::Restart => orchestrator.restart_core().await?,
        ConsoleCommand::Use { kind, version } => {
            let selection = commands::parse_selection(&kind, version.as_deref())?;
            orchestrator.switch_core(selection).await?;
        }
        ConsoleCommand::Install(version) => {
            let installed = commands::install(orchestrator, &version, true).await?;
            println!("installed {} at {}", installed.version, installed.path.display());
        }
        ConsoleCommand::Versions(filter) => {
            let settings = orchestrator.settings();
            commands::print_versions(
                source,
                &settings.repo(),
                false,
                filter.as_deref(),
                20,
                settings.core.installed_specific.as_deref(),
            )
            .await?;
        }
        ConsoleCommand::Upgrade => orchestrator.upgrade_core().await?,
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<CoreEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "console fell behind on events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe(event: &CoreEvent) -> String {
    match event {
        CoreEvent::Started { pid, binary } => format!(
            "* core started: {} (pid {})",
            binary.display(),
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        ),
        CoreEvent::Stopped(report) => format!("* core stopped ({})", report.status),
        CoreEvent::Crashed(report) => format!("* core crashed ({}); use 'restart'", report.status),
        CoreEvent::ConfigApplied => "* configuration applied".to_string(),
        CoreEvent::ModeChanged(mode) => format!("* mode: {mode}"),
        CoreEvent::TunChanged(enabled) => format!("* tun: {}", if *enabled { "on" } else { "off" }),
        CoreEvent::CoreInstalled { version } => format!("* installed {version}"),
        CoreEvent::SelectionChanged(selection) => format!("* selected core: {selection}"),
        other => format!("* {other:?}"),
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("error: {err}");
    if let Some(message) = commands::user_message(err) {
        eprintln!("  {message}");
    }
}
