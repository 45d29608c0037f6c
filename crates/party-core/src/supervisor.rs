//! Core Process Supervisor.
//!
//! Owns the one core process of this application run. All spawning and
//! killing goes through [`Supervisor`]; a background monitor task owns the
//! OS child handle and reports its exit.
//!
//! # States
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`, and
//! `Running -> Crashed -> Stopped` when the process exits on its own.
//! A crashed supervisor may be started again directly.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use party_updater::CoreStopper;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::SupervisorError;
use crate::events::{CoreEvent, EventBus, ExitReport};

/// Time a process gets to exit after the termination signal.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A process that exits within this window after spawn failed to start.
pub const STARTUP_PROBE: Duration = Duration::from_millis(400);

/// Lifecycle state of the core process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    /// No process.
    Stopped,
    /// Spawned, startup probe in progress.
    Starting,
    /// Live.
    Running,
    /// Termination requested, exit not yet confirmed.
    Stopping,
    /// Exited without being asked to.
    Crashed,
}

impl CoreState {
    /// Whether a process handle may be live in this state.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        })
    }
}

/// Windows process priority class for the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPriority {
    /// `IDLE_PRIORITY_CLASS`.
    Idle,
    /// `BELOW_NORMAL_PRIORITY_CLASS`.
    BelowNormal,
    /// `NORMAL_PRIORITY_CLASS`.
    #[default]
    Normal,
    /// `ABOVE_NORMAL_PRIORITY_CLASS`.
    AboveNormal,
    /// `HIGH_PRIORITY_CLASS`.
    High,
    /// `REALTIME_PRIORITY_CLASS`.
    Realtime,
}

impl ProcessPriority {
    /// Process creation flag for this class.
    #[must_use]
    pub const fn class_flag(self) -> u32 {
        match self {
            Self::Idle => 0x0000_0040,
            Self::BelowNormal => 0x0000_4000,
            Self::Normal => 0x0000_0020,
            Self::AboveNormal => 0x0000_8000,
            Self::High => 0x0000_0080,
            Self::Realtime => 0x0000_0100,
        }
    }
}

/// How to launch the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable path.
    pub binary: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub work_dir: Option<PathBuf>,
    /// File receiving the process's stdout and stderr.
    pub log_file: Option<PathBuf>,
    /// Priority class (Windows only).
    pub priority: ProcessPriority,
}

impl LaunchSpec {
    /// Launches `binary` with no arguments.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            work_dir: None,
            log_file: None,
            priority: ProcessPriority::Normal,
        }
    }

    /// Standard mihomo launch: `-d <work_dir> -f <config>`, output to `core.log`.
    pub fn for_core(binary: impl Into<PathBuf>, work_dir: &Path, config_file: &Path) -> Self {
        Self::new(binary)
            .with_args([
                "-d".to_string(),
                work_dir.display().to_string(),
                "-f".to_string(),
                config_file.display().to_string(),
            ])
            .with_work_dir(work_dir)
            .with_log_file(work_dir.join("core.log"))
    }

    /// Replaces the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Sets the output log file.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Sets the priority class.
    #[must_use]
    pub fn with_priority(mut self, priority: ProcessPriority) -> Self {
        self.priority = priority;
        self
    }
}

struct StopRequest {
    force: bool,
    reply: oneshot::Sender<Result<(), String>>,
}

struct LiveProcess {
    pid: Option<u32>,
    binary: PathBuf,
    stop_tx: mpsc::Sender<StopRequest>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

struct Inner {
    state: CoreState,
    /// Incremented on every start; monitors of older processes are ignored.
    generation: u64,
    live: Option<LiveProcess>,
    last_launch: Option<LaunchSpec>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: EventBus,
    grace: Duration,
    probe: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a confirmed exit and notifies subscribers.
    fn finish(&self, generation: u64, report: &ExitReport) {
        let previous = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.live = None;
            let previous = inner.state;
            inner.state = match previous {
                CoreState::Running => CoreState::Crashed,
                CoreState::Starting | CoreState::Stopping => CoreState::Stopped,
                other => other,
            };
            previous
        };

        match previous {
            CoreState::Running => {
                tracing::error!(pid = ?report.pid, status = %report.status, "core exited unexpectedly");
                self.events.emit(CoreEvent::Crashed(report.clone()));
            }
            CoreState::Stopping => {
                tracing::info!(pid = ?report.pid, status = %report.status, "core stopped");
                self.events.emit(CoreEvent::Stopped(report.clone()));
            }
            CoreState::Starting => {
                tracing::warn!(pid = ?report.pid, status = %report.status, "core exited during startup");
            }
            CoreState::Stopped | CoreState::Crashed => {}
        }
    }
}

/// Supervises the core process. Clones share the same process.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Supervisor {
    /// Creates an idle supervisor publishing on `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self::with_timings(events, STOP_GRACE_PERIOD, STARTUP_PROBE)
    }

    pub(crate) fn with_timings(events: EventBus, grace: Duration, probe: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: CoreState::Stopped,
                    generation: 0,
                    live: None,
                    last_launch: None,
                }),
                events,
                grace,
                probe,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoreState {
        self.shared.lock().state
    }

    /// Process id of the live process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().live.as_ref().and_then(|live| live.pid)
    }

    /// Binary of the live process.
    #[must_use]
    pub fn current_binary(&self) -> Option<PathBuf> {
        self.shared.lock().live.as_ref().map(|live| live.binary.clone())
    }

    /// Launch used by the last successful start.
    #[must_use]
    pub fn last_launch(&self) -> Option<LaunchSpec> {
        self.shared.lock().last_launch.clone()
    }

    /// The bus lifecycle events are published on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Starts the core.
    ///
    /// Rejects the call with [`SupervisorError::AlreadyRunning`] while a
    /// process is live or another start is in flight. Returns the process id
    /// once the process has survived the startup probe.
    pub async fn start(&self, spec: LaunchSpec) -> Result<Option<u32>, SupervisorError> {
        let generation = {
            let mut inner = self.shared.lock();
            if inner.state.is_live() {
                return Err(SupervisorError::AlreadyRunning);
            }
            inner.state = CoreState::Starting;
            inner.generation += 1;
            inner.generation
        };

        let result = self.spawn_and_probe(&spec, generation).await;

        let mut inner = self.shared.lock();
        match result {
            Ok(pid) if inner.generation == generation && inner.state == CoreState::Starting => {
                inner.state = CoreState::Running;
                inner.last_launch = Some(spec.clone());
                drop(inner);
                tracing::info!(pid = ?pid, binary = %spec.binary.display(), "core started");
                self.shared.events.emit(CoreEvent::Started {
                    pid,
                    binary: spec.binary,
                });
                Ok(pid)
            }
            Ok(_) => Err(SupervisorError::SpawnFailed {
                binary: spec.binary,
                reason: "process exited during startup".to_string(),
            }),
            Err(e) => {
                if inner.generation == generation && inner.state == CoreState::Starting {
                    inner.state = CoreState::Stopped;
                    inner.live = None;
                }
                Err(e)
            }
        }
    }

    async fn spawn_and_probe(
        &self,
        spec: &LaunchSpec,
        generation: u64,
    ) -> Result<Option<u32>, SupervisorError> {
        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            binary: spec.binary.clone(),
            reason,
        };

        let mut command = Command::new(&spec.binary);
        command.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }
        match &spec.log_file {
            Some(path) => {
                let (stdout, stderr) =
                    open_log(path).map_err(|e| spawn_failed(format!("log file {}: {e}", path.display())))?;
                command.stdout(stdout).stderr(stderr);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        apply_platform_flags(&mut command, spec.priority);

        let child = command.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, binary = %spec.binary.display(), "core spawned");

        let (stop_tx, stop_rx) = mpsc::channel(4);
        let (exit_tx, mut exit_rx) = watch::channel(None);
        self.shared.lock().live = Some(LiveProcess {
            pid,
            binary: spec.binary.clone(),
            stop_tx,
            exit_rx: exit_rx.clone(),
        });
        tokio::spawn(monitor(
            Arc::clone(&self.shared),
            generation,
            child,
            stop_rx,
            exit_tx,
        ));

        let early_exit = match tokio::time::timeout(
            self.shared.probe,
            exit_rx.wait_for(Option::is_some),
        )
        .await
        {
            Err(_) => None,
            Ok(Ok(report)) => Some(
                report
                    .as_ref()
                    .map_or_else(|| "unknown status".to_string(), |r| r.status.clone()),
            ),
            Ok(Err(_)) => Some("monitor ended".to_string()),
        };

        match early_exit {
            None => Ok(pid),
            Some(status) => Err(spawn_failed(format!("exited during startup ({status})"))),
        }
    }

    /// Stops the core.
    ///
    /// Sends a termination signal and force-kills after the grace period;
    /// `force` skips the signal. Resolves once the OS has confirmed the
    /// exit. Stopping an idle supervisor succeeds without doing anything.
    pub async fn stop(&self, force: bool) -> Result<(), SupervisorError> {
        let (generation, stop_tx) = {
            let mut inner = self.shared.lock();
            match inner.state {
                CoreState::Stopped => return Ok(()),
                CoreState::Crashed => {
                    inner.state = CoreState::Stopped;
                    return Ok(());
                }
                state @ (CoreState::Starting | CoreState::Stopping) => {
                    return Err(SupervisorError::Busy { state });
                }
                CoreState::Running => {}
            }
            let Some(stop_tx) = inner.live.as_ref().map(|live| live.stop_tx.clone()) else {
                inner.state = CoreState::Stopped;
                return Ok(());
            };
            inner.state = CoreState::Stopping;
            (inner.generation, stop_tx)
        };

        tracing::info!(force, "stopping core");
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = StopRequest {
            force,
            reply: reply_tx,
        };
        if stop_tx.send(request).await.is_err() {
            // The monitor already recorded the exit.
            return Ok(());
        }

        match reply_rx.await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(reason)) => {
                let mut inner = self.shared.lock();
                if inner.generation == generation && inner.state == CoreState::Stopping {
                    inner.state = CoreState::Running;
                }
                Err(SupervisorError::StopFailed(reason))
            }
        }
    }

    /// Stops, then starts again with the last successful launch.
    ///
    /// Nothing is started when the stop fails.
    pub async fn restart(&self) -> Result<Option<u32>, SupervisorError> {
        let spec = self
            .last_launch()
            .ok_or(SupervisorError::NothingToRestart)?;
        self.restart_with(spec).await
    }

    /// Stops, then starts with `spec`.
    pub async fn restart_with(&self, spec: LaunchSpec) -> Result<Option<u32>, SupervisorError> {
        self.stop(false).await?;
        self.start(spec).await
    }

    /// Waits until the live process exits and returns how it ended.
    ///
    /// Returns `None` immediately when nothing is live.
    pub async fn wait_for_exit(&self) -> Option<ExitReport> {
        let mut exit_rx = self.shared.lock().live.as_ref()?.exit_rx.clone();
        exit_rx.wait_for(Option::is_some).await.ok()?.clone()
    }
}

impl CoreStopper for Supervisor {
    async fn stop_bound_to(&self, binary: &Path) -> Result<(), String> {
        let bound = self
            .current_binary()
            .is_some_and(|current| same_path(&current, binary));
        if !bound {
            return Ok(());
        }
        tracing::info!(path = %binary.display(), "stopping core to replace its binary");
        self.stop(false).await.map_err(|e| e.to_string())
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[cfg(windows)]
fn apply_platform_flags(command: &mut Command, priority: ProcessPriority) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW | priority.class_flag());
}

#[cfg(not(windows))]
fn apply_platform_flags(_command: &mut Command, priority: ProcessPriority) {
    if priority != ProcessPriority::Normal {
        tracing::debug!(?priority, "process priority is only applied on Windows");
    }
}

/// Owns the child until it exits, serving stop requests meanwhile.
async fn monitor(
    shared: Arc<Shared>,
    generation: u64,
    mut child: Child,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let pid = child.id();
    let mut waiting = Vec::new();

    let outcome = loop {
        tokio::select! {
            status = child.wait() => break status.map_err(|e| e.to_string()),
            Some(request) = stop_rx.recv() => {
                match terminate(&mut child, pid, request.force, shared.grace).await {
                    Ok(status) => {
                        waiting.push(request.reply);
                        break Ok(status);
                    }
                    Err(reason) => {
                        tracing::error!(pid = ?pid, %reason, "failed to terminate core");
                        let _ = request.reply.send(Err(reason));
                    }
                }
            }
        }
    };

    let report = match outcome {
        Ok(status) => ExitReport::from_status(pid, status),
        Err(reason) => ExitReport {
            pid,
            code: None,
            status: format!("wait failed: {reason}"),
            at: Utc::now(),
        },
    };
    shared.finish(generation, &report);
    exit_tx.send_replace(Some(report));
    for reply in waiting {
        let _ = reply.send(Ok(()));
    }
}

async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    force: bool,
    grace: Duration,
) -> Result<ExitStatus, String> {
    if !force && send_termination_signal(pid) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.map_err(|e| e.to_string()),
            Err(_) => tracing::warn!(
                pid = ?pid,
                grace_ms = grace.as_millis() as u64,
                "core ignored termination signal, killing"
            ),
        }
    }
    child.kill().await.map_err(|e| e.to_string())?;
    child.wait().await.map_err(|e| e.to_string())
}

/// Asks the process to exit. Returns false when no signal could be sent.
#[cfg(unix)]
fn send_termination_signal(pid: Option<u32>) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_termination_signal(_pid: Option<u32>) -> bool {
    false
}
