//! Typed lifecycle events.
//!
//! The supervisor and orchestrator publish on an [`EventBus`]; tray,
//! window and console front ends subscribe. Publishers never hold a
//! reference to a subscriber.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::control::ProxyMode;
use crate::selection::CoreSelection;

/// Events kept per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// How a core process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Process id.
    pub pid: Option<u32>,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Human-readable status.
    pub status: String,
    /// When the exit was observed.
    pub at: DateTime<Utc>,
}

impl ExitReport {
    pub(crate) fn from_status(pid: Option<u32>, status: std::process::ExitStatus) -> Self {
        Self {
            pid,
            code: status.code(),
            status: status.to_string(),
            at: Utc::now(),
        }
    }
}

/// Something observable happened to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreEvent {
    /// The process passed its startup probe.
    Started {
        /// Process id.
        pid: Option<u32>,
        /// Binary it runs from.
        binary: PathBuf,
    },
    /// A requested stop completed; the OS has confirmed the exit.
    Stopped(ExitReport),
    /// The process exited without being asked to.
    Crashed(ExitReport),
    /// A configuration patch was accepted and persisted.
    ConfigApplied,
    /// The proxy mode changed.
    ModeChanged(ProxyMode),
    /// TUN mode was switched.
    TunChanged(bool),
    /// A core version was installed into the specific slot.
    CoreInstalled {
        /// Installed version.
        version: String,
    },
    /// The selected core changed.
    SelectionChanged(CoreSelection),
}

/// Broadcast dispatcher for [`CoreEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        tracing::trace!(?event, "core event");
        let _ = self.tx.send(event);
    }
}
