//! Core process supervision and restart orchestration for mihomo party.
//!
//! - [`Supervisor`] owns the single core process: start, graceful stop with
//!   a forced kill after the grace period, restart, crash detection.
//! - [`Orchestrator`] turns user intents into control API patches,
//!   persisted configuration and supervised restarts.
//! - [`EventBus`] publishes typed [`CoreEvent`]s to front ends.
//! - [`AppSettings`] and [`ControlledConfig`] hold what survives a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod privilege;
pub mod profile;
pub mod selection;
pub mod settings;
pub mod supervisor;

pub use control::{ConfigPatch, ControlApi, CoreVersion, HttpControlClient, ProxyMode};
pub use error::{
    ControlError, OrchestratorError, PrivilegeError, SelectionError, SettingsError,
    SupervisorError,
};
pub use events::{CoreEvent, EventBus, ExitReport};
pub use orchestrator::{CoreStatus, Orchestrator, OrchestratorParts};
pub use privilege::{
    Elevation, PrivilegeProbe, PrivilegeStatus, SystemPrivileges, grant_tun_permissions,
    relaunch_elevated,
};
pub use profile::ControlledConfig;
pub use selection::{CoreKind, CoreSelection, ResolvedCore, resolve_binary};
pub use settings::AppSettings;
pub use supervisor::{CoreState, LaunchSpec, ProcessPriority, Supervisor};
