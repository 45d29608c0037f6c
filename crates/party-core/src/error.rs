//! Error types for core supervision and orchestration.
//!
//! Every error exposes a short `user_message()` for display and an
//! `is_retryable()` hint. Nothing in this crate retries on its own.

use std::path::PathBuf;

use party_updater::UpdateError;
use thiserror::Error;

use crate::privilege::Elevation;
use crate::supervisor::CoreState;

/// Process-control failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// A core process is already live or starting.
    #[error("core is already running")]
    AlreadyRunning,

    /// The OS could not create the process, or it exited during startup.
    #[error("failed to start {}: {reason}", .binary.display())]
    SpawnFailed {
        /// Binary that was launched.
        binary: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Another lifecycle operation is in flight.
    #[error("core is busy ({state})")]
    Busy {
        /// State at the time of the call.
        state: CoreState,
    },

    /// The process could not be terminated.
    #[error("failed to stop core: {0}")]
    StopFailed(String),

    /// `restart()` was called before anything was ever started.
    #[error("nothing to restart: the core has not been started")]
    NothingToRestart,
}

impl SupervisorError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::AlreadyRunning => "The core is already running.",
            Self::SpawnFailed { .. } => {
                "The core could not be started. Check the core log for details."
            }
            Self::Busy { .. } => "The core is starting or stopping. Try again in a moment.",
            Self::StopFailed(_) => "The core could not be stopped.",
            Self::NothingToRestart => "The core has not been started yet.",
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::StopFailed(_))
    }
}

/// Failures talking to the running core's control API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The core refused the request; the text is the core's own message.
    #[error("{0}")]
    Rejected(String),

    /// The controller secret was not accepted.
    #[error("control API rejected the secret")]
    Unauthorized,

    /// The control API did not answer.
    #[error("control API unreachable: {0}")]
    Unreachable(String),

    /// The control API answered with an unexpected status.
    #[error("control API error ({status}): {body}")]
    Unexpected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

impl ControlError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::Rejected(message) => message.as_str(),
            Self::Unauthorized => "The controller secret is wrong.",
            Self::Unreachable(_) => "The core is not responding.",
            Self::Unexpected { .. } => "The core returned an unexpected response.",
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Unexpected { status, .. } => *status >= 500,
            Self::Rejected(_) | Self::Unauthorized => false,
        }
    }
}

/// Invalid core selections.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SelectionError {
    /// The specific kind was chosen without a version.
    #[error("a specific core requires a version")]
    MissingSpecificVersion,

    /// The version is not the one installed in the specific slot.
    #[error("core version {version} is not installed")]
    NotInstalled {
        /// Requested version.
        version: String,
    },

    /// Unknown core kind name.
    #[error("unknown core kind: {0}")]
    UnknownKind(String),
}

impl SelectionError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::MissingSpecificVersion => "Choose a version for the specific core.",
            Self::NotInstalled { .. } => "Install that core version before selecting it.",
            Self::UnknownKind(_) => "Choose stable, alpha, smart or specific.",
        }
    }

    /// Selections never succeed on retry without a change of input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Settings and config file failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// File I/O error.
    #[error("failed to {operation} {}", .path.display())]
    Io {
        /// What was attempted.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this schema.
    #[error("invalid settings file {}", .path.display())]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// Settings could not be serialized.
    #[error("failed to serialize settings")]
    Serialize {
        /// Serializer error.
        #[source]
        source: toml::ser::Error,
    },

    /// The controlled core config is not valid YAML.
    #[error("invalid core config {}", .path.display())]
    Yaml {
        /// File involved.
        path: PathBuf,
        /// YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// No platform directory for application data could be determined.
    #[error("could not determine the application data directory")]
    NoDataDir,
}

impl SettingsError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::Io { .. } | Self::NoDataDir => "Settings could not be read or written.",
            Self::Parse { .. } | Self::Yaml { .. } => "The settings file is damaged.",
            Self::Serialize { .. } => "Settings could not be saved.",
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Failures obtaining OS privileges for TUN mode.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrivilegeError {
    /// This platform has no such mechanism.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// The helper command could not run or reported failure.
    #[error("{program} failed: {reason}")]
    CommandFailed {
        /// Program that was run.
        program: String,
        /// Exit status or spawn error.
        reason: String,
    },
}

impl PrivilegeError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::Unsupported(_) => "This action is not available on this system.",
            Self::CommandFailed { .. } => {
                "Permissions could not be granted. The request may have been cancelled."
            }
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }
}

/// Failures surfaced by the restart orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The core refused the configuration patch. Carries its message verbatim.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// The patch was accepted and persisted but the restart failed.
    ///
    /// Persisted configuration and the running process may now disagree;
    /// retrying the restart is up to the caller.
    #[error("restart failed after configuration change: {0}")]
    RestartFailed(#[source] SupervisorError),

    /// A lifecycle call outside a configuration change failed.
    #[error(transparent)]
    Supervisor(SupervisorError),

    /// The feature needs OS privileges the core does not have.
    #[error("elevated privileges required ({remedy})")]
    PermissionRequired {
        /// How the caller can obtain them.
        remedy: Elevation,
    },

    /// Installing a core failed.
    #[error(transparent)]
    Install(#[from] UpdateError),

    /// The control API failed for a reason other than validation.
    #[error(transparent)]
    Control(ControlError),

    /// The requested core selection is invalid.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Settings could not be persisted.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Granting privileges failed.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// The core reported that it is already the latest version.
    #[error("core is already using the latest version")]
    AlreadyLatest,
}

impl OrchestratorError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::ConfigRejected(message) => message.as_str(),
            Self::RestartFailed(_) => {
                "The configuration was saved but the core failed to restart. Try restarting the core."
            }
            Self::Supervisor(e) => e.user_message(),
            Self::PermissionRequired { remedy } => remedy.user_message(),
            Self::Install(e) => e.user_message(),
            Self::Control(e) => e.user_message(),
            Self::Selection(e) => e.user_message(),
            Self::Settings(e) => e.user_message(),
            Self::Privilege(e) => e.user_message(),
            Self::AlreadyLatest => "The core is already up to date.",
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RestartFailed(_) => true,
            Self::ConfigRejected(_) | Self::PermissionRequired { .. } | Self::AlreadyLatest => {
                false
            }
            Self::Supervisor(e) => e.is_retryable(),
            Self::Install(e) => e.is_retryable(),
            Self::Control(e) => e.is_retryable(),
            Self::Selection(e) => e.is_retryable(),
            Self::Settings(e) => e.is_retryable(),
            Self::Privilege(e) => e.is_retryable(),
        }
    }
}

impl From<ControlError> for OrchestratorError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Rejected(message) => Self::ConfigRejected(message),
            other => Self::Control(other),
        }
    }
}
