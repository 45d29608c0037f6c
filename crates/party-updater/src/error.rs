//! Error types for release lookup and core installation.

use thiserror::Error;

/// Errors that can occur while listing releases or installing a core binary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateError {
    /// No release asset exists for this OS and architecture.
    #[error("unsupported platform: {os}-{arch}")]
    UnsupportedPlatform {
        /// Operating system identifier.
        os: String,
        /// CPU architecture identifier.
        arch: String,
    },

    /// The release index could not be reached or returned an error.
    #[error("release source unavailable: {0}")]
    SourceUnavailable(String),

    /// The release index throttled the request.
    #[error("GitHub API rate limit exceeded, retry after {retry_after} seconds")]
    RateLimited {
        /// Seconds until the rate limit resets.
        retry_after: u64,
    },

    /// The asset download failed or timed out.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// The downloaded archive could not be decoded.
    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    /// The archive did not contain the expected executable.
    #[error("executable '{expected}' not found in archive")]
    ExecutableNotFound {
        /// File name the entry was matched against.
        expected: String,
    },

    /// The install directory or target file is not writable.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The version identifier cannot be used to build a download URL.
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    /// The process bound to the target binary could not be stopped.
    #[error("failed to stop running core: {0}")]
    StopFailed(String),

    /// Other I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(String),
}

impl UpdateError {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::UnsupportedPlatform { .. } => {
                "Your platform is not supported by this core build."
            }
            Self::SourceUnavailable(_) => {
                "Could not reach GitHub. Please check your internet connection and try again."
            }
            Self::RateLimited { .. } => "GitHub API rate limit reached. Please try again later.",
            Self::DownloadFailed(_) => "The core download failed. Please try again.",
            Self::ArchiveCorrupt(_) => "The downloaded core package is damaged. Please try again.",
            Self::ExecutableNotFound { .. } => {
                "The downloaded package does not contain a core for your platform."
            }
            Self::PermissionDenied(_) => {
                "The core directory is not writable. Check its permissions."
            }
            Self::InvalidVersion(_) => "The selected version is not valid.",
            Self::StopFailed(_) => "The running core could not be stopped before installing.",
            Self::Io(_) => "An unexpected file system error occurred.",
        }
    }

    /// Returns whether this error is potentially recoverable with a retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_)
                | Self::RateLimited { .. }
                | Self::DownloadFailed(_)
                | Self::ArchiveCorrupt(_)
                | Self::Io(_)
        )
    }

    /// Maps a failed write into the install directory.
    pub(crate) fn from_write(err: &std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(format!("{}: {err}", path.display()))
        } else {
            Self::Io(format!("{}: {err}", path.display()))
        }
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        Self::SourceUnavailable(format!("malformed response: {err}"))
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::ArchiveCorrupt(err.to_string())
    }
}

/// Result type alias for release and install operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
