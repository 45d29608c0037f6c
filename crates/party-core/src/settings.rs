//! Application settings - persisted user preferences.
//!
//! Stored as TOML in the platform config directory and written atomically
//! so a crash never leaves a half-written file behind.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use party_updater::{DEFAULT_DOWNLOAD_BASE, GITHUB_API_URL, RepoId};
use serde::{Deserialize, Serialize};

use crate::control::DEFAULT_CONTROLLER;
use crate::error::SettingsError;
use crate::selection::CoreSelection;
use crate::supervisor::ProcessPriority;

/// Settings file name inside the config directory.
pub const SETTINGS_FILE: &str = "settings.toml";

// =============================================================================
// ROOT SETTINGS
// =============================================================================

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Core selection and launch options.
    pub core: CoreSettings,
    /// External controller of the running core.
    pub controller: ControllerSettings,
    /// Where core releases come from.
    pub release: ReleaseSettings,
    /// Directory overrides.
    pub paths: PathSettings,
}

impl AppSettings {
    /// Default settings file location.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        project_dirs()
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
            .ok_or(SettingsError::NoDataDir)
    }

    /// Loads settings from the default path.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    operation: "read",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Saves settings to the default path.
    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::default_path()?)
    }

    /// Saves settings to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let content =
            toml::to_string_pretty(self).map_err(|source| SettingsError::Serialize { source })?;
        write_atomic(path, content.as_bytes())?;
        tracing::debug!(path = %path.display(), "saved settings");
        Ok(())
    }

    /// Application data directory.
    pub fn data_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.paths.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(SettingsError::NoDataDir),
        }
    }

    /// Directory holding core binaries.
    pub fn core_dir(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.data_dir()?.join("cores"))
    }

    /// Working directory of the core (config, caches, `core.log`).
    pub fn work_dir(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.data_dir()?.join("work"))
    }

    /// Release repository.
    #[must_use]
    pub fn repo(&self) -> RepoId {
        RepoId::new(&self.release.owner, &self.release.repo)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "mihomo-party", "party")
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Core selection and launch options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Which core to run.
    pub selection: CoreSelection,
    /// Version installed in the specific slot, if any.
    pub installed_specific: Option<String>,
    /// Core log level.
    pub log_level: String,
    /// Process priority (Windows).
    pub priority: ProcessPriority,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            selection: CoreSelection::stable(),
            installed_specific: None,
            log_level: "info".to_string(),
            priority: ProcessPriority::Normal,
        }
    }
}

/// External controller of the running core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// `host:port` the core's control API listens on.
    pub address: String,
    /// Bearer secret, if the controller requires one.
    pub secret: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONTROLLER.to_string(),
            secret: None,
        }
    }
}

/// Where core releases come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSettings {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// REST API base URL.
    pub api_base: String,
    /// Base URL for release asset downloads.
    pub download_base: String,
    /// Token for authenticated API calls.
    pub github_token: Option<String>,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        let repo = RepoId::mihomo();
        Self {
            owner: repo.owner,
            repo: repo.repo,
            api_base: GITHUB_API_URL.to_string(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            github_token: None,
        }
    }
}

/// Directory overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Replaces the platform data directory.
    pub data_dir: Option<PathBuf>,
}

// =============================================================================
// ATOMIC WRITE
// =============================================================================

fn io_error(operation: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError + use<> {
    let path = path.to_path_buf();
    move |source| SettingsError::Io {
        operation,
        path,
        source,
    }
}

/// Writes `bytes` to a temporary sibling, syncs it, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error("create directory", parent))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path).map_err(io_error("create", &temp_path))?;
    file.write_all(bytes).map_err(io_error("write", &temp_path))?;
    file.sync_all().map_err(io_error("sync", &temp_path))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        SettingsError::Io {
            operation: "replace",
            path: path.to_path_buf(),
            source,
        }
    })
}
