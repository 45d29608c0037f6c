//! Asset Installer.
//!
//! Installs a release of the core into the specific-version slot of the
//! core directory. The download lands in a temporary file and the
//! executable is extracted to a staging file before it is renamed over the
//! target, so an interrupted install never damages a working binary.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use crate::download::{AssetFetcher, DownloadProgress, HttpDownloader, format_bytes};
use crate::error::{Result, UpdateError};
use crate::extract;
use crate::platform::{self, HostPlatform, PlatformTarget};
use crate::release::RepoId;

/// Default base URL for release downloads.
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com";

/// File stem of the specific-version core binary.
pub const SPECIFIC_BINARY_STEM: &str = "mihomo-specific";

/// File stem of the temporary download, shared across installs.
const TEMP_STEM: &str = "temp-core";

/// Suffix of the extraction staging file.
const STAGING_SUFFIX: &str = ".partial";

/// Stops whatever process runs from a binary path.
///
/// The installer calls this before it replaces an existing binary and
/// only proceeds once the future resolves with `Ok`.
pub trait CoreStopper: Send + Sync {
    /// Stops the process bound to `binary`, if any, and waits for its exit.
    fn stop_bound_to(
        &self,
        binary: &Path,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;
}

/// Installer settings.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Directory holding core binaries.
    pub core_dir: PathBuf,
    /// Repository whose releases are installed.
    pub repo: RepoId,
    /// Base URL of release downloads.
    pub download_base: String,
    /// File stem of the installed binary.
    pub binary_stem: String,
    /// Platform the binary is installed for.
    pub platform: HostPlatform,
}

impl InstallerConfig {
    /// Standard settings for the mihomo specific-version slot on this host.
    pub fn new(core_dir: impl Into<PathBuf>) -> Self {
        Self {
            core_dir: core_dir.into(),
            repo: RepoId::mihomo(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            binary_stem: SPECIFIC_BINARY_STEM.to_string(),
            platform: HostPlatform::current(),
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    /// Installed version.
    pub version: String,
    /// Final path of the executable.
    pub path: PathBuf,
    /// Size of the downloaded archive.
    pub archive_bytes: u64,
}

/// Downloads and installs core releases.
#[derive(Debug, Clone)]
pub struct Installer<A = HttpDownloader> {
    fetcher: A,
    config: InstallerConfig,
}

impl<A: AssetFetcher> Installer<A> {
    /// Creates an installer.
    pub fn new(fetcher: A, config: InstallerConfig) -> Self {
        Self { fetcher, config }
    }

    /// The installer settings.
    #[must_use]
    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// The download collaborator.
    #[must_use]
    pub fn fetcher(&self) -> &A {
        &self.fetcher
    }

    /// Resolves the release asset for the configured platform.
    pub fn target(&self) -> Result<PlatformTarget> {
        platform::resolve(&self.config.platform)
    }

    /// Download URL of `version` for `target`.
    #[must_use]
    pub fn download_url(&self, target: &PlatformTarget, version: &str) -> String {
        format!(
            "{}/{}/{}/releases/download/{version}/{}",
            self.config.download_base.trim_end_matches('/'),
            self.config.repo.owner,
            self.config.repo.repo,
            target.archive_name(version)
        )
    }

    /// Final path of the installed executable.
    #[must_use]
    pub fn target_path(&self, target: &PlatformTarget) -> PathBuf {
        self.config
            .core_dir
            .join(format!("{}{}", self.config.binary_stem, target.exe_suffix))
    }

    fn temp_path(&self, target: &PlatformTarget) -> PathBuf {
        self.config
            .core_dir
            .join(format!("{TEMP_STEM}.{}", target.format.extension()))
    }

    /// Whether a binary occupies the target path.
    pub fn is_installed(&self) -> Result<bool> {
        let target = self.target()?;
        Ok(self.target_path(&target).is_file())
    }

    /// Installs `version`, replacing any binary already in the slot.
    ///
    /// Steps run in a fixed order: resolve the platform (no I/O happens
    /// for unsupported platforms), stop the process bound to an existing
    /// target, download to the temporary file, extract, mark executable,
    /// rename into place. The temporary file is removed on every path.
    pub async fn install<S: CoreStopper>(
        &self,
        version: &str,
        stopper: &S,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<InstalledBinary> {
        let target = self.target()?;
        validate_version(version)?;

        let url = self.download_url(&target, version);
        let final_path = self.target_path(&target);
        let temp_path = self.temp_path(&target);
        tracing::info!(version, asset = target.asset, "installing core");

        tokio::fs::create_dir_all(&self.config.core_dir)
            .await
            .map_err(|e| UpdateError::from_write(&e, &self.config.core_dir))?;
        self.cleanup_stale();

        if final_path.exists() {
            tracing::debug!(path = %final_path.display(), "stopping core before replacing binary");
            stopper
                .stop_bound_to(&final_path)
                .await
                .map_err(UpdateError::StopFailed)?;
        }

        let result = self
            .download_and_extract(&url, &target, &temp_path, &final_path, progress)
            .await;

        if let Err(e) = remove_if_present(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "failed to delete temporary download");
        }

        let archive_bytes = result?;
        tracing::info!(
            version,
            path = %final_path.display(),
            size = %format_bytes(archive_bytes),
            "core installed"
        );
        Ok(InstalledBinary {
            version: version.to_string(),
            path: final_path,
            archive_bytes,
        })
    }

    async fn download_and_extract(
        &self,
        url: &str,
        target: &PlatformTarget,
        temp_path: &Path,
        final_path: &Path,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64> {
        let archive_bytes = self.fetcher.fetch_to(url, temp_path, progress).await?;

        let format = target.format;
        let executable_name = target.executable_name();
        let needs_exec_bit = target.exe_suffix.is_empty();
        let archive = temp_path.to_path_buf();
        let dest = final_path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let staging = staging_path(&dest);
            let result = extract::extract(format, &archive, &executable_name, &staging)
                .and_then(|()| {
                    if needs_exec_bit {
                        set_executable(&staging);
                    }
                    fs::rename(&staging, &dest).map_err(|e| UpdateError::from_write(&e, &dest))
                });
            if result.is_err() {
                if let Err(e) = remove_if_present(&staging) {
                    tracing::warn!(path = %staging.display(), error = %e, "failed to delete staging file");
                }
            }
            result
        })
        .await
        .map_err(|e| UpdateError::Io(format!("extraction task failed: {e}")))??;

        Ok(archive_bytes)
    }

    /// Removes temporary downloads and staging files left by abandoned
    /// installs. Returns how many files were deleted.
    pub fn cleanup_stale(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.config.core_dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = name.starts_with(&format!("{TEMP_STEM}.")) || name.ends_with(STAGING_SUFFIX);
            if !stale || !entry.path().is_file() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::debug!(file = %name, "removed stale install file");
                    removed += 1;
                }
                Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove stale install file"),
            }
        }
        removed
    }
}

impl Installer<HttpDownloader> {
    /// Creates an installer that downloads over HTTP.
    pub fn with_http(config: InstallerConfig) -> Result<Self> {
        Ok(Self::new(HttpDownloader::new()?, config))
    }
}

/// Rejects identifiers that cannot be a single URL path segment.
fn validate_version(version: &str) -> Result<()> {
    let bad = version.is_empty()
        || version == "."
        || version == ".."
        || version
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\' | '?' | '#'));
    if bad {
        return Err(UpdateError::InvalidVersion(version.to_string()));
    }
    Ok(())
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Marks the file executable. Failure is tolerated with a warning; the
/// file may already carry the bit.
#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
        tracing::warn!(path = %path.display(), error = %e, "failed to set executable permission");
    }
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFetch;

    impl AssetFetcher for NoFetch {
        async fn fetch_to(
            &self,
            _url: &str,
            _dest: &Path,
            _progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        ) -> Result<u64> {
            Err(UpdateError::DownloadFailed("offline".to_string()))
        }
    }

    fn installer(dir: &Path, os: &str, arch: &str) -> Installer<NoFetch> {
        let mut config = InstallerConfig::new(dir);
        config.platform = HostPlatform::new(os, arch);
        Installer::new(NoFetch, config)
    }

    #[test]
    fn test_download_url_template() {
        let installer = installer(Path::new("/cores"), "windows", "x86_64");
        let target = installer.target().unwrap();
        assert_eq!(
            installer.download_url(&target, "v1.18.0"),
            "https://github.com/MetaCubeX/mihomo/releases/download/v1.18.0/mihomo-windows-amd64-compatible-v1.18.0.zip"
        );
    }

    #[test]
    fn test_target_path_suffix() {
        let windows = installer(Path::new("/cores"), "windows", "aarch64");
        let target = windows.target().unwrap();
        assert_eq!(windows.target_path(&target), Path::new("/cores/mihomo-specific.exe"));

        let linux = installer(Path::new("/cores"), "linux", "aarch64");
        let target = linux.target().unwrap();
        assert_eq!(linux.target_path(&target), Path::new("/cores/mihomo-specific"));
        assert_eq!(linux.temp_path(&target), Path::new("/cores/temp-core.gz"));
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("v1.18.0").is_ok());
        assert!(validate_version("Prerelease-Alpha").is_ok());
        for bad in ["", "..", "v1/../x", "v1 2", "v1?x", "a\\b"] {
            assert!(
                matches!(validate_version(bad), Err(UpdateError::InvalidVersion(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/cores/mihomo-specific.exe")),
            Path::new("/cores/mihomo-specific.exe.partial")
        );
    }

    #[test]
    fn test_cleanup_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("temp-core.zip"), b"x").unwrap();
        fs::write(dir.path().join("temp-core.gz"), b"x").unwrap();
        fs::write(dir.path().join("mihomo-specific.partial"), b"x").unwrap();
        fs::write(dir.path().join("mihomo-specific"), b"keep").unwrap();
        fs::write(dir.path().join("mihomo"), b"keep").unwrap();

        let installer = installer(dir.path(), "linux", "x86_64");
        assert_eq!(installer.cleanup_stale(), 3);
        assert!(dir.path().join("mihomo-specific").exists());
        assert!(dir.path().join("mihomo").exists());
        assert_eq!(installer.cleanup_stale(), 0);
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let installer = installer(Path::new("/nonexistent/cores"), "linux", "x86_64");
        assert_eq!(installer.cleanup_stale(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mihomo-specific");
        fs::write(&path, b"bin").unwrap();
        set_executable(&path);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
