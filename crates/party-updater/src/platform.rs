//! Platform detection and asset name resolution.
//!
//! Maps the host (OS, architecture) pair to the name of the mihomo release
//! asset built for it. Pairs outside the table are unsupported.

use std::fmt;

use crate::error::{Result, UpdateError};

/// Asset name for each supported (OS, architecture) pair.
///
/// OS and architecture use the values of [`std::env::consts`].
const ASSET_TABLE: &[(&str, &str, &str)] = &[
    ("windows", "x86_64", "mihomo-windows-amd64-compatible"),
    ("windows", "x86", "mihomo-windows-386"),
    ("windows", "aarch64", "mihomo-windows-arm64"),
    ("macos", "x86_64", "mihomo-darwin-amd64-compatible"),
    ("macos", "aarch64", "mihomo-darwin-arm64"),
    ("linux", "x86_64", "mihomo-linux-amd64-compatible"),
    ("linux", "aarch64", "mihomo-linux-arm64"),
];

/// An (OS, architecture) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPlatform {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture, e.g. `x86_64`.
    pub arch: String,
}

impl HostPlatform {
    /// Creates a platform from explicit identifiers.
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Detect the platform this process runs on.
    #[must_use]
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Whether this is a Windows host.
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// Suffix of executable files on this platform.
    #[must_use]
    pub fn exe_suffix(&self) -> &'static str {
        if self.is_windows() { ".exe" } else { "" }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Archive format of a release asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// ZIP archive with a directory of files (Windows).
    Zip,
    /// Single gzip-compressed executable (macOS, Linux).
    Gzip,
}

impl ArchiveFormat {
    /// File extension used in asset names.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Gzip => "gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// The release asset resolved for a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTarget {
    /// Asset name token, e.g. `mihomo-linux-amd64-compatible`.
    pub asset: &'static str,
    /// Archive format of the asset.
    pub format: ArchiveFormat,
    /// `.exe` on Windows, empty elsewhere.
    pub exe_suffix: &'static str,
}

impl PlatformTarget {
    /// Asset file name for a version, e.g. `mihomo-linux-arm64-v1.18.0.gz`.
    #[must_use]
    pub fn archive_name(&self, version: &str) -> String {
        format!("{}-{version}.{}", self.asset, self.format.extension())
    }

    /// Name of the executable entry inside a zip asset.
    #[must_use]
    pub fn executable_name(&self) -> String {
        format!("{}{}", self.asset, self.exe_suffix)
    }
}

/// Resolves the asset for `platform`.
///
/// Fails with [`UpdateError::UnsupportedPlatform`] when the pair is not in
/// the table. There is no fallback.
pub fn resolve(platform: &HostPlatform) -> Result<PlatformTarget> {
    ASSET_TABLE
        .iter()
        .find(|(os, arch, _)| *os == platform.os && *arch == platform.arch)
        .map(|&(os, _, asset)| {
            let windows = os == "windows";
            PlatformTarget {
                asset,
                format: if windows {
                    ArchiveFormat::Zip
                } else {
                    ArchiveFormat::Gzip
                },
                exe_suffix: if windows { ".exe" } else { "" },
            }
        })
        .ok_or_else(|| UpdateError::UnsupportedPlatform {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        })
}

/// Every platform with a release asset.
pub fn supported_platforms() -> impl Iterator<Item = HostPlatform> {
    ASSET_TABLE
        .iter()
        .map(|&(os, arch, _)| HostPlatform::new(os, arch))
}
