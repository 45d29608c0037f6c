//! Core variants and the user's choice between them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SelectionError;

/// A core variant. Each variant has its own binary in the core directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoreKind {
    /// Stable release.
    #[default]
    #[serde(rename = "mihomo")]
    Stable,
    /// Alpha (prerelease) build.
    #[serde(rename = "mihomo-alpha")]
    Alpha,
    /// Smart-group build.
    #[serde(rename = "mihomo-smart")]
    Smart,
    /// A version pinned by the user and installed on demand.
    #[serde(rename = "mihomo-specific")]
    Specific,
}

impl CoreKind {
    /// Every kind, in display order.
    pub const ALL: [Self; 4] = [Self::Stable, Self::Alpha, Self::Smart, Self::Specific];

    /// Binary file stem, also the serialized name.
    #[must_use]
    pub const fn binary_stem(self) -> &'static str {
        match self {
            Self::Stable => "mihomo",
            Self::Alpha => "mihomo-alpha",
            Self::Smart => "mihomo-smart",
            Self::Specific => party_updater::SPECIFIC_BINARY_STEM,
        }
    }

    /// Binary file name with the platform's executable suffix.
    #[must_use]
    pub fn binary_file_name(self, exe_suffix: &str) -> String {
        format!("{}{exe_suffix}", self.binary_stem())
    }

    /// Short label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Alpha => "alpha",
            Self::Smart => "smart",
            Self::Specific => "specific",
        }
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CoreKind {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == s || kind.binary_stem() == s)
            .ok_or(SelectionError::UnknownKind(s))
    }
}

/// The user's chosen core.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSelection {
    /// Selected variant.
    pub kind: CoreKind,
    /// Pinned version; required when `kind` is [`CoreKind::Specific`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_version: Option<String>,
}

impl CoreSelection {
    /// The stable core.
    #[must_use]
    pub fn stable() -> Self {
        Self::default()
    }

    /// Selects a non-specific kind.
    pub fn of(kind: CoreKind) -> Result<Self, SelectionError> {
        if kind == CoreKind::Specific {
            return Err(SelectionError::MissingSpecificVersion);
        }
        Ok(Self {
            kind,
            specific_version: None,
        })
    }

    /// Selects a pinned version.
    pub fn specific(version: impl Into<String>) -> Result<Self, SelectionError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(SelectionError::MissingSpecificVersion);
        }
        Ok(Self {
            kind: CoreKind::Specific,
            specific_version: Some(version),
        })
    }

    /// Checks the selection against the version installed in the specific slot.
    pub fn validate(&self, installed_specific: Option<&str>) -> Result<(), SelectionError> {
        if self.kind != CoreKind::Specific {
            return Ok(());
        }
        let version = self
            .specific_version
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(SelectionError::MissingSpecificVersion)?;
        if installed_specific != Some(version) {
            return Err(SelectionError::NotInstalled {
                version: version.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for CoreSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.specific_version) {
            (CoreKind::Specific, Some(version)) => write!(f, "specific {version}"),
            (kind, _) => write!(f, "{kind}"),
        }
    }
}

/// The binary chosen for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCore {
    /// Kind that will actually run.
    pub kind: CoreKind,
    /// Path of its binary.
    pub path: PathBuf,
    /// True when the selected kind was missing and stable was used instead.
    pub fell_back: bool,
}

/// Picks the binary to launch for `selection`.
///
/// A missing specific binary falls back to the stable core.
#[must_use]
pub fn resolve_binary(selection: &CoreSelection, core_dir: &Path, exe_suffix: &str) -> ResolvedCore {
    let path = core_dir.join(selection.kind.binary_file_name(exe_suffix));
    if selection.kind == CoreKind::Specific && !path.is_file() {
        tracing::warn!(
            path = %path.display(),
            "specific core binary is missing, falling back to the stable core"
        );
        return ResolvedCore {
            kind: CoreKind::Stable,
            path: core_dir.join(CoreKind::Stable.binary_file_name(exe_suffix)),
            fell_back: true,
        };
    }
    ResolvedCore {
        kind: selection.kind,
        path,
        fell_back: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_names() {
        assert_eq!(CoreKind::Stable.binary_file_name(""), "mihomo");
        assert_eq!(CoreKind::Alpha.binary_file_name(".exe"), "mihomo-alpha.exe");
        assert_eq!(CoreKind::Smart.binary_file_name(""), "mihomo-smart");
        assert_eq!(CoreKind::Specific.binary_file_name(".exe"), "mihomo-specific.exe");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("alpha".parse::<CoreKind>().unwrap(), CoreKind::Alpha);
        assert_eq!("mihomo-smart".parse::<CoreKind>().unwrap(), CoreKind::Smart);
        assert_eq!(" Stable ".parse::<CoreKind>().unwrap(), CoreKind::Stable);
        assert_eq!(
            "nightly".parse::<CoreKind>(),
            Err(SelectionError::UnknownKind("nightly".to_string()))
        );
    }

    #[test]
    fn test_specific_requires_version() {
        assert_eq!(
            CoreSelection::of(CoreKind::Specific),
            Err(SelectionError::MissingSpecificVersion)
        );
        assert_eq!(
            CoreSelection::specific("  "),
            Err(SelectionError::MissingSpecificVersion)
        );
        let selection = CoreSelection::specific("v1.18.0").unwrap();
        assert_eq!(selection.to_string(), "specific v1.18.0");
    }

    #[test]
    fn test_validate_against_installed() {
        let selection = CoreSelection::specific("v1.18.0").unwrap();
        assert!(selection.validate(Some("v1.18.0")).is_ok());
        assert_eq!(
            selection.validate(Some("v1.17.0")),
            Err(SelectionError::NotInstalled {
                version: "v1.18.0".to_string()
            })
        );
        assert!(selection.validate(None).is_err());

        let hand_edited = CoreSelection {
            kind: CoreKind::Specific,
            specific_version: None,
        };
        assert_eq!(
            hand_edited.validate(Some("v1.18.0")),
            Err(SelectionError::MissingSpecificVersion)
        );
        assert!(CoreSelection::stable().validate(None).is_ok());
    }

    #[test]
    fn test_serialized_names() {
        let selection = CoreSelection::specific("v1.18.0").unwrap();
        let json = serde_json::to_string(&selection).unwrap();
        assert_eq!(json, r#"{"kind":"mihomo-specific","specific_version":"v1.18.0"}"#);

        let stable: CoreSelection = serde_json::from_str(r#"{"kind":"mihomo"}"#).unwrap();
        assert_eq!(stable, CoreSelection::stable());
    }

    #[test]
    fn test_resolve_falls_back_when_specific_missing() {
        let dir = tempfile::tempdir().unwrap();
        let selection = CoreSelection::specific("v1.18.0").unwrap();

        let resolved = resolve_binary(&selection, dir.path(), "");
        assert_eq!(resolved.kind, CoreKind::Stable);
        assert_eq!(resolved.path, dir.path().join("mihomo"));
        assert!(resolved.fell_back);

        std::fs::write(dir.path().join("mihomo-specific"), b"bin").unwrap();
        let resolved = resolve_binary(&selection, dir.path(), "");
        assert_eq!(resolved.kind, CoreKind::Specific);
        assert!(!resolved.fell_back);
    }

    #[test]
    fn test_resolve_other_kinds_never_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let selection = CoreSelection::of(CoreKind::Alpha).unwrap();
        let resolved = resolve_binary(&selection, dir.path(), ".exe");
        assert_eq!(resolved.path, dir.path().join("mihomo-alpha.exe"));
        assert!(!resolved.fell_back);
    }
}
