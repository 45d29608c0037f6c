//! The controlled core configuration.
//!
//! The application owns a small YAML overlay (`config.yaml` in the work
//! directory) that the core is launched with. Accepted patches are merged
//! into it so they survive a restart.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::control::{ConfigPatch, ProxyMode};
use crate::error::SettingsError;
use crate::settings::write_atomic;

/// File name of the controlled config inside the work directory.
pub const CONTROLLED_CONFIG_FILE: &str = "config.yaml";

/// Persisted overlay of core settings owned by this application.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlledConfig {
    path: PathBuf,
    document: Value,
}

impl ControlledConfig {
    /// Loads the config from `work_dir`, or starts from defaults if absent.
    pub fn load(work_dir: &Path) -> Result<Self, SettingsError> {
        let path = work_dir.join(CONTROLLED_CONFIG_FILE);
        let document = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => default_document(),
            Ok(content) => {
                serde_yaml::from_str(&content).map_err(|source| SettingsError::Yaml {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => default_document(),
            Err(source) => {
                return Err(SettingsError::Io {
                    operation: "read",
                    path,
                    source,
                });
            }
        };
        Ok(Self { path, document })
    }

    /// File the config is saved to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole document.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Merges `patch` into the document. Only fields set in the patch change.
    pub fn apply(&mut self, patch: &ConfigPatch) -> Result<(), SettingsError> {
        let overlay = serde_yaml::to_value(patch).map_err(|source| SettingsError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        deep_merge(&mut self.document, overlay);
        Ok(())
    }

    /// Points the core's external controller at `address`.
    pub fn set_controller(&mut self, address: &str, secret: Option<&str>) {
        let Some(map) = self.document.as_mapping_mut() else {
            self.document = default_document();
            return self.set_controller(address, secret);
        };
        map.insert("external-controller".into(), controller_listen(address).into());
        match secret {
            Some(secret) => {
                map.insert("secret".into(), secret.into());
            }
            None => {
                map.remove("secret");
            }
        }
    }

    /// Saves the document atomically.
    pub fn save(&self) -> Result<(), SettingsError> {
        let content = serde_yaml::to_string(&self.document).map_err(|source| SettingsError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, content.as_bytes())
    }

    /// Current proxy mode.
    #[must_use]
    pub fn mode(&self) -> Option<ProxyMode> {
        self.document
            .get("mode")
            .and_then(Value::as_str)
            .and_then(|mode| mode.parse().ok())
    }

    /// Whether TUN is enabled.
    #[must_use]
    pub fn tun_enabled(&self) -> bool {
        self.document
            .get("tun")
            .and_then(|tun| tun.get("enable"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn default_document() -> Value {
    let mut map = Mapping::new();
    map.insert("mode".into(), ProxyMode::Rule.as_str().into());
    map.insert("mixed-port".into(), 7890_i64.into());
    map.insert("allow-lan".into(), false.into());
    map.insert("log-level".into(), "info".into());
    map.insert("external-controller".into(), crate::control::DEFAULT_CONTROLLER.into());
    let mut tun = Mapping::new();
    tun.insert("enable".into(), false.into());
    map.insert("tun".into(), Value::Mapping(tun));
    Value::Mapping(map)
}

/// Recursively merges mappings; any other value in `overlay` replaces the base.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// `host:port` form of a controller address; the core rejects URLs here.
fn controller_listen(address: &str) -> &str {
    let trimmed = address.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlledConfig::load(dir.path()).unwrap();
        assert_eq!(config.mode(), Some(ProxyMode::Rule));
        assert!(!config.tun_enabled());
        assert_eq!(config.path(), dir.path().join("config.yaml"));
    }

    #[test]
    fn test_apply_merges_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "mode: global\ntun:\n  enable: false\n  stack: mixed\ndns:\n  enable: false\n  ipv6: true\n",
        )
        .unwrap();

        let mut config = ControlledConfig::load(dir.path()).unwrap();
        config.apply(&ConfigPatch::tun(true)).unwrap();

        assert!(config.tun_enabled());
        assert_eq!(config.mode(), Some(ProxyMode::Global));
        let doc = config.document();
        assert_eq!(doc["tun"]["stack"].as_str(), Some("mixed"));
        assert_eq!(doc["dns"]["enable"].as_bool(), Some(true));
        assert_eq!(doc["dns"]["ipv6"].as_bool(), Some(true));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControlledConfig::load(dir.path()).unwrap();
        config.apply(&ConfigPatch::mode(ProxyMode::Direct)).unwrap();
        config.set_controller("127.0.0.1:9097", Some("token"));
        config.save().unwrap();

        let reloaded = ControlledConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.mode(), Some(ProxyMode::Direct));
        assert_eq!(reloaded.document()["secret"].as_str(), Some("token"));
    }

    #[test]
    fn test_controller_url_is_written_as_host_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControlledConfig::load(dir.path()).unwrap();

        config.set_controller("http://127.0.0.1:9097/", None);
        assert_eq!(
            config.document()["external-controller"].as_str(),
            Some("127.0.0.1:9097")
        );

        config.set_controller(" https://[::1]:9090", None);
        assert_eq!(
            config.document()["external-controller"].as_str(),
            Some("[::1]:9090")
        );
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "mode: [rule\n").unwrap();
        assert!(matches!(
            ControlledConfig::load(dir.path()),
            Err(SettingsError::Yaml { .. })
        ));
    }

    #[test]
    fn test_scalar_overlay_replaces() {
        let mut base: Value = serde_yaml::from_str("a: {b: 1}\nc: [1, 2]").unwrap();
        deep_merge(&mut base, serde_yaml::from_str("a: 3\nc: [9]").unwrap());
        assert_eq!(base["a"].as_i64(), Some(3));
        assert_eq!(base["c"].as_sequence().map(Vec::len), Some(1));
    }
}
