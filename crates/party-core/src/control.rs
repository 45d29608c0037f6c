//! Client for the running core's HTTP control API.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ControlError;

/// Default controller address of a locally launched core.
pub const DEFAULT_CONTROLLER: &str = "127.0.0.1:9090";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy routing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Route by rules.
    #[default]
    Rule,
    /// Send everything through the selected proxy.
    Global,
    /// Bypass proxies.
    Direct,
}

impl ProxyMode {
    /// All modes.
    pub const ALL: [Self; 3] = [Self::Rule, Self::Global, Self::Direct];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Global => "global",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized proxy mode name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown proxy mode '{0}' (expected rule, global or direct)")]
pub struct UnknownMode(pub String);

impl FromStr for ProxyMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// `tun` section of a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunPatch {
    /// Enable or disable TUN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Network stack (`system`, `gvisor`, `mixed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// `dns` section of a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsPatch {
    /// Enable or disable the core's DNS server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
}

/// Partial core configuration. Only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigPatch {
    /// Routing mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProxyMode>,
    /// TUN settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun: Option<TunPatch>,
    /// DNS settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsPatch>,
    /// Core log level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Mixed HTTP/SOCKS port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixed_port: Option<u16>,
    /// Accept connections from the LAN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_lan: Option<bool>,
    /// IPv6 support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<bool>,
}

impl ConfigPatch {
    /// Patch that only changes the mode.
    #[must_use]
    pub fn mode(mode: ProxyMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// Patch toggling TUN. Enabling also turns on DNS, which TUN needs.
    #[must_use]
    pub fn tun(enable: bool) -> Self {
        Self {
            tun: Some(TunPatch {
                enable: Some(enable),
                stack: None,
            }),
            dns: enable.then_some(DnsPatch { enable: Some(true) }),
            ..Self::default()
        }
    }

    /// Whether applying this patch needs elevated privileges.
    #[must_use]
    pub fn requires_privilege(&self) -> bool {
        self.tun.as_ref().and_then(|tun| tun.enable) == Some(true)
    }

    /// Whether nothing is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Answer of `GET /version`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoreVersion {
    /// Version string.
    pub version: String,
    /// Whether the core is a Meta build.
    #[serde(default)]
    pub meta: bool,
}

/// The control API operations the orchestrator needs.
pub trait ControlApi: Send + Sync {
    /// Applies a partial configuration to the live core.
    ///
    /// The core validates the patch first; a rejection comes back as
    /// [`ControlError::Rejected`] carrying the core's message.
    fn patch_config(
        &self,
        patch: &ConfigPatch,
    ) -> impl Future<Output = Result<(), ControlError>> + Send;

    /// Queries the core version.
    fn version(&self) -> impl Future<Output = Result<CoreVersion, ControlError>> + Send;

    /// Asks the core to upgrade itself in place.
    fn upgrade_core(&self) -> impl Future<Output = Result<(), ControlError>> + Send;
}

impl<T: ControlApi> ControlApi for Arc<T> {
    fn patch_config(
        &self,
        patch: &ConfigPatch,
    ) -> impl Future<Output = Result<(), ControlError>> + Send {
        (**self).patch_config(patch)
    }

    fn version(&self) -> impl Future<Output = Result<CoreVersion, ControlError>> + Send {
        (**self).version()
    }

    fn upgrade_core(&self) -> impl Future<Output = Result<(), ControlError>> + Send {
        (**self).upgrade_core()
    }
}

/// HTTP client for the external controller.
#[derive(Debug, Clone)]
pub struct HttpControlClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlClient {
    /// Creates a client for `address` (`host:port` or a full URL).
    pub fn new(address: &str, secret: Option<&str>) -> Result<Self, ControlError> {
        let mut headers = HeaderMap::new();
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|_| ControlError::Unauthorized)?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url(address),
        })
    }

    /// Controller base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ControlError> {
        let response = request
            .send()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &body))
    }
}

impl ControlApi for HttpControlClient {
    async fn patch_config(&self, patch: &ConfigPatch) -> Result<(), ControlError> {
        tracing::debug!(?patch, "patching core config");
        let url = format!("{}/configs", self.base_url);
        self.send(self.client.patch(url).json(patch)).await?;
        Ok(())
    }

    async fn version(&self) -> Result<CoreVersion, ControlError> {
        let url = format!("{}/version", self.base_url);
        let response = self.send(self.client.get(url)).await?;
        let status = response.status().as_u16();
        response.json().await.map_err(|e| ControlError::Unexpected {
            status,
            body: e.to_string(),
        })
    }

    async fn upgrade_core(&self) -> Result<(), ControlError> {
        let url = format!("{}/upgrade", self.base_url);
        self.send(self.client.post(url)).await?;
        Ok(())
    }
}

fn base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Maps a non-success response to an error, keeping the core's message.
fn error_from_response(status: StatusCode, body: &str) -> ControlError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ControlError::Unauthorized,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ControlError::Rejected(message),
        _ => ControlError::Unexpected {
            status: status.as_u16(),
            body: message,
        },
    }
}

/// Whether a control API failure says the core is already up to date.
pub(crate) fn is_already_latest(err: &ControlError) -> bool {
    const MARKER: &str = "already using latest version";
    match err {
        ControlError::Rejected(message) | ControlError::Unexpected { body: message, .. } => {
            message.contains(MARKER)
        }
        _ => false,
    }
}
