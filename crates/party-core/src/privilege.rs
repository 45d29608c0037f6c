//! OS privilege checks for TUN mode.
//!
//! TUN needs the core to create network interfaces. On Windows that means
//! the whole application must run elevated. On Unix the core binary can be
//! granted the capability once (setuid root on macOS, `cap_net_admin` on
//! Linux) so the application itself stays unprivileged.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;

use crate::error::PrivilegeError;

/// How missing privileges can be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Restart the application as administrator.
    RelaunchElevated,
    /// Grant the core binary the needed capability.
    GrantCapability,
}

impl Elevation {
    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RelaunchElevated => {
                "TUN mode needs administrator rights. Restart the application as administrator."
            }
            Self::GrantCapability => {
                "TUN mode needs extra permissions for the core. Grant them and try again."
            }
        }
    }
}

impl fmt::Display for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RelaunchElevated => "relaunch as administrator",
            Self::GrantCapability => "grant core permissions",
        })
    }
}

/// Result of a privilege check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeStatus {
    /// The core can enable TUN.
    Sufficient,
    /// The core cannot; the remedy says what would fix it.
    Missing(Elevation),
}

impl PrivilegeStatus {
    /// Whether the privileges are sufficient.
    #[must_use]
    pub const fn is_sufficient(self) -> bool {
        matches!(self, Self::Sufficient)
    }
}

/// Checks whether the core may enable TUN.
pub trait PrivilegeProbe: Send + Sync {
    /// Checks privileges for launching `core_binary`.
    fn check(&self, core_binary: &Path) -> impl Future<Output = PrivilegeStatus> + Send;
}

impl<T: PrivilegeProbe> PrivilegeProbe for Arc<T> {
    fn check(&self, core_binary: &Path) -> impl Future<Output = PrivilegeStatus> + Send {
        (**self).check(core_binary)
    }
}

/// Probe backed by the real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPrivileges;

impl PrivilegeProbe for SystemPrivileges {
    async fn check(&self, core_binary: &Path) -> PrivilegeStatus {
        let status = system_check(core_binary).await;
        tracing::debug!(binary = %core_binary.display(), ?status, "privilege check");
        status
    }
}

#[cfg(windows)]
async fn system_check(_core_binary: &Path) -> PrivilegeStatus {
    // `net session` only succeeds for administrators.
    let mut command = Command::new("net");
    command.arg("session").creation_flags(CREATE_NO_WINDOW);
    match command.output().await {
        Ok(output) if output.status.success() => PrivilegeStatus::Sufficient,
        _ => PrivilegeStatus::Missing(Elevation::RelaunchElevated),
    }
}

#[cfg(unix)]
async fn system_check(core_binary: &Path) -> PrivilegeStatus {
    if nix::unistd::geteuid().is_root()
        || is_setuid_root(core_binary)
        || has_net_admin_capability(core_binary).await
    {
        PrivilegeStatus::Sufficient
    } else {
        PrivilegeStatus::Missing(Elevation::GrantCapability)
    }
}

#[cfg(not(any(unix, windows)))]
async fn system_check(_core_binary: &Path) -> PrivilegeStatus {
    PrivilegeStatus::Missing(Elevation::RelaunchElevated)
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(unix)]
fn is_setuid_root(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(path).is_ok_and(|meta| meta.uid() == 0 && meta.mode() & 0o4000 != 0)
}

#[cfg(target_os = "linux")]
async fn has_net_admin_capability(path: &Path) -> bool {
    match Command::new("getcap").arg(path).output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains("cap_net_admin"),
        Err(e) => {
            tracing::debug!(error = %e, "getcap unavailable");
            false
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn has_net_admin_capability(_path: &Path) -> bool {
    false
}

/// Grants `core_binary` the privileges TUN needs.
///
/// Prompts for credentials through the desktop's authentication agent.
/// Windows has no per-binary grant; use [`relaunch_elevated`] there.
pub async fn grant_tun_permissions(core_binary: &Path) -> Result<(), PrivilegeError> {
    let Some((program, args)) = grant_command(core_binary) else {
        return Err(PrivilegeError::Unsupported("granting core permissions"));
    };
    tracing::info!(binary = %core_binary.display(), %program, "granting core permissions");

    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| PrivilegeError::CommandFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PrivilegeError::CommandFailed {
            program: program.to_string(),
            reason: format!("{} {}", output.status, stderr.trim()).trim().to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
fn grant_command(core_binary: &Path) -> Option<(&'static str, Vec<String>)> {
    Some((
        "pkexec",
        vec![
            "setcap".to_string(),
            "cap_net_admin,cap_net_bind_service=+eip".to_string(),
            core_binary.display().to_string(),
        ],
    ))
}

#[cfg(target_os = "macos")]
fn grant_command(core_binary: &Path) -> Option<(&'static str, Vec<String>)> {
    let path = shell_quote(&core_binary.display().to_string());
    let shell = format!("chown root:admin {path} && chmod +sx {path}");
    let script = format!(
        "do shell script \"{}\" with administrator privileges",
        shell.replace('\\', "\\\\").replace('"', "\\\"")
    );
    Some(("osascript", vec!["-e".to_string(), script]))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn grant_command(_core_binary: &Path) -> Option<(&'static str, Vec<String>)> {
    None
}

#[cfg(target_os = "macos")]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Starts a new elevated instance of the current executable.
///
/// The caller is expected to exit once this returns `Ok`.
pub async fn relaunch_elevated() -> Result<(), PrivilegeError> {
    relaunch_impl().await
}

#[cfg(windows)]
async fn relaunch_impl() -> Result<(), PrivilegeError> {
    let exe = std::env::current_exe().map_err(|e| PrivilegeError::CommandFailed {
        program: "current_exe".to_string(),
        reason: e.to_string(),
    })?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut script = format!(
        "Start-Process -FilePath '{}' -Verb RunAs",
        exe.display().to_string().replace('\'', "''")
    );
    if !args.is_empty() {
        let quoted: Vec<String> = args
            .iter()
            .map(|a| format!("'{}'", a.replace('\'', "''")))
            .collect();
        script.push_str(&format!(" -ArgumentList {}", quoted.join(",")));
    }
    tracing::info!("relaunching as administrator");

    let status = Command::new("powershell")
        .args(["-NoProfile", "-Command", &script])
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .await
        .map_err(|e| PrivilegeError::CommandFailed {
            program: "powershell".to_string(),
            reason: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(PrivilegeError::CommandFailed {
            program: "powershell".to_string(),
            reason: status.to_string(),
        })
    }
}

#[cfg(not(windows))]
async fn relaunch_impl() -> Result<(), PrivilegeError> {
    Err(PrivilegeError::Unsupported("relaunching as administrator"))
}
