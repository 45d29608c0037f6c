//! Restart Orchestrator.
//!
//! Turns user intents (change mode, toggle TUN, switch or install a core)
//! into control API patches, persisted configuration and supervised
//! restarts. Operations are serialized; a second intent waits for the
//! first to finish.
//!
//! A patch accepted by the core is persisted before the restart. When the
//! restart then fails, [`OrchestratorError::RestartFailed`] is returned and
//! nothing is rolled back: the saved configuration and the running process
//! may disagree until the caller restarts the core.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use party_updater::{
    AssetFetcher, DownloadProgress, HttpDownloader, InstalledBinary, Installer, InstallerConfig,
};
use serde::Serialize;

use crate::control::{
    ConfigPatch, ControlApi, CoreVersion, HttpControlClient, ProxyMode, is_already_latest,
};
use crate::error::{OrchestratorError, SettingsError};
use crate::events::{CoreEvent, EventBus};
use crate::privilege::{PrivilegeProbe, PrivilegeStatus, SystemPrivileges};
use crate::profile::{CONTROLLED_CONFIG_FILE, ControlledConfig};
use crate::selection::{CoreKind, CoreSelection, ResolvedCore, resolve_binary};
use crate::settings::AppSettings;
use crate::supervisor::{CoreState, LaunchSpec, Supervisor};

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

const HEALTH_ATTEMPTS: u32 = 3;
const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Collaborators an [`Orchestrator`] is assembled from.
pub struct OrchestratorParts<C, P, A> {
    /// Process supervisor.
    pub supervisor: Supervisor,
    /// Control API client.
    pub control: C,
    /// Privilege probe.
    pub privileges: P,
    /// Installer for the specific-version slot.
    pub installer: Installer<A>,
    /// Settings as loaded.
    pub settings: AppSettings,
    /// Where settings are saved.
    pub settings_path: PathBuf,
    /// Working directory of the core.
    pub work_dir: PathBuf,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreStatus {
    /// Process state.
    pub state: CoreState,
    /// Process id.
    pub pid: Option<u32>,
    /// Selected core.
    pub selection: String,
    /// Persisted proxy mode.
    pub mode: Option<ProxyMode>,
    /// Persisted TUN switch.
    pub tun: bool,
}

/// Coordinates configuration changes with core restarts.
pub struct Orchestrator<C = HttpControlClient, P = SystemPrivileges, A = HttpDownloader> {
    supervisor: Supervisor,
    control: C,
    privileges: P,
    installer: Installer<A>,
    settings: Mutex<AppSettings>,
    settings_path: PathBuf,
    work_dir: PathBuf,
    op_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Builds the production stack from settings.
    pub fn from_settings(settings: AppSettings, settings_path: PathBuf) -> Result<Self> {
        let core_dir = settings.core_dir()?;
        let work_dir = settings.work_dir()?;

        let mut installer_config = InstallerConfig::new(core_dir);
        installer_config.repo = settings.repo();
        installer_config.download_base = settings.release.download_base.clone();

        let control = HttpControlClient::new(
            &settings.controller.address,
            settings.controller.secret.as_deref(),
        )?;

        Ok(Self::new(OrchestratorParts {
            supervisor: Supervisor::new(EventBus::new()),
            control,
            privileges: SystemPrivileges,
            installer: Installer::with_http(installer_config)?,
            settings,
            settings_path,
            work_dir,
        }))
    }
}

impl<C: ControlApi, P: PrivilegeProbe, A: AssetFetcher> Orchestrator<C, P, A> {
    /// Assembles an orchestrator.
    pub fn new(parts: OrchestratorParts<C, P, A>) -> Self {
        Self {
            supervisor: parts.supervisor,
            control: parts.control,
            privileges: parts.privileges,
            installer: parts.installer,
            settings: Mutex::new(parts.settings),
            settings_path: parts.settings_path,
            work_dir: parts.work_dir,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        self.supervisor.events()
    }

    /// The installer.
    #[must_use]
    pub fn installer(&self) -> &Installer<A> {
        &self.installer
    }

    /// A copy of the current settings.
    #[must_use]
    pub fn settings(&self) -> AppSettings {
        self.lock_settings().clone()
    }

    fn lock_settings(&self) -> MutexGuard<'_, AppSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to the settings and saves them.
    fn update_settings(
        &self,
        change: impl FnOnce(&mut AppSettings),
    ) -> std::result::Result<(), SettingsError> {
        let mut settings = self.lock_settings();
        let mut updated = settings.clone();
        change(&mut updated);
        updated.save_to(&self.settings_path)?;
        *settings = updated;
        Ok(())
    }

    /// Current status.
    pub fn status(&self) -> Result<CoreStatus> {
        let config = ControlledConfig::load(&self.work_dir)?;
        Ok(CoreStatus {
            state: self.supervisor.state(),
            pid: self.supervisor.pid(),
            selection: self.lock_settings().core.selection.to_string(),
            mode: config.mode(),
            tun: config.tun_enabled(),
        })
    }

    /// The binary the current selection launches.
    #[must_use]
    pub fn resolve_core(&self) -> ResolvedCore {
        let selection = self.lock_settings().core.selection.clone();
        resolve_binary(
            &selection,
            &self.installer.config().core_dir,
            self.installer.config().platform.exe_suffix(),
        )
    }

    /// Removes files left behind by abandoned installs.
    pub fn cleanup_stale(&self) -> usize {
        self.installer.cleanup_stale()
    }

    /// Writes the controlled config and builds the launch for the current selection.
    fn prepare_launch(&self) -> std::result::Result<LaunchSpec, SettingsError> {
        let settings = self.settings();
        let mut config = ControlledConfig::load(&self.work_dir)?;
        config.set_controller(
            &settings.controller.address,
            settings.controller.secret.as_deref(),
        );
        config.apply(&ConfigPatch {
            log_level: Some(settings.core.log_level.clone()),
            ..ConfigPatch::default()
        })?;
        config.save()?;

        let core = self.resolve_core();
        Ok(LaunchSpec::for_core(
            core.path,
            &self.work_dir,
            &self.work_dir.join(CONTROLLED_CONFIG_FILE),
        )
        .with_priority(settings.core.priority))
    }

    /// Starts the selected core.
    pub async fn start_core(&self) -> Result<Option<u32>> {
        let _op = self.op_lock.lock().await;
        let spec = self.prepare_launch()?;

        if ControlledConfig::load(&self.work_dir)?.tun_enabled()
            && let PrivilegeStatus::Missing(remedy) = self.privileges.check(&spec.binary).await
        {
            tracing::warn!(%remedy, "TUN is enabled but the core lacks the privileges for it");
        }

        let pid = self
            .supervisor
            .start(spec)
            .await
            .map_err(OrchestratorError::Supervisor)?;
        self.health_check().await;
        Ok(pid)
    }

    /// Applies `patch` to the running core, persists it and restarts.
    ///
    /// A patch the core rejects surfaces as [`OrchestratorError::ConfigRejected`]
    /// with the core's text, and the running process is left alone. When
    /// the core is not running the patch is only persisted.
    pub async fn apply_config_and_restart(&self, patch: &ConfigPatch) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.apply_and_restart_locked(patch).await
    }

    async fn apply_and_restart_locked(&self, patch: &ConfigPatch) -> Result<()> {
        self.ensure_privileges(patch).await?;

        let running = self.supervisor.state() == CoreState::Running;
        if running {
            self.control.patch_config(patch).await?;
        }
        self.persist_patch(patch)?;
        self.events().emit(CoreEvent::ConfigApplied);
        tracing::info!(?patch, running, "configuration applied");

        if running {
            self.restart_locked().await?;
        }
        Ok(())
    }

    async fn ensure_privileges(&self, patch: &ConfigPatch) -> Result<()> {
        if !patch.requires_privilege() {
            return Ok(());
        }
        let core = self.resolve_core();
        match self.privileges.check(&core.path).await {
            PrivilegeStatus::Sufficient => Ok(()),
            PrivilegeStatus::Missing(remedy) => {
                tracing::warn!(%remedy, binary = %core.path.display(), "missing privileges");
                Err(OrchestratorError::PermissionRequired { remedy })
            }
        }
    }

    fn persist_patch(&self, patch: &ConfigPatch) -> std::result::Result<(), SettingsError> {
        let mut config = ControlledConfig::load(&self.work_dir)?;
        config.apply(patch)?;
        config.save()
    }

    async fn restart_locked(&self) -> Result<()> {
        let spec = self.prepare_launch()?;
        self.supervisor
            .restart_with(spec)
            .await
            .map_err(OrchestratorError::RestartFailed)?;
        self.health_check().await;
        Ok(())
    }

    /// Restarts the core with the current selection and config.
    pub async fn restart_core(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.restart_locked().await
    }

    /// Turns TUN on or off and restarts.
    pub async fn set_tun(&self, enable: bool) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.apply_and_restart_locked(&ConfigPatch::tun(enable)).await?;
        self.events().emit(CoreEvent::TunChanged(enable));
        Ok(())
    }

    /// Switches the proxy mode without restarting.
    pub async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let patch = ConfigPatch::mode(mode);
        if self.supervisor.state() == CoreState::Running {
            self.control.patch_config(&patch).await?;
        }
        self.persist_patch(&patch)?;
        self.events().emit(CoreEvent::ModeChanged(mode));
        tracing::info!(%mode, "proxy mode changed");
        Ok(())
    }

    /// Selects another core and restarts onto it if one is running.
    pub async fn switch_core(&self, selection: CoreSelection) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let installed = self.lock_settings().core.installed_specific.clone();
        selection.validate(installed.as_deref())?;

        self.update_settings(|s| s.core.selection = selection.clone())?;
        tracing::info!(%selection, "core selection changed");
        self.events().emit(CoreEvent::SelectionChanged(selection));

        if self.supervisor.state().is_live() {
            self.restart_locked().await?;
        }
        Ok(())
    }

    /// Installs `version` into the specific slot without switching to it.
    ///
    /// A selection of another kind is left alone. A specific selection
    /// follows the slot to the new version, since the slot holds one binary.
    /// A running core that had to be stopped for the install is started again.
    pub async fn install_version(
        &self,
        version: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<InstalledBinary> {
        let _op = self.op_lock.lock().await;
        let was_running = self.supervisor.state() == CoreState::Running;
        let installed = self.install_locked(version, progress, was_running).await?;
        self.follow_specific_slot(version)?;
        if was_running && !self.supervisor.state().is_live() {
            self.restart_locked().await?;
        }
        Ok(installed)
    }

    /// Installs `version`, selects it and restarts onto it.
    ///
    /// If the install fails after the running core was stopped, the
    /// previously selected core is started again and the install error is
    /// still returned.
    pub async fn install_and_switch(
        &self,
        version: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<InstalledBinary> {
        let _op = self.op_lock.lock().await;
        let was_running = self.supervisor.state() == CoreState::Running;
        let installed = self.install_locked(version, progress, was_running).await?;

        let selection = CoreSelection::specific(version)?;
        self.update_settings(|s| s.core.selection = selection.clone())?;
        self.events().emit(CoreEvent::SelectionChanged(selection));

        if was_running {
            self.restart_locked().await?;
        }
        Ok(installed)
    }

    fn follow_specific_slot(&self, version: &str) -> Result<()> {
        let current = self.lock_settings().core.selection.clone();
        if current.kind != CoreKind::Specific
            || current.specific_version.as_deref() == Some(version)
        {
            return Ok(());
        }
        let selection = CoreSelection::specific(version)?;
        self.update_settings(|s| s.core.selection = selection.clone())?;
        tracing::info!(
            %selection,
            previous = %current,
            "specific selection follows the installed version"
        );
        self.events().emit(CoreEvent::SelectionChanged(selection));
        Ok(())
    }

    async fn install_locked(
        &self,
        version: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
        was_running: bool,
    ) -> Result<InstalledBinary> {
        match self
            .installer
            .install(version, &self.supervisor, progress)
            .await
        {
            Ok(installed) => {
                self.update_settings(|s| s.core.installed_specific = Some(version.to_string()))?;
                self.events().emit(CoreEvent::CoreInstalled {
                    version: version.to_string(),
                });
                Ok(installed)
            }
            Err(e) => {
                if was_running && !self.supervisor.state().is_live() {
                    tracing::warn!(
                        error = %e,
                        "install failed after stopping the core, restoring it"
                    );
                    if let Err(restore) = self.restart_locked().await {
                        tracing::error!(error = %restore, "failed to restore the previous core");
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Asks the running core to upgrade itself.
    pub async fn upgrade_core(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        match self.control.upgrade_core().await {
            Ok(()) => {
                tracing::info!("core upgraded itself");
                if !self.installer.config().platform.is_windows() {
                    tracing::warn!(
                        "the upgraded core binary may need TUN permissions granted again"
                    );
                }
                Ok(())
            }
            Err(e) if is_already_latest(&e) => Err(OrchestratorError::AlreadyLatest),
            Err(e) => Err(OrchestratorError::Control(e)),
        }
    }

    /// Queries the running core's version.
    pub async fn health(&self) -> Result<CoreVersion> {
        self.control
            .version()
            .await
            .map_err(OrchestratorError::Control)
    }

    /// Logs the core version after a (re)start. Failure is only logged.
    async fn health_check(&self) {
        for attempt in 1..=HEALTH_ATTEMPTS {
            match self.health().await {
                Ok(version) => {
                    tracing::info!(version = %version.version, "core is healthy");
                    return;
                }
                Err(e) if attempt == HEALTH_ATTEMPTS => {
                    tracing::warn!(error = %e, "core health check failed");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "core not answering yet");
                    tokio::time::sleep(HEALTH_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Stops the core before the application exits.
    pub async fn shutdown(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.supervisor
            .stop(false)
            .await
            .map_err(OrchestratorError::Supervisor)?;
        tracing::info!("core shut down");
        Ok(())
    }

    /// Working directory of the core.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
