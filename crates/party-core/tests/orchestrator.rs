//! Restart orchestration against a fake control API and a real child process.
#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use party_core::{
    AppSettings, ConfigPatch, ControlApi, ControlError, ControlledConfig, CoreEvent, CoreSelection,
    CoreState, CoreVersion, Elevation, EventBus, Orchestrator, OrchestratorError,
    OrchestratorParts, PrivilegeProbe, PrivilegeStatus, ProxyMode, Supervisor,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use party_updater::{AssetFetcher, DownloadProgress, Installer, InstallerConfig, UpdateError};

const FAKE_CORE: &str = "#!/bin/sh\nexec sleep 30\n";
const NEW_CORE: &str = "#!/bin/sh\n# v1.18.0\nexec sleep 30\n";

/// Control API double that records patches.
#[derive(Default)]
struct FakeControl {
    reject: Option<String>,
    upgrade_error: Option<String>,
    patches: Mutex<Vec<ConfigPatch>>,
}

impl ControlApi for FakeControl {
    async fn patch_config(&self, patch: &ConfigPatch) -> Result<(), ControlError> {
        self.patches.lock().unwrap().push(patch.clone());
        match &self.reject {
            Some(message) => Err(ControlError::Rejected(message.clone())),
            None => Ok(()),
        }
    }

    async fn version(&self) -> Result<CoreVersion, ControlError> {
        Ok(CoreVersion {
            version: "v1.18.0".to_string(),
            meta: true,
        })
    }

    async fn upgrade_core(&self) -> Result<(), ControlError> {
        match &self.upgrade_error {
            Some(body) => Err(ControlError::Unexpected {
                status: 500,
                body: body.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Privilege probe with a fixed answer.
struct FakePrivileges {
    status: PrivilegeStatus,
    calls: AtomicUsize,
}

impl PrivilegeProbe for FakePrivileges {
    async fn check(&self, _core_binary: &Path) -> PrivilegeStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.status
    }
}

/// Liveness of a watched process, sampled when the download starts.
#[derive(Default)]
struct FetchLog {
    watch_pid: Mutex<Option<u32>>,
    alive_at_download: Mutex<Option<bool>>,
}

/// Serves a gzipped fake core, or fails.
struct FakeFetcher {
    payload: Option<Vec<u8>>,
    log: Arc<FetchLog>,
}

impl AssetFetcher for FakeFetcher {
    async fn fetch_to(
        &self,
        _url: &str,
        dest: &Path,
        _progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> party_updater::Result<u64> {
        if let Some(pid) = *self.log.watch_pid.lock().unwrap() {
            let alive = kill(Pid::from_raw(pid as i32), None).is_ok();
            *self.log.alive_at_download.lock().unwrap() = Some(alive);
        }
        let Some(payload) = &self.payload else {
            return Err(UpdateError::DownloadFailed("connection reset".to_string()));
        };
        fs::write(dest, payload)?;
        Ok(payload.len() as u64)
    }
}

type TestOrchestrator = Orchestrator<Arc<FakeControl>, Arc<FakePrivileges>, FakeFetcher>;

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    control: Arc<FakeControl>,
    privileges: Arc<FakePrivileges>,
    fetches: Arc<FetchLog>,
    orchestrator: TestOrchestrator,
}

impl Harness {
    fn core_dir(&self) -> PathBuf {
        self.root.join("data/cores")
    }

    fn work_dir(&self) -> PathBuf {
        self.root.join("data/work")
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }
}

struct Setup {
    control: FakeControl,
    privileges: PrivilegeStatus,
    payload: Option<Vec<u8>>,
    settings: AppSettings,
    binaries: Vec<&'static str>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            control: FakeControl::default(),
            privileges: PrivilegeStatus::Sufficient,
            payload: Some(gzip(FAKE_CORE.as_bytes())),
            settings: AppSettings::default(),
            binaries: vec!["mihomo"],
        }
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn write_core(path: &Path) {
    fs::write(path, FAKE_CORE).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn harness(setup: Setup) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let core_dir = root.join("data/cores");
    fs::create_dir_all(&core_dir).unwrap();
    for name in &setup.binaries {
        write_core(&core_dir.join(name));
    }

    let mut settings = setup.settings;
    settings.paths.data_dir = Some(root.join("data"));

    let control = Arc::new(setup.control);
    let privileges = Arc::new(FakePrivileges {
        status: setup.privileges,
        calls: AtomicUsize::new(0),
    });
    let fetches = Arc::new(FetchLog::default());
    let orchestrator = Orchestrator::new(OrchestratorParts {
        supervisor: Supervisor::new(EventBus::new()),
        control: Arc::clone(&control),
        privileges: Arc::clone(&privileges),
        installer: Installer::new(
            FakeFetcher {
                payload: setup.payload,
                log: Arc::clone(&fetches),
            },
            InstallerConfig::new(&core_dir),
        ),
        settings,
        settings_path: root.join("settings.toml"),
        work_dir: root.join("data/work"),
    });

    Harness {
        _dir: dir,
        root,
        control,
        privileges,
        fetches,
        orchestrator,
    }
}

fn specific_setup(version: &str, payload: &str) -> Setup {
    let mut settings = AppSettings::default();
    settings.core.selection = CoreSelection::specific(version).unwrap();
    settings.core.installed_specific = Some(version.to_string());
    Setup {
        payload: Some(gzip(payload.as_bytes())),
        settings,
        binaries: vec!["mihomo", "mihomo-specific"],
        ..Setup::default()
    }
}

fn no_progress(_: DownloadProgress) {}

#[tokio::test]
async fn test_rejected_patch_leaves_core_running() {
    let core_text = "mode: unknown mode 'rule', expected one of global, rule, direct";
    let h = harness(Setup {
        control: FakeControl {
            reject: Some(core_text.to_string()),
            ..FakeControl::default()
        },
        ..Setup::default()
    });
    let pid = h.orchestrator.start_core().await.unwrap();

    let err = h
        .orchestrator
        .apply_config_and_restart(&ConfigPatch::mode(ProxyMode::Rule))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::ConfigRejected(ref m) if m == core_text));
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);
    assert_eq!(h.orchestrator.supervisor().pid(), pid);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_patch_is_not_persisted() {
    let h = harness(Setup {
        control: FakeControl {
            reject: Some("invalid port".to_string()),
            ..FakeControl::default()
        },
        ..Setup::default()
    });
    h.orchestrator.start_core().await.unwrap();

    let patch = ConfigPatch {
        mixed_port: Some(1),
        ..ConfigPatch::default()
    };
    assert!(h.orchestrator.apply_config_and_restart(&patch).await.is_err());

    let config = ControlledConfig::load(&h.work_dir()).unwrap();
    assert_eq!(config.document()["mixed-port"].as_i64(), Some(7890));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_accepted_patch_persists_and_restarts() {
    let h = harness(Setup::default());
    let mut events = h.orchestrator.events().subscribe();
    let first = h.orchestrator.start_core().await.unwrap();

    h.orchestrator
        .apply_config_and_restart(&ConfigPatch::mode(ProxyMode::Global))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);
    assert_ne!(h.orchestrator.supervisor().pid(), first);
    assert_eq!(
        h.control.patches.lock().unwrap().as_slice(),
        [ConfigPatch::mode(ProxyMode::Global)]
    );
    let config = ControlledConfig::load(&h.work_dir()).unwrap();
    assert_eq!(config.mode(), Some(ProxyMode::Global));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], CoreEvent::Started { .. }));
    assert_eq!(seen[1], CoreEvent::ConfigApplied);
    assert!(matches!(seen[2], CoreEvent::Stopped(_)));
    assert!(matches!(seen[3], CoreEvent::Started { .. }));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_core_launched_with_controlled_config() {
    let h = harness(Setup::default());
    h.orchestrator.start_core().await.unwrap();

    let launch = h.orchestrator.supervisor().last_launch().unwrap();
    let work = h.work_dir();
    assert_eq!(launch.binary, h.core_dir().join("mihomo"));
    assert_eq!(
        launch.args,
        [
            "-d".to_string(),
            work.display().to_string(),
            "-f".to_string(),
            work.join("config.yaml").display().to_string(),
        ]
    );
    let config = ControlledConfig::load(&work).unwrap();
    assert_eq!(config.document()["external-controller"].as_str(), Some("127.0.0.1:9090"));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tun_without_privileges_requires_permission() {
    let h = harness(Setup {
        privileges: PrivilegeStatus::Missing(Elevation::GrantCapability),
        ..Setup::default()
    });
    let pid = h.orchestrator.start_core().await.unwrap();

    let err = h.orchestrator.set_tun(true).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::PermissionRequired {
            remedy: Elevation::GrantCapability
        }
    ));
    assert!(h.control.patches.lock().unwrap().is_empty());
    assert_eq!(h.orchestrator.supervisor().pid(), pid);
    assert!(!ControlledConfig::load(&h.work_dir()).unwrap().tun_enabled());
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabling_tun_skips_privilege_probe() {
    let h = harness(Setup {
        privileges: PrivilegeStatus::Missing(Elevation::RelaunchElevated),
        ..Setup::default()
    });
    h.orchestrator.start_core().await.unwrap();

    h.orchestrator.set_tun(false).await.unwrap();

    assert_eq!(h.privileges.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.control.patches.lock().unwrap().as_slice(),
        [ConfigPatch::tun(false)]
    );
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mode_change_does_not_restart() {
    let h = harness(Setup::default());
    let mut events = h.orchestrator.events().subscribe();
    let pid = h.orchestrator.start_core().await.unwrap();

    h.orchestrator.set_mode(ProxyMode::Direct).await.unwrap();

    assert_eq!(h.orchestrator.supervisor().pid(), pid);
    assert_eq!(h.orchestrator.status().unwrap().mode, Some(ProxyMode::Direct));
    assert!(matches!(events.recv().await.unwrap(), CoreEvent::Started { .. }));
    assert_eq!(
        events.recv().await.unwrap(),
        CoreEvent::ModeChanged(ProxyMode::Direct)
    );
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_patch_while_stopped_is_only_persisted() {
    let h = harness(Setup::default());

    h.orchestrator
        .apply_config_and_restart(&ConfigPatch::mode(ProxyMode::Global))
        .await
        .unwrap();

    assert!(h.control.patches.lock().unwrap().is_empty());
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Stopped);
    assert_eq!(h.orchestrator.status().unwrap().mode, Some(ProxyMode::Global));
}

#[tokio::test]
async fn test_restart_failure_keeps_applied_patch() {
    let h = harness(Setup::default());
    h.orchestrator.start_core().await.unwrap();
    fs::remove_file(h.core_dir().join("mihomo")).unwrap();

    let err = h
        .orchestrator
        .apply_config_and_restart(&ConfigPatch::mode(ProxyMode::Global))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RestartFailed(_)));
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Stopped);
    let config = ControlledConfig::load(&h.work_dir()).unwrap();
    assert_eq!(config.mode(), Some(ProxyMode::Global));
}

#[tokio::test]
async fn test_install_and_switch_runs_new_core() {
    let h = harness(Setup::default());
    h.orchestrator.start_core().await.unwrap();

    let installed = h
        .orchestrator
        .install_and_switch("v1.18.0", &no_progress)
        .await
        .unwrap();

    assert_eq!(installed.path, h.core_dir().join("mihomo-specific"));
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);
    assert_eq!(
        h.orchestrator.supervisor().current_binary(),
        Some(h.core_dir().join("mihomo-specific"))
    );

    let saved = AppSettings::load_from(&h.settings_path()).unwrap();
    assert_eq!(saved.core.selection, CoreSelection::specific("v1.18.0").unwrap());
    assert_eq!(saved.core.installed_specific.as_deref(), Some("v1.18.0"));
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_install_restores_previous_core() {
    let mut settings = AppSettings::default();
    settings.core.selection = CoreSelection::specific("v1.17.0").unwrap();
    settings.core.installed_specific = Some("v1.17.0".to_string());
    let h = harness(Setup {
        payload: None,
        settings,
        binaries: vec!["mihomo", "mihomo-specific"],
        ..Setup::default()
    });
    let before = h.orchestrator.start_core().await.unwrap();

    let err = h
        .orchestrator
        .install_and_switch("v1.18.0", &no_progress)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Install(UpdateError::DownloadFailed(_))
    ));
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);
    assert_ne!(h.orchestrator.supervisor().pid(), before);
    assert_eq!(
        h.orchestrator.settings().core.selection,
        CoreSelection::specific("v1.17.0").unwrap()
    );
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_install_over_running_specific_core_stops_it_first() {
    let h = harness(specific_setup("v1.17.0", NEW_CORE));
    let mut events = h.orchestrator.events().subscribe();
    let old_pid = h.orchestrator.start_core().await.unwrap().unwrap();
    *h.fetches.watch_pid.lock().unwrap() = Some(old_pid);

    h.orchestrator
        .install_and_switch("v1.18.0", &no_progress)
        .await
        .unwrap();

    assert_eq!(*h.fetches.alive_at_download.lock().unwrap(), Some(false));
    let specific = h.core_dir().join("mihomo-specific");
    assert_eq!(fs::read_to_string(&specific).unwrap(), NEW_CORE);
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);
    assert_eq!(h.orchestrator.supervisor().current_binary(), Some(specific));
    assert_ne!(h.orchestrator.supervisor().pid(), Some(old_pid));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let stopped = seen
        .iter()
        .position(|e| matches!(e, CoreEvent::Stopped(r) if r.pid == Some(old_pid)))
        .unwrap();
    let installed = seen
        .iter()
        .position(|e| matches!(e, CoreEvent::CoreInstalled { .. }))
        .unwrap();
    let restarted = seen
        .iter()
        .rposition(|e| matches!(e, CoreEvent::Started { .. }))
        .unwrap();
    assert!(stopped < installed && installed < restarted);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_install_without_switch_keeps_specific_selection_in_step() {
    let h = harness(specific_setup("v1.17.0", NEW_CORE));
    let mut events = h.orchestrator.events().subscribe();
    h.orchestrator.start_core().await.unwrap();

    h.orchestrator
        .install_version("v1.18.0", &no_progress)
        .await
        .unwrap();

    let saved = AppSettings::load_from(&h.settings_path()).unwrap();
    assert_eq!(saved.core.installed_specific.as_deref(), Some("v1.18.0"));
    assert_eq!(saved.core.selection, CoreSelection::specific("v1.18.0").unwrap());
    assert_eq!(h.orchestrator.settings().core.selection, saved.core.selection);
    assert_eq!(h.orchestrator.supervisor().state(), CoreState::Running);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&CoreEvent::SelectionChanged(
        CoreSelection::specific("v1.18.0").unwrap()
    )));

    h.orchestrator
        .switch_core(CoreSelection::specific("v1.18.0").unwrap())
        .await
        .unwrap();
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_install_without_switch_leaves_stable_selection() {
    let h = harness(Setup::default());

    h.orchestrator
        .install_version("v1.18.0", &no_progress)
        .await
        .unwrap();

    let saved = AppSettings::load_from(&h.settings_path()).unwrap();
    assert_eq!(saved.core.selection, CoreSelection::stable());
    assert_eq!(saved.core.installed_specific.as_deref(), Some("v1.18.0"));
}

#[tokio::test]
async fn test_switch_to_uninstalled_version_is_refused() {
    let h = harness(Setup::default());
    let err = h
        .orchestrator
        .switch_core(CoreSelection::specific("v9.9.9").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Selection(_)));
    assert_eq!(h.orchestrator.settings().core.selection, CoreSelection::stable());
}

#[tokio::test]
async fn test_upgrade_reports_already_latest() {
    let h = harness(Setup {
        control: FakeControl {
            upgrade_error: Some("update error: already using latest version v1.19.0".to_string()),
            ..FakeControl::default()
        },
        ..Setup::default()
    });
    let err = h.orchestrator.upgrade_core().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyLatest));
}

#[tokio::test]
async fn test_health_reports_version() {
    let h = harness(Setup::default());
    assert_eq!(h.orchestrator.health().await.unwrap().version, "v1.18.0");
}
