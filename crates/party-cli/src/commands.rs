use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use party_core::{
    AppSettings, CoreKind, CoreSelection, Orchestrator, OrchestratorError, PrivilegeProbe,
    PrivilegeStatus, SystemPrivileges, grant_tun_permissions, relaunch_elevated,
};
use party_updater::platform::{resolve, supported_platforms};
use party_updater::{
    DownloadProgress, GitHubClient, HostPlatform, InstalledBinary, ReleaseSource, RepoId,
    UpdateError, VersionCache, filter_tags, format_bytes,
};

use party_cli::cli::{InstallArgs, PermissionsAction, UseArgs, VersionsArgs};

/// Settings plus where they live.
pub struct AppContext {
    pub settings: AppSettings,
    pub settings_path: PathBuf,
}

impl AppContext {
    pub fn load(settings_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let settings_path = match settings_path {
            Some(path) => path,
            None => AppSettings::default_path().context("locate settings file")?,
        };
        let mut settings = AppSettings::load_from(&settings_path)
            .with_context(|| format!("load settings from {}", settings_path.display()))?;
        if data_dir.is_some() {
            settings.paths.data_dir = data_dir;
        }
        Ok(Self {
            settings,
            settings_path,
        })
    }

    pub fn orchestrator(&self) -> Result<Arc<Orchestrator>> {
        let orchestrator =
            Orchestrator::from_settings(self.settings.clone(), self.settings_path.clone())?;
        Ok(Arc::new(orchestrator))
    }

    pub fn release_source(&self) -> Result<ReleaseSource> {
        let release = &self.settings.release;
        let client = GitHubClient::new(&release.api_base, release.github_token.as_deref())?;
        Ok(ReleaseSource::new(client, Arc::new(VersionCache::new())))
    }
}

pub async fn run_versions(ctx: &AppContext, args: &VersionsArgs) -> Result<()> {
    let source = ctx.release_source()?;
    print_versions(
        &source,
        &ctx.settings.repo(),
        args.refresh,
        args.filter.as_deref(),
        args.limit,
        ctx.settings.core.installed_specific.as_deref(),
    )
    .await
}

/// Lists tags, newest first as published, marking the installed one.
pub async fn print_versions(
    source: &ReleaseSource,
    repo: &RepoId,
    refresh: bool,
    filter: Option<&str>,
    limit: usize,
    installed: Option<&str>,
) -> Result<()> {
    if refresh {
        source.clear_cache(repo);
    }
    let tags = source.list_versions(repo, refresh).await?;
    let shown = filter_tags(&tags, filter.unwrap_or_default());
    if shown.is_empty() {
        println!("No versions match.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![header_cell("Version"), header_cell("Installed")]);
    apply_table_style(&mut table);
    for tag in shown.iter().take(limit) {
        let installed_cell = if installed == Some(tag.name.as_str()) {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("")
        };
        table.add_row(vec![Cell::new(&tag.name), installed_cell]);
    }
    println!("{table}");
    if shown.len() > limit {
        println!("{} more; use --filter or --limit to see them.", shown.len() - limit);
    }
    Ok(())
}

pub async fn run_install(ctx: &AppContext, args: &InstallArgs) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let installed = install(&orchestrator, &args.version, !args.no_switch).await?;
    println!(
        "Installed {} to {} ({})",
        installed.version,
        installed.path.display(),
        format_bytes(installed.archive_bytes)
    );
    if !args.no_switch {
        println!("Selected core: specific {}", installed.version);
    }
    Ok(())
}

/// Installs with a download progress bar.
pub async fn install(
    orchestrator: &Orchestrator,
    version: &str,
    switch: bool,
) -> Result<InstalledBinary, OrchestratorError> {
    let bar = download_bar();
    let report = |progress: DownloadProgress| {
        if let Some(total) = progress.total {
            bar.set_length(total);
        }
        bar.set_position(progress.downloaded);
    };
    let result = if switch {
        orchestrator.install_and_switch(version, &report).await
    } else {
        orchestrator.install_version(version, &report).await
    };
    bar.finish_and_clear();
    result
}

fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{spinner} downloading [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    bar.set_style(style);
    bar
}

/// Builds a selection from a kind name and optional version.
pub fn parse_selection(kind: &str, version: Option<&str>) -> Result<CoreSelection> {
    let kind: CoreKind = kind.parse()?;
    let selection = match (kind, version) {
        (CoreKind::Specific, Some(version)) => CoreSelection::specific(version)?,
        (_, Some(_)) => bail!("--version only applies to the specific core"),
        (kind, None) => CoreSelection::of(kind)?,
    };
    Ok(selection)
}

pub async fn run_use(ctx: &AppContext, args: &UseArgs) -> Result<()> {
    let selection = parse_selection(&args.kind, args.version.as_deref())?;
    let orchestrator = ctx.orchestrator()?;
    orchestrator.switch_core(selection.clone()).await?;
    let core = orchestrator.resolve_core();
    println!("Selected core: {selection} ({})", core.path.display());
    if core.fell_back {
        println!("The binary is missing; the stable core will run instead.");
    }
    Ok(())
}

pub fn run_platform() -> Result<()> {
    let host = HostPlatform::current();
    match resolve(&host) {
        Ok(target) => {
            println!("Host: {host}");
            println!("Asset: {}", target.asset);
            println!("Archive: {}", target.archive_name("<version>"));
            println!("Executable: {}", target.executable_name());
        }
        Err(e) => println!("Host: {host} ({e})"),
    }

    let mut table = Table::new();
    table.set_header(vec![
        header_cell("OS"),
        header_cell("Architecture"),
        header_cell("Asset"),
    ]);
    apply_table_style(&mut table);
    for platform in supported_platforms() {
        let asset = resolve(&platform).map(|t| t.asset).unwrap_or_default();
        let mut os = Cell::new(&platform.os);
        if platform == host {
            os = os.add_attribute(Attribute::Bold).fg(Color::Cyan);
        }
        table.add_row(vec![os, Cell::new(&platform.arch), Cell::new(asset)]);
    }
    println!("{table}");
    Ok(())
}

pub async fn run_permissions(ctx: &AppContext, action: PermissionsAction) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let core = orchestrator.resolve_core();
    match action {
        PermissionsAction::Check => match SystemPrivileges.check(&core.path).await {
            PrivilegeStatus::Sufficient => println!("TUN permissions: granted"),
            PrivilegeStatus::Missing(remedy) => {
                println!("TUN permissions: missing ({remedy})");
                println!("{}", remedy.user_message());
            }
        },
        PermissionsAction::Grant => {
            if HostPlatform::current().is_windows() {
                relaunch_elevated().await?;
                println!("Started an elevated instance.");
            } else {
                grant_tun_permissions(&core.path).await?;
                info!(binary = %core.path.display(), "granted TUN permissions");
                println!("Granted TUN permissions to {}", core.path.display());
            }
        }
    }
    Ok(())
}

pub fn run_cleanup(ctx: &AppContext) -> Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let removed = orchestrator.cleanup_stale();
    println!("Removed {removed} leftover file(s).");
    Ok(())
}

/// The UI-facing message of the first known error in the chain.
pub fn user_message(err: &anyhow::Error) -> Option<&str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<OrchestratorError>() {
            Some(e.user_message())
        } else {
            cause.downcast_ref::<UpdateError>().map(UpdateError::user_message)
        }
    })
}

fn header_cell(text: &str) -> Cell {
    Cell::new(text).add_attribute(Attribute::Bold)
}

fn apply_table_style(table: &mut Table) {
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(100);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("alpha", None).unwrap(), CoreSelection::of(CoreKind::Alpha).unwrap());
        assert_eq!(
            parse_selection("specific", Some("v1.18.0")).unwrap(),
            CoreSelection::specific("v1.18.0").unwrap()
        );
        assert!(parse_selection("specific", None).is_err());
        assert!(parse_selection("stable", Some("v1.18.0")).is_err());
        assert!(parse_selection("beta", None).is_err());
    }

    #[test]
    fn test_user_message_found_through_context() {
        let err = anyhow::Error::new(OrchestratorError::AlreadyLatest).context("upgrade core");
        assert_eq!(user_message(&err), Some("The core is already up to date."));

        let plain = anyhow::anyhow!("something else");
        assert_eq!(user_message(&plain), None);
    }
}
