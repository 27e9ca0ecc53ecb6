use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use appkeep_core::{ErrorKind, InventoryEntry, PackageReference, ProgressEvent};
use serde_json::{json, Value};

use crate::artifact::{ArchiveChain, BundleOrigin, LocatedBundle};
use crate::bundle::{bundle_display_name, is_app_bundle, PLACEHOLDER_VERSION};
use crate::command::{run_command, CommandSpec};
use crate::context::OperationContext;
use crate::download::{download_details, download_package, DownloadedPackage};
use crate::env::OperationEnv;
use crate::error::OperationError;
use crate::fs_utils::{
    copy_dir_recursive, current_unix_timestamp, path_exists, relax_permissions, remove_path,
    run_blocking,
};
use crate::matching::{resolve, verification_matchers};
use crate::outcome::{Degradations, Outcome};
use crate::process::{find_processes, terminate_processes, ProcessQuery};
use crate::progress::{emit, ProgressSink};
use crate::scan::inspect_bundle;

const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/LaunchServices.framework/Support/lsregister";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub identity: String,
    pub reference: PackageReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Queued,
    Downloading,
    PreCleanup,
    Extracting,
    Copying,
    Permissioning,
    Verifying,
    Completed,
}

impl InstallStage {
    /// Percent reported when the stage begins.
    pub fn percent(self) -> u8 {
        match self {
            Self::Queued => 5,
            Self::Downloading => 10,
            Self::PreCleanup => 45,
            Self::Extracting => 50,
            Self::Copying => 70,
            Self::Permissioning => 85,
            Self::Verifying => 90,
            Self::Completed => 100,
        }
    }
}

const DOWNLOAD_RANGE: (u8, u8) = (10, 40);
const BUNDLE_LOCATED_PERCENT: u8 = 60;
const INVENTORY_PERCENT: u8 = 95;

#[derive(Debug, Clone, PartialEq)]
pub struct InstallReport {
    pub entry: InventoryEntry,
    pub bundle_path: PathBuf,
    pub technique: &'static str,
    pub placeholder_reason: Option<String>,
    pub download: DownloadedPackage,
    pub degradations: Degradations,
}

impl InstallReport {
    pub fn is_degraded(&self) -> bool {
        self.placeholder_reason.is_some() || !self.degradations.is_empty()
    }

    pub fn completion_event(&self) -> ProgressEvent {
        let mut details = json!({
            "name": self.entry.name,
            "version": self.entry.version,
            "path": self.entry.path,
            "technique": self.technique,
            "sha256": self.download.sha256,
            "degraded": self.is_degraded(),
        });
        if let Some(reason) = &self.placeholder_reason {
            details["placeholder"] = Value::Bool(true);
            details["reason"] = Value::String(reason.clone());
        }
        if !self.degradations.is_empty() {
            details["notes"] = json!(self.degradations.notes());
        }
        ProgressEvent::Completed {
            message: format!("Installed {}", self.entry.name),
            details: Some(details),
        }
    }
}

/// Logs the transition and reports the stage's percent.
async fn enter_stage(
    sink: &dyn ProgressSink,
    ctx: &OperationContext,
    stage: InstallStage,
    message: impl Into<String>,
) -> Result<(), OperationError> {
    tracing::info!(state = ?stage, "install stage");
    emit(sink, ctx, ProgressEvent::progress(stage.percent(), message)).await
}

/// Drives one install through its stages. Emits only `Progress` events; the
/// caller owns the terminal event.
pub struct Installer<'a> {
    env: &'a OperationEnv,
}

impl<'a> Installer<'a> {
    pub fn new(env: &'a OperationEnv) -> Self {
        Self { env }
    }

    /// Runs every stage. A previous copy is only removed once the new bundle
    /// has been located; if the install fails after that and nothing is left
    /// at the removed copy's path, its inventory entry is dropped so the
    /// record matches the disk.
    pub async fn install(
        &self,
        request: &InstallRequest,
        ctx: &OperationContext,
        sink: &dyn ProgressSink,
    ) -> Result<InstallReport, OperationError> {
        let mut removed = Vec::new();
        let result = self.run_stages(request, ctx, sink, &mut removed).await;
        if result.is_err() {
            self.forget_removed(&request.identity, &removed).await;
        }
        result
    }

    async fn forget_removed(&self, identity: &str, removed: &[PathBuf]) {
        for path in removed.iter().filter(|path| !path_exists(path)) {
            match self.env.reconciler.forget_path(identity, path).await {
                Ok(forgotten) => tracing::debug!(
                    identity,
                    path = %path.display(),
                    forgotten,
                    "dropped inventory entry of removed copy"
                ),
                Err(err) => tracing::warn!(
                    identity,
                    path = %path.display(),
                    error = %err,
                    "failed to drop inventory entry of removed copy"
                ),
            }
        }
    }

    async fn run_stages(
        &self,
        request: &InstallRequest,
        ctx: &OperationContext,
        sink: &dyn ProgressSink,
        removed: &mut Vec<PathBuf>,
    ) -> Result<InstallReport, OperationError> {
        let reference = &request.reference;
        let apps_dir = &self.env.settings.applications_dir;
        let mut degradations = Degradations::default();

        enter_stage(
            sink,
            ctx,
            InstallStage::Queued,
            format!("Preparing to install {}", reference.display_name),
        )
        .await?;
        self.env
            .layout
            .ensure_base_dirs()
            .map_err(|err| OperationError::from_anyhow(ErrorKind::Unknown, &err))?;

        enter_stage(
            sink,
            ctx,
            InstallStage::Downloading,
            format!("Downloading {}", reference.display_name),
        )
        .await?;
        let download = download_package(
            self.env.packages.as_ref(),
            reference,
            &self.env.layout,
            ctx,
            sink,
            DOWNLOAD_RANGE,
        )
        .await?;
        emit(
            sink,
            ctx,
            ProgressEvent::progress_with(
                DOWNLOAD_RANGE.1,
                "Download complete",
                download_details(&download),
            ),
        )
        .await?;

        let work_dir = self
            .env
            .layout
            .make_work_dir("install")
            .map_err(|err| OperationError::from_anyhow(ErrorKind::Unknown, &err))?;

        enter_stage(sink, ctx, InstallStage::PreCleanup, "Stopping previous installation").await?;
        let expected = apps_dir.join(format!("{}.app", reference.search_name));
        self.stop_existing(&expected, ctx, &mut degradations).await?;

        enter_stage(sink, ctx, InstallStage::Extracting, "Extracting package").await?;
        let located = ArchiveChain::for_kind(reference.archive_kind)
            .locate(
                &download.path,
                work_dir.path(),
                &reference.search_name,
                self.env.settings.placeholder_fallback,
                &self.env.extraction_env(ctx),
            )
            .await?;
        for note in &located.notes {
            degradations.push(note.clone());
        }
        emit(
            sink,
            ctx,
            ProgressEvent::progress_with(
                BUNDLE_LOCATED_PERCENT,
                format!("Found {}", bundle_display_name(&located.path)),
                located_details(&located),
            ),
        )
        .await?;

        let bundle_name = located
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| format!("{}.app", reference.search_name).into());
        let destination = apps_dir.join(bundle_name);
        if destination != expected {
            self.stop_existing(&destination, ctx, &mut degradations).await?;
        }
        ctx.check()?;
        for previous in [&expected, &destination] {
            if remove_existing(previous)? {
                removed.push(previous.clone());
            }
        }

        enter_stage(
            sink,
            ctx,
            InstallStage::Copying,
            format!("Copying to {}", apps_dir.display()),
        )
        .await?;
        self.deploy(&located.path, &destination, ctx).await?;

        enter_stage(sink, ctx, InstallStage::Permissioning, "Setting permissions").await?;
        let relax_target = destination.clone();
        let relaxed = run_blocking(ctx, ErrorKind::PermissionDenied, move || {
            relax_permissions(&relax_target)
        })
        .await;
        if let Err(err) = &relaxed {
            if ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }
            degradations.record(Outcome::Degraded(format!("relax permissions: {err}")));
        }
        degradations.record(self.clear_quarantine(&destination, ctx).await);
        degradations.record(self.refresh_icon_cache(&destination, ctx).await);

        enter_stage(sink, ctx, InstallStage::Verifying, "Verifying installation").await?;
        let installed = verify_deployment(&destination, apps_dir, &reference.search_name)
            .ok_or_else(|| {
                OperationError::new(
                    ErrorKind::FileNotFound,
                    format!("{} is not present after deployment", destination.display()),
                )
            })?;

        let info = inspect_bundle(
            self.env.runner.as_ref(),
            &installed,
            self.env.run_options().without_retries(),
            ctx,
        )
        .await;
        let now = current_unix_timestamp()
            .map_err(|err| OperationError::from_anyhow(ErrorKind::Unknown, &err))?;
        let entry = InventoryEntry {
            name: bundle_display_name(&installed),
            version: info
                .version()
                .filter(|version| *version != PLACEHOLDER_VERSION)
                .map(str::to_string)
                .or_else(|| reference.version_hint.clone())
                .unwrap_or_else(|| PLACEHOLDER_VERSION.to_string()),
            path: installed.display().to_string(),
            bundle_id: info.bundle_id.clone(),
            is_system_app: false,
            installed_at_unix: now,
            last_checked_at_unix: now,
        };

        emit(
            sink,
            ctx,
            ProgressEvent::progress(INVENTORY_PERCENT, "Updating inventory"),
        )
        .await?;
        self.env
            .reconciler
            .record_install(&request.identity, entry.clone())
            .await?;

        tracing::info!(
            identity = %request.identity,
            name = %entry.name,
            path = %entry.path,
            degraded = !degradations.is_empty(),
            "install finished"
        );
        let placeholder_reason = match located.origin {
            BundleOrigin::Placeholder { reason } => Some(reason),
            BundleOrigin::Extracted => None,
        };
        Ok(InstallReport {
            entry,
            bundle_path: installed,
            technique: located.technique,
            placeholder_reason,
            download,
            degradations,
        })
    }

    /// Stops processes running from an existing copy at `path`. A copy that
    /// will not stop is noted and the install proceeds.
    async fn stop_existing(
        &self,
        path: &Path,
        ctx: &OperationContext,
        degradations: &mut Degradations,
    ) -> Result<(), OperationError> {
        if !path_exists(path) {
            return Ok(());
        }
        let info = inspect_bundle(
            self.env.runner.as_ref(),
            path,
            self.env.run_options().without_retries(),
            ctx,
        )
        .await;
        let name = bundle_display_name(path);
        let query = ProcessQuery {
            name: name.clone(),
            bundle_id: info.bundle_id,
        };
        let stopped = match find_processes(self.env.processes.as_ref(), &query, ctx).await {
            Ok(processes) => {
                terminate_processes(
                    self.env.processes.as_ref(),
                    &processes,
                    Some(&name),
                    self.env.settings.termination_policy(),
                    ctx,
                )
                .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = stopped {
            ctx.check()?;
            degradations.record(Outcome::Degraded(format!("stop running copy: {err}")));
        }
        Ok(())
    }

    async fn deploy(
        &self,
        source: &Path,
        destination: &Path,
        ctx: &OperationContext,
    ) -> Result<(), OperationError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                OperationError::from_io(&format!("failed to create {}", parent.display()), &err)
            })?;
        }
        let copy_source = source.to_path_buf();
        let copy_destination = destination.to_path_buf();
        let copy_ctx = ctx.clone();
        let copied = run_blocking(ctx, ErrorKind::Unknown, move || {
            copy_dir_recursive(&copy_source, &copy_destination, &copy_ctx)
        })
        .await;
        if let Err(err) = copied {
            if let Err(cleanup) = remove_path(destination) {
                tracing::warn!(
                    path = %destination.display(),
                    error = %cleanup,
                    "failed to remove partial copy"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn clear_quarantine(&self, bundle: &Path, ctx: &OperationContext) -> Outcome {
        if !cfg!(target_os = "macos") {
            return Outcome::Ok;
        }
        let spec = CommandSpec::new("xattr")
            .args(["-dr", "com.apple.quarantine"])
            .arg(bundle);
        let result = run_command(
            self.env.runner.as_ref(),
            &spec,
            self.env.run_options().without_retries(),
            ctx,
        )
        .await
        .map(|_| ());
        Outcome::from_result("clear quarantine", result)
    }

    /// Bumps the bundle's modification time and, on macOS, re-registers it
    /// with Launch Services so Finder picks up the new icon.
    async fn refresh_icon_cache(&self, bundle: &Path, ctx: &OperationContext) -> Outcome {
        let touched = fs::File::open(bundle).and_then(|dir| dir.set_modified(SystemTime::now()));
        let touch = Outcome::from_result("touch bundle", touched);
        if !cfg!(target_os = "macos") {
            return touch;
        }
        let spec = CommandSpec::new(LSREGISTER).arg("-f").arg(bundle);
        let result = run_command(
            self.env.runner.as_ref(),
            &spec,
            self.env.run_options().without_retries(),
            ctx,
        )
        .await
        .map(|_| ());
        match Outcome::from_result("refresh icon cache", result) {
            Outcome::Ok => touch,
            degraded => degraded,
        }
    }
}

/// Removes a previous copy at `path`. Returns whether anything was there.
fn remove_existing(path: &Path) -> Result<bool, OperationError> {
    if !path_exists(path) {
        return Ok(false);
    }
    remove_path(path).map_err(|err| {
        OperationError::from_io(&format!("failed to remove {}", path.display()), &err)
    })?;
    tracing::debug!(path = %path.display(), "removed previous installation");
    Ok(true)
}

fn located_details(located: &LocatedBundle) -> Value {
    let mut details = json!({
        "bundle": bundle_display_name(&located.path),
        "technique": located.technique,
        "degraded": located.is_placeholder(),
    });
    if let Some(depth) = located.depth {
        details["search"] = json!(depth);
    }
    if let BundleOrigin::Placeholder { reason } = &located.origin {
        details["placeholder"] = Value::Bool(true);
        details["reason"] = Value::String(reason.clone());
    }
    details
}

/// Confirms the deployed bundle exists, falling back to a fuzzy match over
/// the applications directory when the exact path is missing.
pub fn verify_deployment(expected: &Path, apps_dir: &Path, search_name: &str) -> Option<PathBuf> {
    if is_app_bundle(expected) {
        return Some(expected.to_path_buf());
    }
    let mut bundles: Vec<PathBuf> = fs::read_dir(apps_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_app_bundle(path))
        .collect();
    bundles.sort();
    let names: Vec<String> = bundles.iter().map(|path| bundle_display_name(path)).collect();
    let resolution = resolve(search_name, &names, &verification_matchers())?;
    bundles.into_iter().nth(resolution.index)
}
