use std::fs;
use std::path::{Path, PathBuf};

use appkeep_core::{name_key, ErrorKind, PackageReference, ProgressEvent};
use serde::Serialize;
use serde_json::json;

use crate::context::OperationContext;
use crate::env::OperationEnv;
use crate::error::OperationError;
use crate::fs_utils::{path_exists, remove_path};
use crate::matching::{resolve, uninstall_matchers, MatchStrategy};
use crate::outcome::Outcome;
use crate::process::{find_processes, terminate_processes, ProcessQuery};
use crate::progress::{emit, ProgressSink};
use crate::scan::ScannedApplication;

/// Per-user locations that hold an application's preferences, caches and
/// saved state, relative to the home directory.
pub const AUXILIARY_DIRS: &[&str] = &[
    "Library/Preferences",
    "Library/Application Support",
    "Library/Caches",
    "Library/Saved Application State",
    "Library/Logs",
    "Library/HTTPStorages",
    "Library/WebKit",
    "Library/Containers",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    /// May only remove applications outside the system directories.
    Standard,
    Elevated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallRequest {
    pub identity: String,
    pub target: String,
    pub privilege: Privilege,
}

impl UninstallRequest {
    /// Name to look for: a package key is reduced to its search name, a
    /// bundle name loses its `.app` suffix.
    pub fn target_name(&self) -> String {
        let trimmed = self.target.trim();
        if let Ok(reference) = PackageReference::parse(trimmed) {
            return reference.search_name;
        }
        let trimmed = trimmed.trim_end_matches('/');
        let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
        match base.len().checked_sub(4) {
            Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".app") => {
                base[..cut].to_string()
            }
            _ => base.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStage {
    Queued,
    Locating,
    StoppingProcesses,
    Removing,
    CleaningAuxiliaryData,
    Verifying,
    Completed,
}

impl UninstallStage {
    pub fn percent(self) -> u8 {
        match self {
            Self::Queued => 5,
            Self::Locating => 15,
            Self::StoppingProcesses => 35,
            Self::Removing => 55,
            Self::CleaningAuxiliaryData => 75,
            Self::Verifying => 90,
            Self::Completed => 100,
        }
    }
}

const LOCATED_PERCENT: u8 = 25;
const INVENTORY_PERCENT: u8 = 95;

#[derive(Debug, Clone, PartialEq)]
pub struct UninstallReport {
    pub name: String,
    pub path: PathBuf,
    pub strategy: MatchStrategy,
    pub confidence: f32,
    pub removed_entries: usize,
    pub auxiliary_removed: Vec<PathBuf>,
    pub auxiliary: Outcome,
}

impl UninstallReport {
    pub fn completion_event(&self) -> ProgressEvent {
        let mut details = json!({
            "name": self.name,
            "path": self.path.display().to_string(),
            "strategy": self.strategy,
            "confidence": self.confidence,
            "removed_entries": self.removed_entries,
            "auxiliary_removed": self.auxiliary_removed.len(),
            "degraded": self.auxiliary.is_degraded(),
        });
        if let Some(note) = self.auxiliary.note() {
            details["notes"] = json!([note]);
        }
        ProgressEvent::Completed {
            message: format!("Uninstalled {}", self.name),
            details: Some(details),
        }
    }
}

/// Logs the transition and reports the stage's percent.
async fn enter_stage(
    sink: &dyn ProgressSink,
    ctx: &OperationContext,
    stage: UninstallStage,
    message: impl Into<String>,
) -> Result<(), OperationError> {
    tracing::info!(state = ?stage, "uninstall stage");
    emit(sink, ctx, ProgressEvent::progress(stage.percent(), message)).await
}

pub struct Uninstaller<'a> {
    env: &'a OperationEnv,
}

impl<'a> Uninstaller<'a> {
    pub fn new(env: &'a OperationEnv) -> Self {
        Self { env }
    }

    pub async fn uninstall(
        &self,
        request: &UninstallRequest,
        ctx: &OperationContext,
        sink: &dyn ProgressSink,
    ) -> Result<UninstallReport, OperationError> {
        let wanted = request.target_name();
        enter_stage(
            sink,
            ctx,
            UninstallStage::Queued,
            format!("Preparing to uninstall {wanted}"),
        )
        .await?;

        enter_stage(sink, ctx, UninstallStage::Locating, "Locating application").await?;
        let (app, strategy) = self.locate(&wanted, ctx).await?;
        emit(
            sink,
            ctx,
            ProgressEvent::progress_with(
                LOCATED_PERCENT,
                format!("Found {}", app.name),
                json!({
                    "path": app.path.display().to_string(),
                    "strategy": strategy,
                    "confidence": strategy.confidence(),
                }),
            ),
        )
        .await?;

        if app.is_system_app && request.privilege == Privilege::Standard {
            return Err(OperationError::new(
                ErrorKind::PermissionDenied,
                format!("{} is a system application", app.name),
            ));
        }

        enter_stage(
            sink,
            ctx,
            UninstallStage::StoppingProcesses,
            format!("Stopping {}", app.name),
        )
        .await?;
        let query = ProcessQuery {
            name: app.name.clone(),
            bundle_id: app.bundle_id.clone(),
        };
        let running = find_processes(self.env.processes.as_ref(), &query, ctx).await?;
        terminate_processes(
            self.env.processes.as_ref(),
            &running,
            Some(&app.name),
            self.env.settings.termination_policy(),
            ctx,
        )
        .await?;

        enter_stage(
            sink,
            ctx,
            UninstallStage::Removing,
            format!("Removing {}", app.path.display()),
        )
        .await?;
        remove_path(&app.path).map_err(|err| {
            OperationError::from_io(&format!("failed to remove {}", app.path.display()), &err)
        })?;

        enter_stage(
            sink,
            ctx,
            UninstallStage::CleaningAuxiliaryData,
            "Removing preferences and caches",
        )
        .await?;
        let (auxiliary_removed, auxiliary) = match &self.env.settings.home_dir {
            Some(home) => cleanup_auxiliary_data(home, &app.name, app.bundle_id.as_deref()),
            None => (
                Vec::new(),
                Outcome::Degraded("auxiliary cleanup: home directory unknown".to_string()),
            ),
        };

        enter_stage(sink, ctx, UninstallStage::Verifying, "Verifying removal").await?;
        if path_exists(&app.path) {
            return Err(OperationError::new(
                ErrorKind::Unknown,
                format!("{} is still present after removal", app.path.display()),
            ));
        }

        emit(
            sink,
            ctx,
            ProgressEvent::progress(INVENTORY_PERCENT, "Updating inventory"),
        )
        .await?;
        let removed_entries = self
            .env
            .reconciler
            .record_uninstall(&request.identity, &app.name, &app.path)
            .await?;

        tracing::info!(
            identity = %request.identity,
            name = %app.name,
            strategy = strategy.as_str(),
            removed_entries,
            "uninstall finished"
        );
        Ok(UninstallReport {
            name: app.name,
            path: app.path,
            strategy,
            confidence: strategy.confidence(),
            removed_entries,
            auxiliary_removed,
            auxiliary,
        })
    }

    /// Resolves `wanted` against a fresh scan of the installed applications.
    async fn locate(
        &self,
        wanted: &str,
        ctx: &OperationContext,
    ) -> Result<(ScannedApplication, MatchStrategy), OperationError> {
        let apps = self
            .env
            .scanner()
            .scan_async(Some(self.env.runner.as_ref()), self.env.run_options(), ctx)
            .await?;
        let names: Vec<&str> = apps.iter().map(|app| app.name.as_str()).collect();
        let Some(resolution) = resolve(wanted, &names, &uninstall_matchers()) else {
            return Err(OperationError::new(
                ErrorKind::NotFound,
                format!("no installed application matches '{wanted}'"),
            ));
        };
        let app = apps
            .into_iter()
            .nth(resolution.index)
            .ok_or_else(|| OperationError::new(ErrorKind::Unknown, "match index out of range"))?;
        tracing::debug!(
            wanted,
            name = %app.name,
            strategy = resolution.strategy.as_str(),
            version = %app.version,
            "resolved application"
        );
        Ok((app, resolution.strategy))
    }
}

/// True when a file or directory in an auxiliary location belongs to the
/// application: its name starts with the bundle identifier, or its
/// alphanumeric key equals the application's.
pub fn is_auxiliary_match(file_name: &str, app_name: &str, bundle_id: Option<&str>) -> bool {
    let lowered = file_name.to_ascii_lowercase();
    if let Some(id) = bundle_id.filter(|id| !id.is_empty()) {
        let id = id.to_ascii_lowercase();
        if lowered == id || lowered.starts_with(&format!("{id}.")) {
            return true;
        }
    }
    let stem = file_name
        .strip_suffix(".savedState")
        .or_else(|| file_name.strip_suffix(".plist"))
        .unwrap_or(file_name);
    let app_key = name_key(app_name);
    !app_key.is_empty() && name_key(stem) == app_key
}

/// Removes the application's entries from the auxiliary locations under
/// `home`. Individual failures degrade the outcome without stopping.
pub fn cleanup_auxiliary_data(
    home: &Path,
    app_name: &str,
    bundle_id: Option<&str>,
) -> (Vec<PathBuf>, Outcome) {
    let mut removed = Vec::new();
    let mut failures = Vec::new();
    for relative in AUXILIARY_DIRS {
        let dir = home.join(relative);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let file_name = entry.file_name();
            if !is_auxiliary_match(&file_name.to_string_lossy(), app_name, bundle_id) {
                continue;
            }
            let path = entry.path();
            match remove_path(&path) {
                Ok(()) => removed.push(path),
                Err(err) => failures.push(format!("{}: {err}", path.display())),
            }
        }
    }
    removed.sort();
    let outcome = if failures.is_empty() {
        Outcome::Ok
    } else {
        Outcome::from_result(
            "auxiliary cleanup",
            Err::<(), _>(failures.join("; ")),
        )
    };
    (removed, outcome)
}
