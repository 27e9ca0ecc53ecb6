use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use appkeep_core::{normalize_name, ErrorKind, InventoryEntry};
use serde::Serialize;

use crate::bundle::{
    bundle_display_name, info_plist_path, is_app_bundle, parse_info_plist, read_bundle_info,
    BundleInfo, PLACEHOLDER_VERSION,
};
use crate::command::{run_command, CommandRunner, CommandSpec, RunOptions};
use crate::context::OperationContext;
use crate::error::OperationError;
use crate::fs_utils::{current_unix_timestamp, run_blocking};
use crate::inventory::InventoryReconciler;
use crate::matching::aliases_for;
use crate::settings::Settings;

/// An application bundle found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedApplication {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub bundle_id: Option<String>,
    pub is_system_app: bool,
    pub aliases: Vec<String>,
}

impl ScannedApplication {
    pub fn to_entry(&self, now: u64) -> InventoryEntry {
        InventoryEntry {
            name: self.name.clone(),
            version: self.version.clone(),
            path: self.path.display().to_string(),
            bundle_id: self.bundle_id.clone(),
            is_system_app: self.is_system_app,
            installed_at_unix: now,
            last_checked_at_unix: now,
        }
    }
}

/// Collects scan results, keeping the first bundle seen for each name.
#[derive(Default)]
struct ScanArena {
    apps: Vec<ScannedApplication>,
    index: HashMap<String, usize>,
}

impl ScanArena {
    fn insert(&mut self, app: ScannedApplication) {
        let key = normalize_name(&app.name);
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.apps.len());
        self.apps.push(app);
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    scan_dirs: Vec<PathBuf>,
    system_dirs: Vec<PathBuf>,
}

impl Scanner {
    pub fn new(scan_dirs: Vec<PathBuf>, system_dirs: Vec<PathBuf>) -> Self {
        Self {
            scan_dirs,
            system_dirs,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut scan_dirs = vec![settings.applications_dir.clone()];
        for dir in &settings.scan_dirs {
            if !scan_dirs.contains(dir) {
                scan_dirs.push(dir.clone());
            }
        }
        Self::new(scan_dirs, settings.system_dirs.clone())
    }

    /// Enumerates bundles directly inside each scan directory, plus bundles
    /// one folder deeper. Missing directories are skipped.
    pub fn scan(&self) -> Vec<ScannedApplication> {
        let mut arena = ScanArena::default();
        for dir in &self.scan_dirs {
            for child in sorted_children(dir) {
                if is_app_bundle(&child) {
                    arena.insert(self.describe(&child, read_bundle_info(&child)));
                    continue;
                }
                let hidden = child
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with('.'));
                if hidden || !child.is_dir() {
                    continue;
                }
                for nested in sorted_children(&child) {
                    if is_app_bundle(&nested) {
                        arena.insert(self.describe(&nested, read_bundle_info(&nested)));
                    }
                }
            }
        }
        tracing::debug!(count = arena.apps.len(), "scanned applications");
        arena.apps
    }

    fn describe(&self, path: &Path, info: BundleInfo) -> ScannedApplication {
        let name = bundle_display_name(path);
        let is_system_app = self.system_dirs.iter().any(|dir| path.starts_with(dir))
            || info
                .bundle_id
                .as_deref()
                .is_some_and(|id| id.to_ascii_lowercase().starts_with("com.apple."));
        ScannedApplication {
            aliases: aliases_for(&name).into_iter().map(str::to_string).collect(),
            version: info
                .version()
                .unwrap_or(PLACEHOLDER_VERSION)
                .to_string(),
            bundle_id: info.bundle_id,
            path: path.to_path_buf(),
            is_system_app,
            name,
        }
    }

    /// Scans off the async executor, then fills in metadata from binary
    /// Info.plists through `plutil` when a runner is supplied.
    pub async fn scan_async(
        &self,
        runner: Option<&dyn CommandRunner>,
        options: RunOptions,
        ctx: &OperationContext,
    ) -> Result<Vec<ScannedApplication>, OperationError> {
        ctx.check()?;
        let scanner = self.clone();
        let mut apps = run_blocking(ctx, ErrorKind::Unknown, move || Ok(scanner.scan())).await?;
        if let Some(runner) = runner {
            for app in &mut apps {
                if app.version != PLACEHOLDER_VERSION || !has_binary_plist(&app.path) {
                    continue;
                }
                ctx.check()?;
                if let Some(info) =
                    convert_binary_plist(runner, &app.path, options.without_retries(), ctx).await
                {
                    *app = self.describe(&app.path, info);
                }
            }
        }
        Ok(apps)
    }

    /// Rescans and replaces the identity's inventory with what is on disk.
    pub async fn refresh_inventory(
        &self,
        identity: &str,
        reconciler: &InventoryReconciler,
        runner: Option<&dyn CommandRunner>,
        options: RunOptions,
        ctx: &OperationContext,
    ) -> Result<Vec<InventoryEntry>, OperationError> {
        let apps = self.scan_async(runner, options, ctx).await?;
        let now = current_unix_timestamp()
            .map_err(|err| OperationError::from_anyhow(ErrorKind::Unknown, &err))?;
        let entries = apps.iter().map(|app| app.to_entry(now)).collect();
        Ok(reconciler.replace_from_scan(identity, entries).await?)
    }
}

fn sorted_children(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    children.sort();
    children
}

fn has_binary_plist(bundle: &Path) -> bool {
    let mut header = [0_u8; 6];
    fs::File::open(info_plist_path(bundle))
        .and_then(|mut file| std::io::Read::read_exact(&mut file, &mut header))
        .is_ok()
        && &header == b"bplist"
}

pub fn build_plist_convert_command(plist: &Path) -> CommandSpec {
    CommandSpec::new("plutil")
        .args(["-convert", "xml1", "-o", "-"])
        .arg(plist)
}

async fn convert_binary_plist(
    runner: &dyn CommandRunner,
    bundle: &Path,
    options: RunOptions,
    ctx: &OperationContext,
) -> Option<BundleInfo> {
    let spec = build_plist_convert_command(&info_plist_path(bundle));
    match run_command(runner, &spec, options, ctx).await {
        Ok(output) => Some(parse_info_plist(&output.stdout)),
        Err(err) => {
            tracing::debug!(bundle = %bundle.display(), error = %err, "plist conversion failed");
            None
        }
    }
}

/// Reads bundle metadata, converting a binary Info.plist when needed.
pub async fn inspect_bundle(
    runner: &dyn CommandRunner,
    bundle: &Path,
    options: RunOptions,
    ctx: &OperationContext,
) -> BundleInfo {
    if has_binary_plist(bundle) {
        if let Some(info) = convert_binary_plist(runner, bundle, options, ctx).await {
            return info;
        }
    }
    read_bundle_info(bundle)
}
