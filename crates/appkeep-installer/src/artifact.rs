use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use appkeep_core::{ArchiveKind, ErrorKind};
use async_trait::async_trait;

use crate::bundle::{
    bundle_display_name, find_application_bundles, select_bundle, write_placeholder_bundle,
    SearchDepth,
};
use crate::command::{run_command, CommandError, CommandRunner, CommandSpec, RunOptions};
use crate::context::OperationContext;
use crate::error::OperationError;
use crate::fs_utils::{copy_dir_recursive, run_blocking, Interrupted};
use crate::outcome::Outcome;

/// Everything an extraction technique may touch besides the archive itself.
pub struct ExtractionEnv<'a> {
    pub runner: &'a dyn CommandRunner,
    pub ctx: &'a OperationContext,
    pub options: RunOptions,
}

impl ExtractionEnv<'_> {
    async fn run(&self, spec: CommandSpec) -> Result<(), AttemptFailure> {
        match run_command(self.runner, &spec, self.options, self.ctx).await {
            Ok(_) => Ok(()),
            Err(CommandError::Cancelled { .. }) => Err(AttemptFailure::Cancelled),
            Err(err) if self.ctx.is_cancelled() => {
                tracing::debug!(error = %err, "command failed after cancellation");
                Err(AttemptFailure::Cancelled)
            }
            Err(err) => Err(AttemptFailure::Failed(err.to_string())),
        }
    }
}

enum AttemptFailure {
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub enum AttemptOutcome {
    /// A bundle was found; `bundle` lives under the technique's output dir.
    Located {
        bundle: PathBuf,
        depth: SearchDepth,
        notes: Vec<String>,
    },
    /// The archive opened but held no bundle.
    Empty { notes: Vec<String> },
    /// The technique could not open the archive.
    Failed(String),
}

#[async_trait]
pub trait ExtractionTechnique: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleOrigin {
    Extracted,
    Placeholder { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBundle {
    pub path: PathBuf,
    pub technique: &'static str,
    pub depth: Option<SearchDepth>,
    pub origin: BundleOrigin,
    pub notes: Vec<String>,
}

impl LocatedBundle {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.origin, BundleOrigin::Placeholder { .. })
    }
}

/// Ordered extraction techniques for one archive kind. The first technique
/// that yields a bundle wins.
pub struct ArchiveChain {
    techniques: Vec<Box<dyn ExtractionTechnique>>,
}

impl ArchiveChain {
    pub fn for_kind(kind: ArchiveKind) -> Self {
        let techniques: Vec<Box<dyn ExtractionTechnique>> = match kind {
            ArchiveKind::Zip => vec![
                Box::new(InProcessZip),
                Box::new(CommandExtract {
                    name: "ditto",
                    build: build_ditto_extract_command,
                }),
                Box::new(CommandExtract {
                    name: "unzip",
                    build: build_unzip_command,
                }),
                Box::new(CommandExtract {
                    name: "tar",
                    build: build_tar_extract_command,
                }),
                Box::new(RawCopy),
            ],
            ArchiveKind::DiskImage => vec![
                Box::new(DiskImageAttach {
                    name: "hdiutil-attach",
                    extra_args: &[],
                }),
                Box::new(DiskImageAttach {
                    name: "hdiutil-attach-noverify",
                    extra_args: &["-noverify", "-noautoopen"],
                }),
                Box::new(CommandExtract {
                    name: "7z",
                    build: build_7z_extract_command,
                }),
            ],
            ArchiveKind::InstallerPackage => vec![
                Box::new(PkgutilExpand),
                Box::new(XarPayloadExpand),
                Box::new(CommandExtract {
                    name: "7z",
                    build: build_7z_extract_command,
                }),
            ],
        };
        Self { techniques }
    }

    pub fn technique_names(&self) -> Vec<&'static str> {
        self.techniques.iter().map(|technique| technique.name()).collect()
    }

    /// Runs the techniques in order inside `work_dir`.
    ///
    /// When some technique opened the archive but none found a bundle and
    /// `placeholder_fallback` is set, a placeholder bundle named after
    /// `search_name` is synthesized instead of failing.
    pub async fn locate(
        &self,
        archive: &Path,
        work_dir: &Path,
        search_name: &str,
        placeholder_fallback: bool,
        env: &ExtractionEnv<'_>,
    ) -> Result<LocatedBundle, OperationError> {
        let mut failures = Vec::new();
        let mut notes = Vec::new();
        let mut opened = false;

        for (index, technique) in self.techniques.iter().enumerate() {
            env.ctx.check()?;
            let out_dir = work_dir.join(format!("{index}-{}", technique.name()));
            fs::create_dir_all(&out_dir)
                .map_err(|err| OperationError::from_io("failed to create extraction dir", &err))?;

            match technique.attempt(archive, &out_dir, search_name, env).await? {
                AttemptOutcome::Located {
                    bundle,
                    depth,
                    notes: technique_notes,
                } => {
                    notes.extend(technique_notes);
                    tracing::debug!(
                        technique = technique.name(),
                        bundle = %bundle.display(),
                        "located application bundle"
                    );
                    return Ok(LocatedBundle {
                        path: bundle,
                        technique: technique.name(),
                        depth: Some(depth),
                        origin: BundleOrigin::Extracted,
                        notes,
                    });
                }
                AttemptOutcome::Empty {
                    notes: technique_notes,
                } => {
                    opened = true;
                    notes.extend(technique_notes);
                    tracing::debug!(technique = technique.name(), "archive held no bundle");
                }
                AttemptOutcome::Failed(reason) => {
                    tracing::debug!(
                        technique = technique.name(),
                        %reason,
                        "extraction technique failed"
                    );
                    failures.push(format!("{}: {reason}", technique.name()));
                }
            }
        }

        let archive_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !opened {
            return Err(OperationError::new(
                ErrorKind::NoBundleFound,
                format!(
                    "no extraction technique could open {archive_name} ({})",
                    failures.join("; ")
                ),
            ));
        }
        if !placeholder_fallback {
            return Err(OperationError::new(
                ErrorKind::NoBundleFound,
                format!("{archive_name} contains no application bundle"),
            ));
        }

        let reason = format!("{archive_name} contains no application bundle");
        let placeholder_dir = work_dir.join("placeholder");
        let name = search_name.to_string();
        let bundle = run_blocking(env.ctx, ErrorKind::Unknown, move || {
            write_placeholder_bundle(&placeholder_dir, &name, None)
        })
        .await?;
        tracing::warn!(bundle = %bundle.display(), %reason, "synthesized placeholder bundle");
        Ok(LocatedBundle {
            path: bundle,
            technique: "placeholder",
            depth: None,
            origin: BundleOrigin::Placeholder { reason },
            notes,
        })
    }
}

/// Finds the preferred bundle under `dir` after a technique has unpacked into it.
fn search_output(dir: &Path, search_name: &str, notes: Vec<String>) -> AttemptOutcome {
    match find_application_bundles(dir) {
        Some(search) => match select_bundle(&search.candidates, search_name) {
            Some(bundle) => AttemptOutcome::Located {
                bundle,
                depth: search.depth,
                notes,
            },
            None => AttemptOutcome::Empty { notes },
        },
        None => AttemptOutcome::Empty { notes },
    }
}

fn failure_outcome(
    failure: AttemptFailure,
    ctx: &OperationContext,
) -> Result<AttemptOutcome, OperationError> {
    match failure {
        AttemptFailure::Cancelled => Err(ctx.cancellation_error()),
        AttemptFailure::Failed(reason) => Ok(AttemptOutcome::Failed(reason)),
    }
}

struct InProcessZip;

#[async_trait]
impl ExtractionTechnique for InProcessZip {
    fn name(&self) -> &'static str {
        "zip"
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        let archive_path = archive.to_path_buf();
        let dst = out_dir.to_path_buf();
        let ctx = env.ctx.clone();
        let joined =
            tokio::task::spawn_blocking(move || extract_zip_archive(&archive_path, &dst, &ctx))
                .await;
        match joined {
            Ok(Ok(entries)) => {
                tracing::debug!(entries, "unpacked zip archive in process");
                Ok(search_output(out_dir, search_name, Vec::new()))
            }
            Ok(Err(err)) if err.is::<Interrupted>() || env.ctx.is_cancelled() => {
                Err(env.ctx.cancellation_error())
            }
            Ok(Err(err)) => Ok(AttemptOutcome::Failed(format!("{err:#}"))),
            Err(join_err) => Ok(AttemptOutcome::Failed(join_err.to_string())),
        }
    }
}

/// Unpacks a zip archive with the `zip` crate, restoring unix modes and
/// symlinks and skipping resource-fork metadata.
pub fn extract_zip_archive(archive: &Path, dst: &Path, ctx: &OperationContext) -> Result<usize> {
    let file = fs::File::open(archive)
        .with_context(|| format!("failed to open zip archive: {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(io::BufReader::new(file))
        .with_context(|| format!("failed to read zip archive: {}", archive.display()))?;
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let mut written = 0_usize;
    for index in 0..zip.len() {
        if ctx.is_cancelled() {
            return Err(Interrupted.into());
        }
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("failed to read zip entry #{index}"))?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::debug!(name = entry.name(), "skipping unsafe zip entry");
            continue;
        };
        let relative = relative.to_path_buf();
        if relative
            .components()
            .next()
            .is_some_and(|first| first.as_os_str() == "__MACOSX")
        {
            continue;
        }
        let target = dst.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mode = entry.unix_mode();
        #[cfg(unix)]
        if mode.is_some_and(|mode| mode & 0o170000 == 0o120000) {
            let mut link_target = String::new();
            io::Read::read_to_string(&mut entry, &mut link_target)
                .with_context(|| format!("failed to read symlink entry {}", relative.display()))?;
            std::os::unix::fs::symlink(&link_target, &target).with_context(|| {
                format!("failed to create symlink {} -> {link_target}", target.display())
            })?;
            written += 1;
            continue;
        }

        let mut out = fs::File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to write {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("failed to set mode on {}", target.display()))?;
        }
        written += 1;
    }
    Ok(written)
}

/// Runs one external unpack command into the output dir, then searches it.
struct CommandExtract {
    name: &'static str,
    build: fn(&Path, &Path) -> CommandSpec,
}

#[async_trait]
impl ExtractionTechnique for CommandExtract {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        if let Err(failure) = env.run((self.build)(archive, out_dir)).await {
            return failure_outcome(failure, env.ctx);
        }
        Ok(search_output(out_dir, search_name, Vec::new()))
    }
}

/// Last resort for zip archives: keep the raw file so the operation can
/// continue to the placeholder stage.
struct RawCopy;

#[async_trait]
impl ExtractionTechnique for RawCopy {
    fn name(&self) -> &'static str {
        "raw-copy"
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        _env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        let file_name = archive.file_name().unwrap_or(archive.as_os_str());
        let target = out_dir.join(file_name);
        if let Err(err) = fs::copy(archive, &target) {
            return Ok(AttemptOutcome::Failed(format!(
                "failed to copy {}: {err}",
                archive.display()
            )));
        }
        Ok(search_output(out_dir, search_name, Vec::new()))
    }
}

/// Mounts a disk image, copies the preferred bundle out, and always detaches.
struct DiskImageAttach {
    name: &'static str,
    extra_args: &'static [&'static str],
}

#[async_trait]
impl ExtractionTechnique for DiskImageAttach {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        let mount_point = out_dir.join("mnt");
        if let Err(err) = fs::create_dir_all(&mount_point) {
            return Ok(AttemptOutcome::Failed(format!(
                "failed to create mount point {}: {err}",
                mount_point.display()
            )));
        }
        if let Err(failure) = env
            .run(build_dmg_attach_command(archive, &mount_point, self.extra_args))
            .await
        {
            // A killed attach may still have mounted the image.
            if matches!(failure, AttemptFailure::Cancelled) {
                detach_disk_image(&mount_point, env).await;
            }
            return failure_outcome(failure, env.ctx);
        }

        let copied = copy_mounted_bundle(&mount_point, out_dir, search_name, env.ctx).await;
        let detach = detach_disk_image(&mount_point, env).await;
        let notes: Vec<String> = detach.note().map(str::to_string).into_iter().collect();

        match copied? {
            Some((bundle, depth)) => Ok(AttemptOutcome::Located {
                bundle,
                depth,
                notes,
            }),
            None => Ok(AttemptOutcome::Empty { notes }),
        }
    }
}

async fn copy_mounted_bundle(
    mount_point: &Path,
    out_dir: &Path,
    search_name: &str,
    ctx: &OperationContext,
) -> Result<Option<(PathBuf, SearchDepth)>, OperationError> {
    let Some(search) = find_application_bundles(mount_point) else {
        return Ok(None);
    };
    let Some(source) = select_bundle(&search.candidates, search_name) else {
        return Ok(None);
    };
    let payload = out_dir
        .join("payload")
        .join(format!("{}.app", bundle_display_name(&source)));
    let copy_ctx = ctx.clone();
    let copy_target = payload.clone();
    run_blocking(ctx, ErrorKind::Unknown, move || {
        copy_dir_recursive(&source, &copy_target, &copy_ctx)
    })
    .await?;
    Ok(Some((payload, search.depth)))
}

/// Upper bound on detaching, which runs even after the operation is cancelled.
const DETACH_DEADLINE: Duration = Duration::from_secs(30);

/// Best-effort detach; retries with `-force` once. Never fails the operation.
///
/// Runs under its own context so a cancelled or expired operation still
/// unmounts the image.
pub async fn detach_disk_image(mount_point: &Path, env: &ExtractionEnv<'_>) -> Outcome {
    let cleanup = OperationContext::with_poll_interval(DETACH_DEADLINE, env.ctx.poll_interval());
    let options = RunOptions::once(env.options.timeout.min(DETACH_DEADLINE));
    let first = run_command(
        env.runner,
        &build_dmg_detach_command(mount_point, false),
        options,
        &cleanup,
    )
    .await;
    if first.is_ok() {
        return Outcome::Ok;
    }
    let forced = run_command(
        env.runner,
        &build_dmg_detach_command(mount_point, true),
        options,
        &cleanup,
    )
    .await
    .map(|_| ());
    Outcome::from_result("detach disk image", forced)
}

struct PkgutilExpand;

#[async_trait]
impl ExtractionTechnique for PkgutilExpand {
    fn name(&self) -> &'static str {
        "pkgutil"
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        let expanded = out_dir.join("expanded");
        if let Err(failure) = env.run(build_pkg_expand_command(archive, &expanded)).await {
            return failure_outcome(failure, env.ctx);
        }
        Ok(search_output(&expanded, search_name, Vec::new()))
    }
}

/// Unpacks the xar container, then every `Payload` archive inside it.
struct XarPayloadExpand;

#[async_trait]
impl ExtractionTechnique for XarPayloadExpand {
    fn name(&self) -> &'static str {
        "xar"
    }

    async fn attempt(
        &self,
        archive: &Path,
        out_dir: &Path,
        search_name: &str,
        env: &ExtractionEnv<'_>,
    ) -> Result<AttemptOutcome, OperationError> {
        let container = out_dir.join("container");
        if let Err(err) = fs::create_dir_all(&container) {
            return Ok(AttemptOutcome::Failed(err.to_string()));
        }
        if let Err(failure) = env.run(build_xar_extract_command(archive, &container)).await {
            return failure_outcome(failure, env.ctx);
        }

        let payload_root = out_dir.join("payload");
        let mut notes = Vec::new();
        for (index, payload) in discover_payload_archives(&container).iter().enumerate() {
            env.ctx.check()?;
            let dst = payload_root.join(index.to_string());
            if let Err(err) = fs::create_dir_all(&dst) {
                notes.push(format!("failed to create {}: {err}", dst.display()));
                continue;
            }
            match env.run(build_payload_extract_command(payload, &dst)).await {
                Ok(()) => {}
                Err(AttemptFailure::Cancelled) => return Err(env.ctx.cancellation_error()),
                Err(AttemptFailure::Failed(reason)) => notes.push(reason),
            }
        }
        Ok(search_output(&payload_root, search_name, notes))
    }
}

/// Payload archives in an expanded flat package, top-level first.
pub fn discover_payload_archives(expanded_dir: &Path) -> Vec<PathBuf> {
    let mut payloads: Vec<PathBuf> = walkdir::WalkDir::new(expanded_dir)
        .max_depth(3)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == "Payload")
        .map(|entry| entry.into_path())
        .collect();
    payloads.sort_by_key(|path| (path.components().count(), path.clone()));
    payloads
}

pub fn build_dmg_attach_command(
    archive: &Path,
    mount_point: &Path,
    extra_args: &[&str],
) -> CommandSpec {
    CommandSpec::new("hdiutil")
        .arg("attach")
        .arg(archive)
        .args(["-readonly", "-nobrowse"])
        .args(extra_args)
        .arg("-mountpoint")
        .arg(mount_point)
}

pub fn build_dmg_detach_command(mount_point: &Path, force: bool) -> CommandSpec {
    let command = CommandSpec::new("hdiutil").arg("detach").arg(mount_point);
    if force {
        command.arg("-force")
    } else {
        command
    }
}

pub fn build_pkg_expand_command(archive: &Path, expanded_dir: &Path) -> CommandSpec {
    CommandSpec::new("pkgutil")
        .arg("--expand-full")
        .arg(archive)
        .arg(expanded_dir)
}

pub fn build_xar_extract_command(archive: &Path, dst: &Path) -> CommandSpec {
    CommandSpec::new("xar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dst)
}

pub fn build_payload_extract_command(payload: &Path, dst: &Path) -> CommandSpec {
    CommandSpec::new("tar")
        .arg("-xf")
        .arg(payload)
        .arg("-C")
        .arg(dst)
}

pub fn build_ditto_extract_command(archive: &Path, dst: &Path) -> CommandSpec {
    CommandSpec::new("ditto")
        .args(["-x", "-k"])
        .arg(archive)
        .arg(dst)
}

pub fn build_unzip_command(archive: &Path, dst: &Path) -> CommandSpec {
    CommandSpec::new("unzip")
        .args(["-q", "-o"])
        .arg(archive)
        .arg("-d")
        .arg(dst)
}

pub fn build_tar_extract_command(archive: &Path, dst: &Path) -> CommandSpec {
    CommandSpec::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dst)
}

pub fn build_7z_extract_command(archive: &Path, dst: &Path) -> CommandSpec {
    let mut output_flag = std::ffi::OsString::from("-o");
    output_flag.push(dst.as_os_str());
    CommandSpec::new("7z")
        .args(["x", "-y"])
        .arg(output_flag)
        .arg(archive)
}
