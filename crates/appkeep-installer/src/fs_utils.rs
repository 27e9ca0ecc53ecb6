use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use appkeep_core::ErrorKind;
use thiserror::Error;

use crate::context::OperationContext;
use crate::error::OperationError;

/// Marker error for a filesystem walk stopped by cancellation.
#[derive(Debug, Error)]
#[error("interrupted by cancellation")]
pub struct Interrupted;

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// True when something exists at `path`, without following a final symlink.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        remove_file_if_exists(path)
    }
}

/// Copies a directory tree, recreating symlinks instead of following them.
/// Checks `ctx` before each entry and stops with [`Interrupted`] once cancelled.
pub fn copy_dir_recursive(src: &Path, dst: &Path, ctx: &OperationContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Interrupted.into());
    }
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        if ctx.is_cancelled() {
            return Err(Interrupted.into());
        }
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path, ctx)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("failed to read symlink {}", src_path.display()))?;
            std::os::unix::fs::symlink(&target, &dst_path).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    dst_path.display(),
                    target.display()
                )
            })?;
            continue;
        }

        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

/// Grants the owner read, write and execute on every file and directory
/// under `root`, so executables whose mode was lost in extraction can run.
/// Symlinks are left alone.
pub fn relax_permissions(root: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        const OWNER_RWX: u32 = 0o700;
        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            let entry =
                entry.with_context(|| format!("failed to walk {}", root.display()))?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?;
            let mode = metadata.permissions().mode();
            if mode & OWNER_RWX != OWNER_RWX {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | OWNER_RWX))
                    .with_context(|| {
                        format!("failed to set permissions on {}", entry.path().display())
                    })?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = root;
    Ok(())
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to mark executable: {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Runs blocking filesystem work off the async executor and classifies its
/// failure. An [`Interrupted`] walk, or any failure once `ctx` is cancelled,
/// becomes the context's cancellation error.
pub async fn run_blocking<T, F>(
    ctx: &OperationContext,
    fallback: ErrorKind,
    work: F,
) -> std::result::Result<T, OperationError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            if err.is::<Interrupted>() || ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }
            Err(OperationError::from_anyhow(fallback, &err))
        }
        Err(join_err) => Err(OperationError::new(
            ErrorKind::Unknown,
            format!("blocking task failed: {join_err}"),
        )),
    }
}
