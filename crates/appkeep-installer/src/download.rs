use std::path::PathBuf;

use appkeep_core::{ErrorKind, PackageReference, ProgressEvent};
use appkeep_store::PackageStore;
use futures::StreamExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::context::{CancelReason, OperationContext};
use crate::error::OperationError;
use crate::layout::StateLayout;
use crate::progress::ProgressSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPackage {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

/// Percent reported after `done` of `total` bytes, mapped into `[start, end]`.
pub fn download_percent(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 || end <= start {
        return start;
    }
    let span = u64::from(end - start);
    let scaled = span.saturating_mul(done.min(total)) / total;
    start + scaled as u8
}

/// Streams a package from the store into the download cache.
///
/// The file is written under a `.part` name and renamed into place once the
/// stream ends, so a cancelled download never leaves a truncated cache entry.
pub async fn download_package(
    store: &dyn PackageStore,
    reference: &PackageReference,
    layout: &StateLayout,
    ctx: &OperationContext,
    sink: &dyn ProgressSink,
    range: (u8, u8),
) -> Result<DownloadedPackage, OperationError> {
    if !store.exists(&reference.key).await? {
        return Err(OperationError::new(
            ErrorKind::InvalidPackage,
            format!("package '{}' does not exist in the store", reference.key),
        ));
    }
    let total = match store.head_metadata(&reference.key).await {
        Ok(metadata) => metadata.size,
        Err(err) => {
            tracing::debug!(key = %reference.key, error = %err, "package metadata unavailable");
            None
        }
    };

    let target = layout.download_path(&reference.key, reference.archive_kind);
    let partial = target.with_extension(format!(
        "{}.part",
        reference.archive_kind.cache_extension()
    ));
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| OperationError::from_io("failed to create download cache", &err))?;
    }
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|err| OperationError::from_io("failed to create download file", &err))?;

    let mut stream = store.get(&reference.key).await?;
    let mut hasher = Sha256::new();
    let mut bytes = 0_u64;
    let mut last_percent = range.0;

    let result = loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = ctx.cancelled() => break Err(ctx.cancellation_error()),
        };
        let chunk = match chunk {
            None => break Ok(()),
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => break Err(OperationError::from(err)),
        };
        if let Err(err) = file.write_all(&chunk).await {
            break Err(OperationError::from_io("failed to write download", &err));
        }
        hasher.update(&chunk);
        bytes += chunk.len() as u64;

        if let Some(total) = total {
            let percent = download_percent(range.0, range.1, bytes, total);
            if percent > last_percent {
                last_percent = percent;
                let event = ProgressEvent::progress(
                    percent,
                    format!("Downloading {} ({bytes} of {total} bytes)", reference.display_name),
                );
                if !sink.send(event).await {
                    ctx.cancel(CancelReason::Disconnected);
                    break Err(ctx.cancellation_error());
                }
            }
        }
    };

    let flushed = file.flush().await;
    drop(file);
    if let Err(err) = result.and_then(|()| {
        flushed.map_err(|err| OperationError::from_io("failed to flush download", &err))
    }) {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            tracing::debug!(
                path = %partial.display(),
                error = %cleanup,
                "failed to remove partial download"
            );
        }
        return Err(err);
    }

    tokio::fs::rename(&partial, &target)
        .await
        .map_err(|err| OperationError::from_io("failed to finalize download", &err))?;
    let sha256 = hex::encode(hasher.finalize());
    tracing::info!(key = %reference.key, bytes, %sha256, "downloaded package");
    Ok(DownloadedPackage {
        path: target,
        sha256,
        bytes,
    })
}

pub fn download_details(download: &DownloadedPackage) -> serde_json::Value {
    json!({
        "sha256": download.sha256,
        "bytes": download.bytes,
    })
}
