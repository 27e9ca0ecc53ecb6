use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use appkeep_core::{normalize_name, InventoryEntry, PackageReference, ProgressEvent, ReferenceError};
use appkeep_store::{
    open_package_store, validate_identity, FileInventoryStore, InventoryStore, StoreError,
};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::command::HostCommandRunner;
use crate::context::OperationContext;
use crate::env::OperationEnv;
use crate::error::OperationError;
use crate::install::{InstallRequest, Installer};
use crate::inventory::InventoryReconciler;
use crate::layout::StateLayout;
use crate::process::HostProcessControl;
use crate::progress::{ProgressChannel, ProgressSink};
use crate::scan::ScannedApplication;
use crate::settings::Settings;
use crate::uninstall::{Privilege, UninstallRequest, Uninstaller};

/// A request rejected before any work started.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("invalid identity")]
    Identity(#[source] StoreError),
    #[error("uninstall target must not be empty")]
    EmptyTarget,
    #[error("failed to prepare state directories")]
    Setup(#[source] anyhow::Error),
}

impl RequestError {
    /// Status a request front end should answer with: client mistakes are
    /// 400, local setup failures 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Reference(_) | Self::Identity(_) | Self::EmptyTarget => 400,
            Self::Setup(_) => 500,
        }
    }
}

/// Terminal event of a streamed operation plus the writer it was streamed to.
pub struct StreamSummary<W> {
    pub terminal: ProgressEvent,
    pub writer: Option<W>,
}

/// Serializes operations on the same application for the same identity.
#[derive(Default)]
struct OperationLocks {
    inner: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl OperationLocks {
    /// Waits for the pair's lock unless the operation is cancelled first.
    async fn acquire(
        &self,
        identity: &str,
        app: &str,
        ctx: &OperationContext,
    ) -> Result<OwnedMutexGuard<()>, OperationError> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(
                locks
                    .entry((identity.to_string(), normalize_name(app)))
                    .or_default(),
            )
        };
        tokio::select! {
            guard = lock.lock_owned() => Ok(guard),
            _ = ctx.cancelled() => Err(ctx.cancellation_error()),
        }
    }
}

/// Validates requests and runs installs and uninstalls to exactly one
/// terminal event.
pub struct Orchestrator {
    env: OperationEnv,
    locks: OperationLocks,
}

impl Orchestrator {
    pub fn new(env: OperationEnv) -> Self {
        Self {
            env,
            locks: OperationLocks::default(),
        }
    }

    /// Wires host implementations: real processes, the configured package
    /// store (or `<prefix>/packages`), and file-backed inventory records.
    pub fn host(settings: Settings, layout: StateLayout) -> Result<Self> {
        let location = settings
            .package_store
            .clone()
            .unwrap_or_else(|| layout.prefix().join("packages").display().to_string());
        let packages = open_package_store(&location)
            .with_context(|| format!("failed to open package store: {location}"))?;
        let inventory: Arc<dyn InventoryStore> =
            Arc::new(FileInventoryStore::new(layout.inventory_dir()));
        let runner = Arc::new(HostCommandRunner);
        let processes = Arc::new(HostProcessControl::new(runner.clone(), settings.command_timeout));
        Ok(Self::new(OperationEnv {
            settings,
            layout,
            runner,
            processes,
            packages,
            reconciler: Arc::new(InventoryReconciler::new(inventory)),
        }))
    }

    pub fn env(&self) -> &OperationEnv {
        &self.env
    }

    pub fn new_context(&self) -> OperationContext {
        self.env.new_context()
    }

    pub fn validate_install(
        &self,
        identity: &str,
        key: &str,
    ) -> Result<InstallRequest, RequestError> {
        validate_identity(identity).map_err(RequestError::Identity)?;
        let reference = PackageReference::parse(key)?;
        self.env
            .layout
            .ensure_base_dirs()
            .map_err(RequestError::Setup)?;
        Ok(InstallRequest {
            identity: identity.to_string(),
            reference,
        })
    }

    pub fn validate_uninstall(
        &self,
        identity: &str,
        target: &str,
        privilege: Privilege,
    ) -> Result<UninstallRequest, RequestError> {
        validate_identity(identity).map_err(RequestError::Identity)?;
        if target.trim().is_empty() {
            return Err(RequestError::EmptyTarget);
        }
        self.env
            .layout
            .ensure_base_dirs()
            .map_err(RequestError::Setup)?;
        Ok(UninstallRequest {
            identity: identity.to_string(),
            target: target.trim().to_string(),
            privilege,
        })
    }

    /// Runs an install and sends its terminal event to `sink`, returning it.
    pub async fn run_install(
        &self,
        request: &InstallRequest,
        sink: &dyn ProgressSink,
        ctx: &OperationContext,
    ) -> ProgressEvent {
        let installer = Installer::new(&self.env);
        let outcome = async {
            let _guard = self
                .locks
                .acquire(&request.identity, &request.reference.search_name, ctx)
                .await?;
            installer.install(request, ctx, sink).await
        }
        .await;
        let terminal = match outcome {
            Ok(report) => report.completion_event(),
            Err(err) => failure_event("install", err, ctx),
        };
        sink.send(terminal.clone()).await;
        terminal
    }

    pub async fn run_uninstall(
        &self,
        request: &UninstallRequest,
        sink: &dyn ProgressSink,
        ctx: &OperationContext,
    ) -> ProgressEvent {
        let uninstaller = Uninstaller::new(&self.env);
        let outcome = async {
            let _guard = self
                .locks
                .acquire(&request.identity, &request.target_name(), ctx)
                .await?;
            uninstaller.uninstall(request, ctx, sink).await
        }
        .await;
        let terminal = match outcome {
            Ok(report) => report.completion_event(),
            Err(err) => failure_event("uninstall", err, ctx),
        };
        sink.send(terminal.clone()).await;
        terminal
    }

    fn open_channel<W>(
        &self,
        writer: W,
        ctx: &OperationContext,
        peer: Option<watch::Receiver<bool>>,
    ) -> ProgressChannel<W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut channel =
            ProgressChannel::open(writer, ctx.clone(), self.env.settings.keepalive_interval);
        if let Some(closed) = peer {
            channel.watch_peer(closed);
        }
        channel
    }

    /// Streams an install as wire frames onto `writer`. `peer`, when given,
    /// reports the consumer going away so an idle stream still cancels.
    pub async fn stream_install<W>(
        &self,
        request: &InstallRequest,
        writer: W,
        ctx: OperationContext,
        peer: Option<watch::Receiver<bool>>,
    ) -> StreamSummary<W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channel = self.open_channel(writer, &ctx, peer);
        let terminal = self.run_install(request, &channel, &ctx).await;
        close_channel(channel, terminal).await
    }

    pub async fn stream_uninstall<W>(
        &self,
        request: &UninstallRequest,
        writer: W,
        ctx: OperationContext,
        peer: Option<watch::Receiver<bool>>,
    ) -> StreamSummary<W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channel = self.open_channel(writer, &ctx, peer);
        let terminal = self.run_uninstall(request, &channel, &ctx).await;
        close_channel(channel, terminal).await
    }

    pub async fn scan(
        &self,
        ctx: &OperationContext,
    ) -> Result<Vec<ScannedApplication>, OperationError> {
        self.env
            .scanner()
            .scan_async(Some(self.env.runner.as_ref()), self.env.run_options(), ctx)
            .await
    }

    /// Rescans disk and replaces the identity's inventory with the result.
    pub async fn refresh_inventory(
        &self,
        identity: &str,
        ctx: &OperationContext,
    ) -> Result<Vec<InventoryEntry>, OperationError> {
        validate_identity(identity)?;
        self.env
            .scanner()
            .refresh_inventory(
                identity,
                &self.env.reconciler,
                Some(self.env.runner.as_ref()),
                self.env.run_options(),
                ctx,
            )
            .await
    }

    pub async fn inventory(&self, identity: &str) -> Result<Vec<InventoryEntry>, OperationError> {
        Ok(self.env.reconciler.entries(identity).await?)
    }
}

/// Cancellation supersedes whatever error the operation was unwinding with.
fn failure_event(operation: &str, err: OperationError, ctx: &OperationContext) -> ProgressEvent {
    let err = if ctx.is_cancelled() {
        ctx.cancellation_error()
    } else {
        err
    };
    tracing::warn!(
        operation,
        kind = %err.kind,
        details = err.details.as_deref().unwrap_or(""),
        "operation failed"
    );
    err.to_event()
}

async fn close_channel<W>(channel: ProgressChannel<W>, terminal: ProgressEvent) -> StreamSummary<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = match channel.close().await {
        Ok(writer) => Some(writer),
        Err(err) => {
            tracing::debug!(error = %err, "failed to reclaim progress writer");
            None
        }
    };
    StreamSummary { terminal, writer }
}
