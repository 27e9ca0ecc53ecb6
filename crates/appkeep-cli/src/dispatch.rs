use std::io;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use appkeep_core::{InventoryEntry, ProgressEvent};
use appkeep_installer::{
    default_user_prefix, load_settings, CancelReason, OperationContext, Orchestrator, Privilege,
    ProgressSink, RequestError, Settings, StateLayout,
};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::completion::{resolve_completion_shell, write_completions_script};
use crate::render::{
    format_inventory_lines, format_scan_lines, format_terminal_lines, TerminalProgress,
    TerminalRenderer,
};
use crate::{Cli, Commands, GlobalArgs};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CliStatus {
    Success,
    /// The operation ran and failed.
    Failed,
    /// The request was rejected before any work started.
    Rejected,
}

impl CliStatus {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Rejected => 2,
        }
    }

    pub(crate) fn exit_code(self) -> ExitCode {
        ExitCode::from(self.code())
    }

    pub(crate) fn from_terminal(event: &ProgressEvent) -> Self {
        match event {
            ProgressEvent::Error { .. } => Self::Failed,
            ProgressEvent::Completed { .. } | ProgressEvent::Progress { .. } => Self::Success,
        }
    }

    pub(crate) fn from_rejection(err: &RequestError) -> Self {
        if err.http_status() == 400 {
            Self::Rejected
        } else {
            Self::Failed
        }
    }
}

pub(crate) async fn run_cli(cli: Cli) -> Result<CliStatus> {
    let Cli { global, command } = cli;
    let renderer = TerminalRenderer::current();

    match command {
        Commands::Install {
            key,
            identity,
            stream,
        } => {
            let orchestrator = build_orchestrator(&global)?;
            run_install_command(&orchestrator, renderer, &identity, &key, stream).await
        }
        Commands::Uninstall {
            target,
            identity,
            elevated,
            stream,
        } => {
            let orchestrator = build_orchestrator(&global)?;
            let privilege = if elevated {
                Privilege::Elevated
            } else {
                Privilege::Standard
            };
            run_uninstall_command(&orchestrator, renderer, &identity, &target, privilege, stream)
                .await
        }
        Commands::Scan {
            identity,
            refresh,
            json,
        } => {
            let orchestrator = build_orchestrator(&global)?;
            run_scan_command(&orchestrator, renderer, &identity, refresh, json).await
        }
        Commands::List { identity, json } => {
            let orchestrator = build_orchestrator(&global)?;
            let entries = orchestrator
                .inventory(&identity)
                .await
                .with_context(|| format!("failed to read inventory for {identity}"))?;
            print_inventory(renderer, &identity, &entries, json)?;
            Ok(CliStatus::Success)
        }
        Commands::Completions { shell } => {
            let shell_env = std::env::var("SHELL").ok();
            let shell = resolve_completion_shell(shell, shell_env.as_deref())?;
            write_completions_script(shell, &mut io::stdout().lock())?;
            Ok(CliStatus::Success)
        }
    }
}

/// Resolves settings with the precedence config file, then environment,
/// then command-line flags.
pub(crate) fn resolve_settings(global: &GlobalArgs, layout: &StateLayout) -> Result<Settings> {
    let mut settings = load_settings(global.config.as_deref(), &layout.config_path())?;
    apply_cli_overrides(&mut settings, global);
    Ok(settings)
}

pub(crate) fn apply_cli_overrides(settings: &mut Settings, global: &GlobalArgs) {
    if let Some(dir) = &global.applications_dir {
        settings.applications_dir = dir.clone();
    }
    if let Some(store) = &global.package_store {
        settings.package_store = Some(store.clone());
    }
}

pub(crate) fn build_orchestrator(global: &GlobalArgs) -> Result<Orchestrator> {
    let prefix = match &global.prefix {
        Some(prefix) => prefix.clone(),
        None => default_user_prefix()?,
    };
    let layout = StateLayout::new(prefix);
    let settings = resolve_settings(global, &layout)?;
    tracing::debug!(
        prefix = %layout.prefix().display(),
        applications_dir = %settings.applications_dir.display(),
        "resolved settings"
    );
    Orchestrator::host(settings, layout)
}

async fn run_install_command(
    orchestrator: &Orchestrator,
    renderer: TerminalRenderer,
    identity: &str,
    key: &str,
    stream: bool,
) -> Result<CliStatus> {
    let request = match orchestrator.validate_install(identity, key) {
        Ok(request) => request,
        Err(err) => return Ok(report_rejection(renderer, &err)),
    };

    let ctx = orchestrator.new_context();
    let interrupt = watch_interrupt(ctx.clone());
    let terminal = if stream {
        orchestrator
            .stream_install(
                &request,
                tokio::io::stdout(),
                ctx.clone(),
                Some(watch_stdout_peer(ctx.poll_interval())),
            )
            .await
            .terminal
    } else {
        let sink = TerminalSink::start(renderer, "install");
        let terminal = orchestrator.run_install(&request, &sink, &ctx).await;
        sink.finish(renderer, &terminal);
        terminal
    };
    interrupt.abort();
    Ok(CliStatus::from_terminal(&terminal))
}

async fn run_uninstall_command(
    orchestrator: &Orchestrator,
    renderer: TerminalRenderer,
    identity: &str,
    target: &str,
    privilege: Privilege,
    stream: bool,
) -> Result<CliStatus> {
    let request = match orchestrator.validate_uninstall(identity, target, privilege) {
        Ok(request) => request,
        Err(err) => return Ok(report_rejection(renderer, &err)),
    };

    let ctx = orchestrator.new_context();
    let interrupt = watch_interrupt(ctx.clone());
    let terminal = if stream {
        orchestrator
            .stream_uninstall(
                &request,
                tokio::io::stdout(),
                ctx.clone(),
                Some(watch_stdout_peer(ctx.poll_interval())),
            )
            .await
            .terminal
    } else {
        let sink = TerminalSink::start(renderer, "uninstall");
        let terminal = orchestrator.run_uninstall(&request, &sink, &ctx).await;
        sink.finish(renderer, &terminal);
        terminal
    };
    interrupt.abort();
    Ok(CliStatus::from_terminal(&terminal))
}

async fn run_scan_command(
    orchestrator: &Orchestrator,
    renderer: TerminalRenderer,
    identity: &str,
    refresh: bool,
    json: bool,
) -> Result<CliStatus> {
    let ctx = orchestrator.new_context();
    let interrupt = watch_interrupt(ctx.clone());

    if refresh {
        let entries = orchestrator.refresh_inventory(identity, &ctx).await;
        interrupt.abort();
        let entries =
            entries.with_context(|| format!("failed to refresh inventory for {identity}"))?;
        print_inventory(renderer, identity, &entries, json)?;
        return Ok(CliStatus::Success);
    }

    let apps = orchestrator.scan(&ctx).await;
    interrupt.abort();
    let apps = apps.context("failed to scan for applications")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&apps)?);
    } else {
        renderer.print_section("Applications");
        renderer.print_lines(&format_scan_lines(&apps, renderer.style()));
    }
    Ok(CliStatus::Success)
}

fn print_inventory(
    renderer: TerminalRenderer,
    identity: &str,
    entries: &[InventoryEntry],
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    renderer.print_section(&format!("Inventory for {identity}"));
    renderer.print_lines(&format_inventory_lines(entries, identity, renderer.style()));
    Ok(())
}

fn report_rejection(renderer: TerminalRenderer, err: &RequestError) -> CliStatus {
    tracing::debug!(error = %err, "request rejected");
    renderer.eprint_status("err", &describe_error_chain(err));
    CliStatus::from_rejection(err)
}

pub(crate) fn describe_error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Cancels the operation on Ctrl-C. Abort the handle once the operation ends.
fn watch_interrupt(ctx: OperationContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            ctx.cancel(CancelReason::Requested);
        }
    })
}

/// Reports `true` once the reader of stdout goes away. Polled every
/// `interval` until the receiver is dropped.
fn watch_stdout_peer(interval: Duration) -> watch::Receiver<bool> {
    let (closed, receiver) = watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = closed.closed() => return,
                _ = ticker.tick() => {}
            }
            if stdout_reader_gone() {
                let _ = closed.send(true);
                return;
            }
        }
    });
    receiver
}

#[cfg(unix)]
fn stdout_reader_gone() -> bool {
    let mut stdout = libc::pollfd {
        fd: libc::STDOUT_FILENO,
        events: 0,
        revents: 0,
    };
    // SAFETY: one valid pollfd and a zero timeout, so the call never blocks.
    let ready = unsafe { libc::poll(&mut stdout, 1, 0) };
    ready > 0 && stdout.revents & (libc::POLLERR | libc::POLLHUP) != 0
}

#[cfg(not(unix))]
fn stdout_reader_gone() -> bool {
    false
}

struct SinkState {
    progress: Option<TerminalProgress>,
    terminal_seen: bool,
}

/// Renders an operation's progress events on the terminal.
pub(crate) struct TerminalSink {
    state: Mutex<SinkState>,
}

impl TerminalSink {
    pub(crate) fn start(renderer: TerminalRenderer, label: &str) -> Self {
        Self {
            state: Mutex::new(SinkState {
                progress: Some(renderer.start_progress(label)),
                terminal_seen: false,
            }),
        }
    }

    /// Clears the progress display and prints the outcome.
    pub(crate) fn finish(self, renderer: TerminalRenderer, terminal: &ProgressEvent) {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(progress) = state.progress {
            match terminal {
                ProgressEvent::Completed { .. } => progress.finish_success(),
                ProgressEvent::Error { .. } | ProgressEvent::Progress { .. } => {
                    progress.finish_abandon()
                }
            }
        }

        let lines = format_terminal_lines(renderer.style(), terminal);
        match terminal {
            ProgressEvent::Error { .. } => renderer.eprint_lines(&lines),
            ProgressEvent::Completed { .. } | ProgressEvent::Progress { .. } => {
                renderer.print_lines(&lines)
            }
        }
    }
}

#[async_trait]
impl ProgressSink for TerminalSink {
    async fn send(&self, event: ProgressEvent) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.terminal_seen {
            return false;
        }
        match &event {
            ProgressEvent::Progress {
                percent, message, ..
            } => {
                if let Some(progress) = state.progress.as_mut() {
                    progress.update(*percent, message);
                }
            }
            ProgressEvent::Completed { .. } | ProgressEvent::Error { .. } => {
                state.terminal_seen = true;
            }
        }
        true
    }
}
