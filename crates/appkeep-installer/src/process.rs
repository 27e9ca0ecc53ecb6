use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use appkeep_core::{compact_name, ErrorKind};
use async_trait::async_trait;

use crate::bundle::read_bundle_info;
use crate::command::{run_command, CommandError, CommandRunner, CommandSpec, RunOptions};
use crate::context::OperationContext;
use crate::error::OperationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u32,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub pid: u32,
    pub command: String,
    pub bundle_path: Option<PathBuf>,
    pub bundle_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// What a graceful quit request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitTarget {
    BundleId(String),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessQuery {
    pub name: String,
    pub bundle_id: Option<String>,
}

/// Host process table and signalling.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn list_processes(&self, ctx: &OperationContext) -> Result<Vec<ProcessRow>, CommandError>;

    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Asks the application to quit on its own. Returns `false` when the
    /// platform has no such mechanism.
    async fn request_quit(
        &self,
        target: &QuitTarget,
        ctx: &OperationContext,
    ) -> Result<bool, CommandError>;
}

pub struct HostProcessControl {
    runner: Arc<dyn CommandRunner>,
    options: RunOptions,
}

impl HostProcessControl {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            options: RunOptions::once(timeout),
        }
    }
}

pub fn build_process_list_command() -> CommandSpec {
    CommandSpec::new("ps").args(["-A", "-ww", "-o", "pid=", "-o", "command="])
}

pub fn build_quit_command(target: &QuitTarget) -> CommandSpec {
    let script = match target {
        QuitTarget::BundleId(id) => {
            format!("tell application id \"{}\" to quit", escape_applescript(id))
        }
        QuitTarget::Name(name) => {
            format!("tell application \"{}\" to quit", escape_applescript(name))
        }
    };
    CommandSpec::new("osascript").arg("-e").arg(script)
}

fn escape_applescript(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn parse_process_table(output: &str) -> Vec<ProcessRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let command = command.trim();
            (!command.is_empty()).then(|| ProcessRow {
                pid,
                command: command.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ProcessControl for HostProcessControl {
    async fn list_processes(
        &self,
        ctx: &OperationContext,
    ) -> Result<Vec<ProcessRow>, CommandError> {
        let output =
            run_command(self.runner.as_ref(), &build_process_list_command(), self.options, ctx)
                .await?;
        Ok(parse_process_table(&output.stdout))
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        // SAFETY: signal 0 performs only the existence and permission check.
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: sending a signal to a pid has no memory-safety implications.
        if unsafe { libc::kill(pid as libc::pid_t, signo) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    #[cfg(not(unix))]
    fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }

    async fn request_quit(
        &self,
        target: &QuitTarget,
        ctx: &OperationContext,
    ) -> Result<bool, CommandError> {
        if !cfg!(target_os = "macos") {
            return Ok(false);
        }
        run_command(
            self.runner.as_ref(),
            &build_quit_command(target),
            self.options,
            ctx,
        )
        .await?;
        Ok(true)
    }
}

/// Outermost `.app` bundles named in a command line, in order.
fn bundle_paths_in_command(command: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let lowered = command.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(offset) = lowered[search_from..].find(".app/") {
        let end = search_from + offset + ".app".len();
        paths.push(PathBuf::from(&command[..end]));
        search_from = end;
    }
    paths
}

fn executable_name(command: &str) -> &str {
    let argv0 = command.split_whitespace().next().unwrap_or("");
    argv0.rsplit('/').next().unwrap_or(argv0)
}

fn bundle_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Finds running processes that belong to the application, by name and by
/// bundle identifier. Results are deduplicated by pid and never include the
/// current process.
pub async fn find_processes(
    control: &dyn ProcessControl,
    query: &ProcessQuery,
    ctx: &OperationContext,
) -> Result<Vec<ProcessDescriptor>, OperationError> {
    let rows = control.list_processes(ctx).await?;
    let own_pid = std::process::id();
    let wanted_name = compact_name(&query.name);
    let wanted_id = query
        .bundle_id
        .as_deref()
        .map(str::to_ascii_lowercase)
        .filter(|id| !id.is_empty());

    let mut bundle_ids: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut found: BTreeMap<u32, ProcessDescriptor> = BTreeMap::new();
    for row in rows {
        if row.pid == own_pid || row.pid == 0 {
            continue;
        }
        let bundles = bundle_paths_in_command(&row.command);
        let outer_bundle = bundles.first().cloned();

        let mut matched = !wanted_name.is_empty()
            && (bundles
                .iter()
                .any(|bundle| compact_name(&bundle_name(bundle)).contains(&wanted_name))
                || (bundles.is_empty()
                    && compact_name(executable_name(&row.command)).contains(&wanted_name)));

        let mut bundle_id = None;
        if let Some(bundle) = &outer_bundle {
            bundle_id = bundle_ids
                .entry(bundle.clone())
                .or_insert_with(|| read_bundle_info(bundle).bundle_id)
                .clone();
            if let (Some(wanted), Some(actual)) = (&wanted_id, &bundle_id) {
                matched |= actual.to_ascii_lowercase() == *wanted;
            }
        }

        if matched {
            found.entry(row.pid).or_insert(ProcessDescriptor {
                pid: row.pid,
                command: row.command,
                bundle_path: outer_bundle,
                bundle_id,
            });
        }
    }

    Ok(found.into_values().collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub attempts: u32,
    pub wait: Duration,
}

/// Stops each process with an escalating ladder: a graceful quit request
/// when a target is known, then TERM, then KILL on the final attempt only.
///
/// Fails with `ProcessRunning` naming the survivors.
pub async fn terminate_processes(
    control: &dyn ProcessControl,
    processes: &[ProcessDescriptor],
    fallback_name: Option<&str>,
    policy: TerminationPolicy,
    ctx: &OperationContext,
) -> Result<(), OperationError> {
    let attempts = policy.attempts.max(1);
    let mut survivors = Vec::new();

    for process in processes {
        let quit_target = process
            .bundle_id
            .clone()
            .map(QuitTarget::BundleId)
            .or_else(|| fallback_name.map(|name| QuitTarget::Name(name.to_string())));

        let mut stopped = !control.is_alive(process.pid);
        for attempt in 1..=attempts {
            if stopped {
                break;
            }
            ctx.check()?;
            if attempt == 1 && attempts > 1 {
                if let Some(target) = &quit_target {
                    match control.request_quit(target, ctx).await {
                        Ok(true) => {}
                        Ok(false) => send_signal(control, process.pid, Signal::Terminate),
                        Err(err) => {
                            tracing::debug!(pid = process.pid, error = %err, "quit request failed");
                            send_signal(control, process.pid, Signal::Terminate);
                        }
                    }
                } else {
                    send_signal(control, process.pid, Signal::Terminate);
                }
            } else if attempt == attempts {
                send_signal(control, process.pid, Signal::Kill);
            } else {
                send_signal(control, process.pid, Signal::Terminate);
            }
            ctx.sleep(policy.wait).await?;
            stopped = !control.is_alive(process.pid);
        }

        if !stopped {
            survivors.push(process.pid);
        }
    }

    if survivors.is_empty() {
        return Ok(());
    }
    let pids: Vec<String> = survivors.iter().map(u32::to_string).collect();
    Err(OperationError::new(
        ErrorKind::ProcessRunning,
        format!("processes still running: {}", pids.join(", ")),
    ))
}

fn send_signal(control: &dyn ProcessControl, pid: u32, signal: Signal) {
    if let Err(err) = control.signal(pid, signal) {
        tracing::debug!(pid, ?signal, error = %err, "failed to signal process");
    }
}
