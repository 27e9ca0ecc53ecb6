use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use appkeep_core::ErrorKind;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};

use crate::context::OperationContext;

const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const OUTPUT_SUMMARY_LIMIT: usize = 400;

/// A program invocation. Arguments are passed verbatim, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RunOptions {
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn without_retries(self) -> Self {
        Self::once(self.timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    fn summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let mut summary: String = text.chars().take(OUTPUT_SUMMARY_LIMIT).collect();
        if text.chars().count() > OUTPUT_SUMMARY_LIMIT {
            summary.push_str("...");
        }
        summary
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
    #[error("`{command}` exited with status {code}: {}", output.summary())]
    NonZeroExit {
        command: String,
        code: i32,
        output: CommandOutput,
    },
    #[error("failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => ErrorKind::FileNotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Unknown,
            },
            Self::NonZeroExit { code, output, .. } => classify_exit(*code, output),
        }
    }
}

fn classify_exit(code: i32, output: &CommandOutput) -> ErrorKind {
    let text = format!("{}\n{}", output.stderr, output.stdout).to_ascii_lowercase();
    if code == 126
        || text.contains("permission denied")
        || text.contains("operation not permitted")
        || text.contains("not permitted")
    {
        return ErrorKind::PermissionDenied;
    }
    if code == 127 || text.contains("no such file") || text.contains("command not found") {
        return ErrorKind::FileNotFound;
    }
    ErrorKind::Unknown
}

/// Executes one attempt of an external program.
///
/// Implementations return `Ok` for any exit status; [`run_command`] turns
/// non-zero exits into errors and owns the retry policy.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_once(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        ctx: &OperationContext,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs `spec`, retrying non-zero exits up to `options.max_retries` times
/// with a fixed delay. Timeouts, cancellation and spawn failures are not
/// retried.
pub async fn run_command(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    options: RunOptions,
    ctx: &OperationContext,
) -> Result<CommandOutput, CommandError> {
    let mut attempt = 0_u32;
    loop {
        if ctx.is_cancelled() {
            return Err(CommandError::Cancelled {
                command: spec.to_string(),
            });
        }
        let output = runner.run_once(spec, options.timeout, ctx).await?;
        if output.is_success() {
            return Ok(output);
        }
        if attempt >= options.max_retries {
            return Err(CommandError::NonZeroExit {
                command: spec.to_string(),
                code: output.exit_code,
                output,
            });
        }
        attempt += 1;
        tracing::debug!(
            command = %spec,
            code = output.exit_code,
            attempt,
            "command failed; retrying"
        );
        if ctx.sleep(options.retry_delay).await.is_err() {
            return Err(CommandError::Cancelled {
                command: spec.to_string(),
            });
        }
    }
}

/// Spawns real processes in their own process group so that a timeout or
/// cancellation can take down the whole tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run_once(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        ctx: &OperationContext,
    ) -> Result<CommandOutput, CommandError> {
        let rendered = spec.to_string();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        tracing::debug!(command = %rendered, "spawning command");
        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let started = Instant::now();
        let mut ticker = tokio::time::interval(ctx.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|source| CommandError::Spawn {
                        command: rendered.clone(),
                        source,
                    })?;
                }
                _ = ticker.tick() => {
                    if ctx.is_cancelled() {
                        terminate_child(&mut child).await;
                        stdout.abort();
                        stderr.abort();
                        return Err(CommandError::Cancelled { command: rendered });
                    }
                    if started.elapsed() >= timeout {
                        terminate_child(&mut child).await;
                        stdout.abort();
                        stderr.abort();
                        return Err(CommandError::Timeout { command: rendered, timeout });
                    }
                }
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        Ok(CommandOutput {
            exit_code: exit_code(status),
            stdout,
            stderr,
        })
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buffer).await {
        tracing::debug!(error = %err, "failed reading command output");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Sends TERM to the child's process group, then KILL if it has not exited
/// within a short grace period.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = pid as libc::pid_t;
            // SAFETY: killpg only sends a signal; the group was created for this child.
            unsafe {
                libc::killpg(pgid, libc::SIGTERM);
            }
            if tokio::time::timeout(TERMINATE_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            // SAFETY: as above.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "failed to kill command");
    }
}
