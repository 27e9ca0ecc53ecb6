use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{CommandFactory, ValueEnum};
use clap_complete::Shell;

use crate::Cli;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(shell: CliCompletionShell) -> Self {
        match shell {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

pub(crate) fn write_completions_script<W: Write>(
    shell: CliCompletionShell,
    writer: &mut W,
) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(Shell::from(shell), &mut command, "appkeep", &mut generated);

    writer
        .write_all(&generated)
        .with_context(|| "failed writing generated completion script")?;
    writer
        .flush()
        .with_context(|| "failed flushing completion script")?;
    Ok(())
}

pub(crate) fn detect_shell_from_env(shell_env: Option<&str>) -> Option<CliCompletionShell> {
    let shell_value = shell_env?;
    let shell_token = Path::new(shell_value)
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(shell_value)
        .to_ascii_lowercase();
    match shell_token.as_str() {
        "bash" => Some(CliCompletionShell::Bash),
        "zsh" => Some(CliCompletionShell::Zsh),
        "fish" => Some(CliCompletionShell::Fish),
        "powershell" | "pwsh" => Some(CliCompletionShell::Powershell),
        _ => None,
    }
}

/// An explicit shell wins; otherwise `$SHELL` decides.
pub(crate) fn resolve_completion_shell(
    requested_shell: Option<CliCompletionShell>,
    shell_env: Option<&str>,
) -> Result<CliCompletionShell> {
    requested_shell
        .or_else(|| detect_shell_from_env(shell_env))
        .context("could not detect the shell; pass one of: bash, zsh, fish, powershell")
}
