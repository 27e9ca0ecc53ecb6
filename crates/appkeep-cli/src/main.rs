mod completion;
mod dispatch;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::completion::CliCompletionShell;
use crate::dispatch::{run_cli, CliStatus};
use crate::render::TerminalRenderer;

const LOG_ENV: &str = "APPKEEP_LOG";
const DEFAULT_LOG_DIRECTIVES: &str = "warn";
const DEFAULT_IDENTITY: &str = "local";

#[derive(Parser, Debug)]
#[command(name = "appkeep", version)]
#[command(about = "Install, remove and inventory macOS applications", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// State directory. Defaults to $APPKEEP_PREFIX, then ~/.appkeep.
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,
    /// Config file. Defaults to $APPKEEP_CONFIG, then <prefix>/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory installed bundles are placed in.
    #[arg(long, global = true)]
    applications_dir: Option<PathBuf>,
    /// Package store location: a directory or an http(s) base URL.
    #[arg(long, global = true)]
    package_store: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a package and deploy the application it contains.
    Install {
        key: String,
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,
        /// Write progress as wire frames to stdout.
        #[arg(long)]
        stream: bool,
    },
    /// Quit and remove an installed application.
    Uninstall {
        /// Package key or application name.
        target: String,
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,
        /// Allow removing applications under system directories.
        #[arg(long)]
        elevated: bool,
        #[arg(long)]
        stream: bool,
    },
    /// List application bundles found on disk.
    Scan {
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,
        /// Replace the identity's inventory with the scan result.
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the recorded inventory for an identity.
    List {
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,
        #[arg(long)]
        json: bool,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Option<CliCompletionShell>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli).await {
        Ok(status) => status.exit_code(),
        Err(err) => {
            TerminalRenderer::current().eprint_status("err", &format!("{err:#}"));
            CliStatus::Failed.exit_code()
        }
    }
}

fn init_tracing() {
    let directives = log_directives(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter =
        EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// `APPKEEP_LOG` wins over `RUST_LOG`; blank values are ignored.
fn log_directives(appkeep_log: Option<&str>, rust_log: Option<&str>) -> String {
    [appkeep_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_LOG_DIRECTIVES)
        .to_string()
}

#[cfg(test)]
mod tests;
