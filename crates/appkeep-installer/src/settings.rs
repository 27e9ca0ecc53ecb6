use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::command::RunOptions;
use crate::process::TerminationPolicy;

pub const CONFIG_ENV: &str = "APPKEEP_CONFIG";
pub const APPLICATIONS_DIR_ENV: &str = "APPKEEP_APPLICATIONS_DIR";
pub const PACKAGE_STORE_ENV: &str = "APPKEEP_PACKAGE_STORE";
pub const PLACEHOLDER_FALLBACK_ENV: &str = "APPKEEP_PLACEHOLDER_FALLBACK";

/// Effective configuration after the config file and environment overrides
/// have been applied. Command-line flags are applied last by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub applications_dir: PathBuf,
    pub scan_dirs: Vec<PathBuf>,
    pub system_dirs: Vec<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub package_store: Option<String>,
    #[serde(with = "humantime_serde")]
    pub operation_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    pub command_retries: u32,
    #[serde(with = "humantime_serde")]
    pub command_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cancel_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub terminate_wait: Duration,
    pub placeholder_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let home_dir = std::env::var_os("HOME")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let mut scan_dirs: Vec<PathBuf> = [
            "/Applications",
            "/Applications/Utilities",
            "/System/Applications",
            "/System/Applications/Utilities",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect();
        if let Some(home) = &home_dir {
            scan_dirs.push(home.join("Applications"));
        }

        Self {
            applications_dir: PathBuf::from("/Applications"),
            scan_dirs,
            system_dirs: vec![PathBuf::from("/System")],
            home_dir,
            package_store: None,
            operation_deadline: Duration::from_secs(15 * 60),
            command_timeout: Duration::from_secs(5 * 60),
            command_retries: 2,
            command_retry_delay: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(15),
            cancel_poll_interval: Duration::from_millis(100),
            terminate_wait: Duration::from_secs(1),
            placeholder_fallback: true,
            config_path: None,
        }
    }
}

impl Settings {
    pub fn run_options(&self) -> RunOptions {
        RunOptions::once(self.command_timeout)
            .with_retries(self.command_retries, self.command_retry_delay)
    }

    pub fn termination_policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            attempts: 3,
            wait: self.terminate_wait,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    applications_dir: Option<PathBuf>,
    scan_dirs: Option<Vec<PathBuf>>,
    system_dirs: Option<Vec<PathBuf>>,
    home_dir: Option<PathBuf>,
    package_store: Option<String>,
    #[serde(default, with = "humantime_serde")]
    operation_deadline: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    command_timeout: Option<Duration>,
    command_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    command_retry_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    keepalive_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    cancel_poll_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    terminate_wait: Option<Duration>,
    placeholder_fallback: Option<bool>,
}

/// Loads settings from `config_path` (or `$APPKEEP_CONFIG`, or the prefix's
/// `config.toml`), then applies environment overrides. A missing file is not
/// an error.
pub fn load_settings(config_path: Option<&Path>, default_path: &Path) -> Result<Settings> {
    let env_path = std::env::var_os(CONFIG_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    let path = config_path
        .map(ToOwned::to_owned)
        .or(env_path)
        .unwrap_or_else(|| default_path.to_path_buf());

    let mut settings = Settings::default();
    if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        apply_config_text(&mut settings, &raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        settings.config_path = Some(path);
    }

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    Ok(settings)
}

pub fn apply_config_text(settings: &mut Settings, text: &str) -> Result<()> {
    let raw: RawSettings = toml::from_str(text).context("invalid config TOML")?;
    apply_raw_settings(settings, raw);
    Ok(())
}

fn apply_raw_settings(settings: &mut Settings, raw: RawSettings) {
    if let Some(dir) = raw.applications_dir {
        settings.applications_dir = dir;
    }
    if let Some(dirs) = raw.scan_dirs {
        settings.scan_dirs = dirs;
    }
    if let Some(dirs) = raw.system_dirs {
        settings.system_dirs = dirs;
    }
    if let Some(home) = raw.home_dir {
        settings.home_dir = Some(home);
    }
    if let Some(store) = raw.package_store {
        settings.package_store = Some(store);
    }
    if let Some(value) = raw.operation_deadline {
        settings.operation_deadline = value;
    }
    if let Some(value) = raw.command_timeout {
        settings.command_timeout = value;
    }
    if let Some(value) = raw.command_retries {
        settings.command_retries = value;
    }
    if let Some(value) = raw.command_retry_delay {
        settings.command_retry_delay = value;
    }
    if let Some(value) = raw.keepalive_interval {
        settings.keepalive_interval = value;
    }
    if let Some(value) = raw.cancel_poll_interval {
        settings.cancel_poll_interval = value;
    }
    if let Some(value) = raw.terminate_wait {
        settings.terminate_wait = value;
    }
    if let Some(value) = raw.placeholder_fallback {
        settings.placeholder_fallback = value;
    }
}

pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(APPLICATIONS_DIR_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            settings.applications_dir = PathBuf::from(value);
        }
    }
    if let Some(value) = lookup(PACKAGE_STORE_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            settings.package_store = Some(value.to_string());
        }
    }
    if let Some(value) = lookup(PLACEHOLDER_FALLBACK_ENV) {
        settings.placeholder_fallback =
            parse_bool(&value).with_context(|| PLACEHOLDER_FALLBACK_ENV)?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!(
            "invalid boolean '{other}' (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
