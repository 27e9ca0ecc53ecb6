use super::*;

use std::fs;
use std::io::Write;
use std::path::Path;

use appkeep_core::{ErrorKind, InventoryEntry, ProgressEvent};
use appkeep_installer::{RequestError, ScannedApplication, Settings};
use clap::error::ErrorKind as ClapErrorKind;
use clap::CommandFactory;
use serde_json::json;
use tempfile::TempDir;

use crate::completion::{detect_shell_from_env, resolve_completion_shell, write_completions_script};
use crate::dispatch::{
    apply_cli_overrides, build_orchestrator, describe_error_chain, resolve_settings,
};
use crate::render::{
    format_inventory_lines, format_scan_lines, format_terminal_lines, render_progress_line,
    render_section_header, render_status_line, resolve_output_style, OutputStyle,
};

fn info_plist(name: &str, bundle_id: &str, version: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n\t<key>CFBundleName</key>\n\t<string>{name}</string>\n\t<key>CFBundleIdentifier</key>\n\t<string>{bundle_id}</string>\n\t<key>CFBundleShortVersionString</key>\n\t<string>{version}</string>\n</dict>\n</plist>\n"
    )
}

fn write_editor_zip(path: &Path) {
    let file = fs::File::create(path).expect("must create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o755);
    writer
        .start_file("Editor.app/Contents/Info.plist", options)
        .expect("must start plist entry");
    writer
        .write_all(info_plist("Editor", "com.example.editor", "2.1.0").as_bytes())
        .expect("must write plist entry");
    writer
        .start_file("Editor.app/Contents/MacOS/Editor", options)
        .expect("must start executable entry");
    writer
        .write_all(b"#!/bin/sh\nexit 0\n")
        .expect("must write executable entry");
    writer.finish().expect("must finish zip");
}

struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("must create temp dir");
        for dir in ["prefix", "packages", "Applications"] {
            fs::create_dir_all(root.path().join(dir)).expect("must create workspace dir");
        }
        Self { root }
    }

    fn path(&self, name: &str) -> String {
        self.root.path().join(name).display().to_string()
    }

    /// Command line with every location pinned inside the workspace.
    fn args(&self, command: &[&str]) -> Vec<String> {
        let mut args = vec![
            "appkeep".to_string(),
            "--prefix".to_string(),
            self.path("prefix"),
            "--config".to_string(),
            self.path("missing-config.toml"),
            "--applications-dir".to_string(),
            self.path("Applications"),
            "--package-store".to_string(),
            self.path("packages"),
        ];
        args.extend(command.iter().map(|arg| arg.to_string()));
        args
    }

    fn parse(&self, command: &[&str]) -> Cli {
        Cli::try_parse_from(self.args(command)).expect("command must parse")
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn install_parses_identity_and_stream_flags() {
    let cli = Cli::try_parse_from([
        "appkeep",
        "install",
        "Editor-2.1.0.zip",
        "--identity",
        "alice",
        "--stream",
    ])
    .expect("command must parse");

    match cli.command {
        Commands::Install {
            key,
            identity,
            stream,
        } => {
            assert_eq!(key, "Editor-2.1.0.zip");
            assert_eq!(identity, "alice");
            assert!(stream);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn uninstall_defaults_to_local_identity_without_elevation() {
    let cli = Cli::try_parse_from(["appkeep", "uninstall", "Visual Studio Code"])
        .expect("command must parse");

    match cli.command {
        Commands::Uninstall {
            target,
            identity,
            elevated,
            stream,
        } => {
            assert_eq!(target, "Visual Studio Code");
            assert_eq!(identity, DEFAULT_IDENTITY);
            assert!(!elevated);
            assert!(!stream);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "appkeep",
        "list",
        "--json",
        "--prefix",
        "/tmp/appkeep-state",
        "--package-store",
        "https://packages.example.test",
    ])
    .expect("command must parse");

    assert_eq!(
        cli.global.prefix.as_deref(),
        Some(Path::new("/tmp/appkeep-state"))
    );
    assert_eq!(
        cli.global.package_store.as_deref(),
        Some("https://packages.example.test")
    );
    assert!(matches!(cli.command, Commands::List { json: true, .. }));
}

#[test]
fn install_without_key_is_a_usage_error() {
    let err = Cli::try_parse_from(["appkeep", "install"]).expect_err("key is required");
    assert_eq!(err.kind(), ClapErrorKind::MissingRequiredArgument);
}

#[test]
fn completions_shell_is_optional() {
    let cli = Cli::try_parse_from(["appkeep", "completions"]).expect("command must parse");
    assert!(matches!(cli.command, Commands::Completions { shell: None }));

    let cli = Cli::try_parse_from(["appkeep", "completions", "zsh"]).expect("command must parse");
    assert!(matches!(
        cli.command,
        Commands::Completions {
            shell: Some(CliCompletionShell::Zsh)
        }
    ));
}

#[test]
fn log_directives_prefer_appkeep_log_then_rust_log() {
    assert_eq!(log_directives(Some("debug"), Some("trace")), "debug");
    assert_eq!(log_directives(Some("  "), Some("trace")), "trace");
    assert_eq!(log_directives(None, Some("info")), "info");
    assert_eq!(log_directives(None, None), "warn");
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "Installed Editor"),
        "Installed Editor"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badges() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "Installed Editor"),
        "[OK] Installed Editor"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "auxiliary cleanup skipped"),
        "[WARN] auxiliary cleanup skipped"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "the operation timed out"),
        "[ERR] the operation timed out"
    );
}

#[test]
fn resolve_output_style_requires_terminal_and_color() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
}

#[test]
fn section_headers_are_rich_only() {
    assert_eq!(render_section_header(OutputStyle::Plain, "Applications"), None);
    assert_eq!(
        render_section_header(OutputStyle::Rich, "Applications").as_deref(),
        Some("== Applications ==")
    );
}

#[test]
fn progress_summary_line_is_rich_only() {
    assert_eq!(
        render_progress_line(OutputStyle::Plain, "install", 100, None),
        None
    );
    let line = render_progress_line(
        OutputStyle::Rich,
        "install",
        100,
        Some(std::time::Duration::from_millis(1500)),
    )
    .expect("rich style renders a summary");
    assert!(line.contains("100%"));
    assert!(line.ends_with("complete in 1.500s"));
}

#[test]
fn clean_completion_renders_a_single_ok_line() {
    let event = ProgressEvent::Completed {
        message: "Installed Editor".to_string(),
        details: Some(json!({ "name": "Editor", "degraded": false })),
    };
    assert_eq!(
        format_terminal_lines(OutputStyle::Rich, &event),
        vec!["[OK] Installed Editor".to_string()]
    );
}

#[test]
fn degraded_completion_lists_placeholder_and_notes_as_warnings() {
    let event = ProgressEvent::Completed {
        message: "Installed Editor".to_string(),
        details: Some(json!({
            "degraded": true,
            "placeholder": true,
            "reason": "no bundle in archive",
            "notes": ["quarantine removal failed"],
        })),
    };
    assert_eq!(
        format_terminal_lines(OutputStyle::Rich, &event),
        vec![
            "[WARN] Installed Editor".to_string(),
            "[WARN] placeholder installed: no bundle in archive".to_string(),
            "[WARN] quarantine removal failed".to_string(),
        ]
    );
}

#[test]
fn error_event_renders_kind_and_details() {
    let event = ProgressEvent::error(
        ErrorKind::ProcessRunning,
        Some("processes still running: 42".to_string()),
    );
    let lines = format_terminal_lines(OutputStyle::Plain, &event);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("(ProcessRunning)"));
    assert!(lines[0].starts_with("the application is still running"));
    assert_eq!(lines[1], "  processes still running: 42");
}

#[test]
fn scan_lines_mark_system_applications() {
    let apps = vec![
        ScannedApplication {
            name: "Editor".to_string(),
            version: "2.1.0".to_string(),
            path: "/Applications/Editor.app".into(),
            bundle_id: Some("com.example.editor".to_string()),
            is_system_app: false,
            aliases: Vec::new(),
        },
        ScannedApplication {
            name: "Calculator".to_string(),
            version: "11.0".to_string(),
            path: "/System/Applications/Calculator.app".into(),
            bundle_id: None,
            is_system_app: true,
            aliases: Vec::new(),
        },
    ];
    assert_eq!(
        format_scan_lines(&apps, OutputStyle::Plain),
        vec![
            "Editor 2.1.0 /Applications/Editor.app".to_string(),
            "Calculator 11.0 /System/Applications/Calculator.app (system)".to_string(),
        ]
    );
    assert_eq!(
        format_scan_lines(&[], OutputStyle::Plain),
        vec!["No applications found".to_string()]
    );
}

#[test]
fn empty_inventory_names_the_identity() {
    let entries: Vec<InventoryEntry> = Vec::new();
    assert_eq!(
        format_inventory_lines(&entries, "alice", OutputStyle::Plain),
        vec!["No applications recorded for alice".to_string()]
    );
}

#[test]
fn status_codes_follow_terminal_events_and_rejections() {
    assert_eq!(CliStatus::Success.code(), 0);
    assert_eq!(CliStatus::Failed.code(), 1);
    assert_eq!(CliStatus::Rejected.code(), 2);

    let done = ProgressEvent::completed("Uninstalled Editor");
    assert_eq!(CliStatus::from_terminal(&done), CliStatus::Success);
    let failed = ProgressEvent::error(ErrorKind::Timeout, None);
    assert_eq!(CliStatus::from_terminal(&failed), CliStatus::Failed);

    assert_eq!(
        CliStatus::from_rejection(&RequestError::EmptyTarget),
        CliStatus::Rejected
    );
    assert_eq!(
        CliStatus::from_rejection(&RequestError::Setup(anyhow::anyhow!("disk full"))),
        CliStatus::Failed
    );
}

#[test]
fn rejection_messages_include_their_causes() {
    let err = RequestError::Setup(anyhow::anyhow!("disk full"));
    assert_eq!(
        describe_error_chain(&err),
        "failed to prepare state directories: disk full"
    );
}

#[test]
fn detect_shell_from_env_reads_the_shell_basename() {
    assert_eq!(
        detect_shell_from_env(Some("/bin/zsh")),
        Some(CliCompletionShell::Zsh)
    );
    assert_eq!(
        detect_shell_from_env(Some("/usr/local/bin/pwsh")),
        Some(CliCompletionShell::Powershell)
    );
    assert_eq!(detect_shell_from_env(Some("/bin/tcsh")), None);
    assert_eq!(detect_shell_from_env(None), None);
}

#[test]
fn explicit_completion_shell_wins_over_environment() {
    assert_eq!(
        resolve_completion_shell(Some(CliCompletionShell::Fish), Some("/bin/bash"))
            .expect("must resolve"),
        CliCompletionShell::Fish
    );
    assert_eq!(
        resolve_completion_shell(None, Some("/bin/bash")).expect("must resolve"),
        CliCompletionShell::Bash
    );
    assert!(resolve_completion_shell(None, Some("/bin/tcsh")).is_err());
}

#[test]
fn completion_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must write completion script");
    let script = String::from_utf8(output).expect("script must be utf-8");
    assert!(script.contains("appkeep"));
    assert!(script.contains("uninstall"));
}

#[test]
fn flags_override_configured_locations() {
    let mut settings = Settings::default();
    settings.package_store = Some("/srv/packages".to_string());
    let global = GlobalArgs {
        applications_dir: Some("/Users/alice/Applications".into()),
        ..GlobalArgs::default()
    };

    apply_cli_overrides(&mut settings, &global);

    assert_eq!(
        settings.applications_dir,
        Path::new("/Users/alice/Applications")
    );
    assert_eq!(settings.package_store.as_deref(), Some("/srv/packages"));
}

#[test]
fn settings_come_from_config_file_then_flags() {
    let workspace = Workspace::new();
    let config = workspace.root.path().join("config.toml");
    fs::write(
        &config,
        "applications_dir = \"/from/config\"\ncommand_retries = 5\n",
    )
    .expect("must write config");
    let global = GlobalArgs {
        config: Some(config.clone()),
        applications_dir: Some("/from/flag".into()),
        ..GlobalArgs::default()
    };
    let layout = appkeep_installer::StateLayout::new(workspace.path("prefix"));

    let settings = resolve_settings(&global, &layout).expect("must resolve settings");

    assert_eq!(settings.applications_dir, Path::new("/from/flag"));
    assert_eq!(settings.command_retries, 5);
    assert_eq!(settings.config_path.as_deref(), Some(config.as_path()));
}

#[tokio::test]
async fn install_command_deploys_and_records_the_application() {
    let workspace = Workspace::new();
    write_editor_zip(&workspace.root.path().join("packages").join("Editor.zip"));

    let status = run_cli(workspace.parse(&["install", "Editor.zip"]))
        .await
        .expect("install must run");

    assert_eq!(status, CliStatus::Success);
    assert!(workspace
        .root
        .path()
        .join("Applications/Editor.app/Contents/Info.plist")
        .is_file());

    let cli = workspace.parse(&["list"]);
    let orchestrator = build_orchestrator(&cli.global).expect("must build orchestrator");
    let entries = orchestrator
        .inventory(DEFAULT_IDENTITY)
        .await
        .expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Editor");
    assert_eq!(entries[0].version, "2.1.0");

    let status = run_cli(workspace.parse(&["list", "--json"]))
        .await
        .expect("list must run");
    assert_eq!(status, CliStatus::Success);
}

#[tokio::test]
async fn missing_package_exits_as_an_operational_failure() {
    let workspace = Workspace::new();

    let status = run_cli(workspace.parse(&["install", "Ghost.zip"]))
        .await
        .expect("install must run");

    assert_eq!(status, CliStatus::Failed);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_work() {
    let workspace = Workspace::new();

    let status = run_cli(workspace.parse(&["install", "Editor.exe"]))
        .await
        .expect("install must run");
    assert_eq!(status, CliStatus::Rejected);

    let status = run_cli(workspace.parse(&["uninstall", "   "]))
        .await
        .expect("uninstall must run");
    assert_eq!(status, CliStatus::Rejected);

    let status = run_cli(workspace.parse(&["list", "--identity", "../escape"])).await;
    assert!(status.is_err(), "invalid identity must fail the listing");
}
