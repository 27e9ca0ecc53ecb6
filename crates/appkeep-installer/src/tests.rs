use super::*;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use appkeep_core::{ArchiveKind, ErrorKind, InventoryEntry, ProgressEvent, KEEPALIVE_FRAME};
use appkeep_store::{FsPackageStore, InventoryStore, MemoryInventoryStore};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Notify};

type Script = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

struct ScriptedRunner {
    invocations: Mutex<Vec<String>>,
    script: Script,
}

impl ScriptedRunner {
    fn new(script: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    fn succeeding() -> Arc<Self> {
        Self::new(|_| CommandOutput::success(""))
    }

    fn invocations(&self) -> Vec<String> {
        self.invocations.lock().expect("invocations lock").clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run_once(
        &self,
        spec: &CommandSpec,
        _timeout: Duration,
        _ctx: &OperationContext,
    ) -> Result<CommandOutput, CommandError> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(spec.to_string());
        Ok((self.script)(spec))
    }
}

fn spec_arg(spec: &CommandSpec, index: usize) -> PathBuf {
    PathBuf::from(&spec.args[index])
}

fn last_arg(spec: &CommandSpec) -> PathBuf {
    PathBuf::from(spec.args.last().expect("command must have args"))
}

#[derive(Default)]
struct FakeProcesses {
    rows: Mutex<Vec<ProcessRow>>,
    alive: Mutex<HashSet<u32>>,
    stubborn: HashSet<u32>,
    quit_supported: bool,
    signals: Mutex<Vec<(u32, Signal)>>,
    quits: Mutex<Vec<QuitTarget>>,
}

impl FakeProcesses {
    fn with_process(self, pid: u32, command: &str) -> Self {
        self.rows.lock().expect("rows lock").push(ProcessRow {
            pid,
            command: command.to_string(),
        });
        self.alive.lock().expect("alive lock").insert(pid);
        self
    }

    fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().expect("signals lock").clone()
    }
}

#[async_trait]
impl ProcessControl for FakeProcesses {
    async fn list_processes(
        &self,
        _ctx: &OperationContext,
    ) -> Result<Vec<ProcessRow>, CommandError> {
        let alive = self.alive.lock().expect("alive lock").clone();
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .iter()
            .filter(|row| alive.contains(&row.pid))
            .cloned()
            .collect())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().expect("alive lock").contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        self.signals.lock().expect("signals lock").push((pid, signal));
        if !self.stubborn.contains(&pid) {
            self.alive.lock().expect("alive lock").remove(&pid);
        }
        Ok(())
    }

    async fn request_quit(
        &self,
        target: &QuitTarget,
        _ctx: &OperationContext,
    ) -> Result<bool, CommandError> {
        self.quits.lock().expect("quits lock").push(target.clone());
        Ok(self.quit_supported)
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn send(&self, event: ProgressEvent) -> bool {
        self.events.lock().expect("events lock").push(event);
        true
    }
}

/// Cancels the operation when the given stage percent is reported.
struct CancellingSink {
    ctx: OperationContext,
    at_percent: u8,
    recorded: RecordingSink,
}

#[async_trait]
impl ProgressSink for CancellingSink {
    async fn send(&self, event: ProgressEvent) -> bool {
        if event.percent() == Some(self.at_percent) && !event.is_terminal() {
            self.ctx.cancel(CancelReason::Requested);
        }
        self.recorded.send(event).await
    }
}

/// Parks the operation on its first event until released.
#[derive(Default)]
struct GatedSink {
    started: AtomicBool,
    entered: Notify,
    release: Notify,
    recorded: RecordingSink,
}

#[async_trait]
impl ProgressSink for GatedSink {
    async fn send(&self, event: ProgressEvent) -> bool {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.recorded.send(event).await
    }
}

struct FailingWriter;

impl AsyncWrite for FailingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct Fixture {
    root: TempDir,
    runner: Arc<ScriptedRunner>,
    processes: Arc<FakeProcesses>,
    orchestrator: Orchestrator,
}

impl Fixture {
    fn apps_dir(&self) -> PathBuf {
        self.root.path().join("Applications")
    }

    fn system_dir(&self) -> PathBuf {
        self.root.path().join("System").join("Applications")
    }

    fn home(&self) -> PathBuf {
        self.root.path().join("home")
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.path().join("packages")
    }

    fn reconciler(&self) -> &InventoryReconciler {
        &self.orchestrator.env().reconciler
    }

    /// Rebuilds the orchestrator around a process table that can only be
    /// described once the fixture's paths exist.
    fn with_processes(self, processes: FakeProcesses) -> Self {
        let processes = Arc::new(processes);
        let env = OperationEnv {
            processes: processes.clone(),
            ..self.orchestrator.env().clone()
        };
        Self {
            orchestrator: Orchestrator::new(env),
            processes,
            ..self
        }
    }
}

fn test_settings(root: &Path) -> Settings {
    let apps = root.join("Applications");
    let system = root.join("System").join("Applications");
    Settings {
        applications_dir: apps.clone(),
        scan_dirs: vec![apps, system.clone()],
        system_dirs: vec![system],
        home_dir: Some(root.join("home")),
        package_store: None,
        operation_deadline: Duration::from_secs(60),
        command_timeout: Duration::from_secs(5),
        command_retries: 0,
        command_retry_delay: Duration::from_millis(1),
        keepalive_interval: Duration::ZERO,
        cancel_poll_interval: Duration::from_millis(10),
        terminate_wait: Duration::from_millis(1),
        placeholder_fallback: true,
        config_path: None,
    }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedRunner::succeeding(), FakeProcesses::default(), |_| {})
}

fn fixture_with(
    runner: Arc<ScriptedRunner>,
    processes: FakeProcesses,
    adjust: impl FnOnce(&mut Settings),
) -> Fixture {
    let root = tempfile::tempdir().expect("must create temp dir");
    let mut settings = test_settings(root.path());
    adjust(&mut settings);
    fs::create_dir_all(&settings.applications_dir).expect("must create apps dir");
    let packages_dir = root.path().join("packages");
    fs::create_dir_all(&packages_dir).expect("must create packages dir");

    let processes = Arc::new(processes);
    let inventory: Arc<dyn InventoryStore> = Arc::new(MemoryInventoryStore::new());
    let env = OperationEnv {
        settings,
        layout: StateLayout::new(root.path().join("prefix")),
        runner: runner.clone(),
        processes: processes.clone(),
        packages: Arc::new(FsPackageStore::new(packages_dir)),
        reconciler: Arc::new(InventoryReconciler::new(inventory)),
    };
    Fixture {
        root,
        runner,
        processes,
        orchestrator: Orchestrator::new(env),
    }
}

fn info_plist(name: &str, bundle_id: &str, version: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n\t<key>CFBundleName</key>\n\t<string>{name}</string>\n\t<key>CFBundleIdentifier</key>\n\t<string>{bundle_id}</string>\n\t<key>CFBundleShortVersionString</key>\n\t<string>{version}</string>\n</dict>\n</plist>\n"
    )
}

fn write_bundle(dir: &Path, name: &str, bundle_id: &str, version: &str) -> PathBuf {
    let bundle = dir.join(format!("{name}.app"));
    let macos = bundle.join("Contents").join("MacOS");
    fs::create_dir_all(&macos).expect("must create bundle dirs");
    fs::write(
        bundle.join("Contents").join("Info.plist"),
        info_plist(name, bundle_id, version),
    )
    .expect("must write plist");
    fs::write(macos.join(name), "#!/bin/sh\n").expect("must write executable");
    bundle
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).expect("must create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o755);
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("must start zip entry");
        writer.write_all(contents).expect("must write zip entry");
    }
    writer.finish().expect("must finish zip");
}

fn editor_zip_entries() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (
            "Editor.app/Contents/Info.plist",
            info_plist("Editor", "com.example.editor", "2.1.0").into_bytes(),
        ),
        ("Editor.app/Contents/MacOS/Editor", b"#!/bin/sh\nexit 0\n".to_vec()),
    ]
}

fn publish_zip(fixture: &Fixture, key: &str, entries: &[(&str, Vec<u8>)]) {
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, contents)| (*name, contents.as_slice()))
        .collect();
    write_zip(&fixture.packages_dir().join(key), &borrowed);
}

fn assert_single_terminal(events: &[ProgressEvent]) {
    let terminal: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.is_terminal())
        .map(|(index, _)| index)
        .collect();
    assert_eq!(terminal, vec![events.len() - 1], "exactly one terminal event, last");
}

fn assert_monotonic(events: &[ProgressEvent]) {
    let percents: Vec<u8> = events.iter().filter_map(ProgressEvent::percent).collect();
    assert!(
        percents.windows(2).all(|pair| pair[0] <= pair[1]),
        "percents must never decrease: {percents:?}"
    );
}

fn decode_frames(bytes: &[u8]) -> Vec<ProgressEvent> {
    String::from_utf8_lossy(bytes)
        .split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .filter_map(|frame| {
            ProgressEvent::from_frame(&format!("{frame}\n\n")).expect("frame must decode")
        })
        .collect()
}

fn completion_details(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Completed { details, .. } => details.clone().expect("completion details"),
        other => panic!("expected completion, got {other:?}"),
    }
}

fn error_kind(event: &ProgressEvent) -> ErrorKind {
    match event {
        ProgressEvent::Error { kind, .. } => *kind,
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn zip_install_deploys_bundle_and_records_inventory() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor-2.1.0-arm64.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor-2.1.0-arm64.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();
    let ctx = orchestrator.new_context();

    let terminal = orchestrator.run_install(&request, &sink, &ctx).await;

    let details = completion_details(&terminal);
    assert_eq!(details["name"], "Editor");
    assert_eq!(details["degraded"], false);
    let events = sink.events();
    assert_single_terminal(&events);
    assert_monotonic(&events);
    assert_eq!(events.first().and_then(ProgressEvent::percent), Some(5));

    let bundle = fixture.apps_dir().join("Editor.app");
    assert!(bundle.join("Contents").join("Info.plist").exists());
    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Editor");
    assert_eq!(entries[0].version, "2.1.0");
    assert_eq!(entries[0].path, bundle.display().to_string());
    assert_eq!(entries[0].bundle_id.as_deref(), Some("com.example.editor"));

    let cached = orchestrator
        .env()
        .layout
        .download_path("Editor-2.1.0-arm64.zip", ArchiveKind::Zip);
    assert!(cached.exists(), "package must stay in the download cache");
    let sha = events.iter().find_map(|event| match event {
        ProgressEvent::Progress {
            details: Some(details),
            ..
        } => details.get("sha256").cloned(),
        _ => None,
    });
    assert_eq!(sha, Some(details["sha256"].clone()));
}

#[tokio::test]
async fn repeated_install_keeps_one_inventory_entry() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor-2.1.0.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor-2.1.0.zip")
        .expect("request must validate");

    for _ in 0..2 {
        let sink = RecordingSink::default();
        let terminal = orchestrator
            .run_install(&request, &sink, &orchestrator.new_context())
            .await;
        assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");
    }

    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert!(fixture.apps_dir().join("Editor.app").exists());
}

#[tokio::test]
async fn zip_without_bundle_installs_deterministic_placeholder() {
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let fixture = fixture_with(
            ScriptedRunner::new(|_| CommandOutput::failure(1, "unsupported")),
            FakeProcesses::default(),
            |_| {},
        );
        publish_zip(
            &fixture,
            "Editor-3.0.zip",
            &[("README.txt", b"no bundle here".to_vec())],
        );
        let orchestrator = &fixture.orchestrator;
        let request = orchestrator
            .validate_install("alice", "Editor-3.0.zip")
            .expect("request must validate");
        let sink = RecordingSink::default();

        let terminal = orchestrator
            .run_install(&request, &sink, &orchestrator.new_context())
            .await;

        let details = completion_details(&terminal);
        assert_eq!(details["degraded"], true);
        assert_eq!(details["placeholder"], true);
        assert_eq!(details["technique"], "placeholder");
        let bundle = fixture.apps_dir().join("Editor.app");
        let plist = fs::read_to_string(bundle.join("Contents").join("Info.plist"))
            .expect("placeholder plist must exist");
        assert!(read_bundle_info(&bundle).placeholder);
        assert!(bundle.join("Contents").join("MacOS").join("Editor").exists());

        let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, "3.0");
        assert!(fixture
            .runner
            .invocations()
            .iter()
            .any(|invocation| invocation.starts_with("ditto -x -k ")));
        snapshots.push(plist);
    }
    assert_eq!(snapshots[0], snapshots[1]);
}

#[tokio::test]
async fn placeholder_disabled_reports_no_bundle_found() {
    let fixture = fixture_with(
        ScriptedRunner::new(|_| CommandOutput::failure(1, "unsupported")),
        FakeProcesses::default(),
        |settings| settings.placeholder_fallback = false,
    );
    publish_zip(&fixture, "Editor.zip", &[("README.txt", b"nothing".to_vec())]);
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();

    let terminal = orchestrator
        .run_install(&request, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::NoBundleFound);
    assert_single_terminal(&sink.events());
    assert!(!fixture.apps_dir().join("Editor.app").exists());
    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert!(entries.is_empty());
}

#[tokio::test]
async fn reinstall_without_bundle_keeps_previous_copy_and_inventory() {
    let fixture = fixture_with(
        ScriptedRunner::new(|_| CommandOutput::failure(1, "unsupported")),
        FakeProcesses::default(),
        |settings| settings.placeholder_fallback = false,
    );
    publish_zip(&fixture, "Editor-2.1.0.zip", &editor_zip_entries());
    publish_zip(
        &fixture,
        "Editor-3.0.zip",
        &[("README.txt", b"no bundle here".to_vec())],
    );
    let orchestrator = &fixture.orchestrator;
    let first = orchestrator
        .validate_install("alice", "Editor-2.1.0.zip")
        .expect("request must validate");
    let terminal = orchestrator
        .run_install(&first, &RecordingSink::default(), &orchestrator.new_context())
        .await;
    assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");

    let second = orchestrator
        .validate_install("alice", "Editor-3.0.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();
    let terminal = orchestrator
        .run_install(&second, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::NoBundleFound);
    assert_single_terminal(&sink.events());
    let bundle = fixture.apps_dir().join("Editor.app");
    assert!(bundle.join("Contents").join("Info.plist").exists());
    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, "2.1.0");
    assert_eq!(entries[0].path, bundle.display().to_string());
}

#[tokio::test]
async fn reinstall_cancelled_while_copying_leaves_no_bundle_or_stale_entry() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");
    let terminal = orchestrator
        .run_install(&request, &RecordingSink::default(), &orchestrator.new_context())
        .await;
    assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");

    let ctx = orchestrator.new_context();
    let sink = CancellingSink {
        ctx: ctx.clone(),
        at_percent: InstallStage::Copying.percent(),
        recorded: RecordingSink::default(),
    };
    let terminal = orchestrator.run_install(&request, &sink, &ctx).await;

    assert_eq!(error_kind(&terminal), ErrorKind::Cancelled);
    let events = sink.recorded.events();
    assert_single_terminal(&events);
    assert_eq!(
        events.iter().filter_map(ProgressEvent::percent).max(),
        Some(InstallStage::Copying.percent())
    );
    assert!(!fixture.apps_dir().join("Editor.app").exists());
    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert!(entries.is_empty(), "{entries:?}");
}

#[tokio::test]
async fn install_over_copy_that_will_not_stop_completes_degraded() {
    let fixture = fixture();
    let previous = write_bundle(&fixture.apps_dir(), "Editor", "com.example.editor", "1.0.0");
    let command = format!("{}/Contents/MacOS/Editor", previous.display());
    let fixture = fixture.with_processes(
        FakeProcesses {
            stubborn: HashSet::from([808]),
            ..FakeProcesses::default()
        }
        .with_process(808, &command),
    );
    publish_zip(&fixture, "Editor-2.1.0.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor-2.1.0.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();

    let terminal = orchestrator
        .run_install(&request, &sink, &orchestrator.new_context())
        .await;

    let details = completion_details(&terminal);
    assert_eq!(details["degraded"], true);
    let notes: Vec<String> = details["notes"]
        .as_array()
        .expect("degraded install must carry notes")
        .iter()
        .filter_map(|note| note.as_str().map(str::to_string))
        .collect();
    assert!(
        notes.iter().any(|note| note.starts_with("stop running copy:")),
        "{notes:?}"
    );
    assert!(fixture
        .processes
        .signals()
        .contains(&(808, Signal::Kill)));
    assert_single_terminal(&sink.events());
    let entries = fixture.reconciler().entries("alice").await.expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, "2.1.0");
}

#[tokio::test]
async fn operations_on_the_same_application_run_one_at_a_time() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let install = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");
    let uninstall = orchestrator
        .validate_uninstall("alice", "Editor", Privilege::Standard)
        .expect("request must validate");
    let gated = GatedSink::default();
    let waiting = RecordingSink::default();
    let install_ctx = orchestrator.new_context();

    let (installed, ()) = tokio::join!(
        orchestrator.run_install(&install, &gated, &install_ctx),
        async {
            gated.entered.notified().await;
            let blocked = tokio::time::timeout(
                Duration::from_millis(100),
                orchestrator.run_uninstall(&uninstall, &waiting, &orchestrator.new_context()),
            )
            .await;
            assert!(blocked.is_err(), "uninstall must wait for the install");
            assert!(waiting.events().is_empty());
            gated.release.notify_one();
        },
    );
    assert!(matches!(installed, ProgressEvent::Completed { .. }), "{installed:?}");
    assert!(waiting.events().is_empty());

    let sink = RecordingSink::default();
    let terminal = orchestrator
        .run_uninstall(&uninstall, &sink, &orchestrator.new_context())
        .await;
    assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");
    assert!(!fixture.apps_dir().join("Editor.app").exists());
}

#[tokio::test]
async fn missing_package_reports_invalid_package() {
    let fixture = fixture();
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Ghost-1.0.dmg")
        .expect("request must validate");
    let sink = RecordingSink::default();

    let terminal = orchestrator
        .run_install(&request, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::InvalidPackage);
    match &terminal {
        ProgressEvent::Error { message, .. } => {
            assert_eq!(message, ErrorKind::InvalidPackage.user_message())
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_install_ends_with_single_cancelled_event() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();
    let ctx = orchestrator.new_context();
    ctx.cancel(CancelReason::Requested);

    let terminal = orchestrator.run_install(&request, &sink, &ctx).await;

    assert_eq!(error_kind(&terminal), ErrorKind::Cancelled);
    assert_eq!(sink.events(), vec![terminal]);
    assert!(!fixture.apps_dir().join("Editor.app").exists());
}

#[tokio::test]
async fn expired_deadline_reports_cancelled_naming_the_deadline() {
    let fixture = fixture();
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");
    let sink = RecordingSink::default();
    let ctx = OperationContext::with_poll_interval(Duration::ZERO, Duration::from_millis(5));

    let terminal = orchestrator.run_install(&request, &sink, &ctx).await;

    assert_eq!(error_kind(&terminal), ErrorKind::Cancelled);
    assert_eq!(ctx.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    match &terminal {
        ProgressEvent::Error { message, .. } => {
            assert!(message.contains("deadline exceeded"), "{message}")
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn streamed_install_writes_frames_ending_in_completed() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor.zip", &editor_zip_entries());
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_install("alice", "Editor.zip")
        .expect("request must validate");

    let (_peer, closed) = watch::channel(false);
    let summary = orchestrator
        .stream_install(&request, Vec::new(), orchestrator.new_context(), Some(closed))
        .await;

    let bytes = summary.writer.expect("writer must be returned");
    let events = decode_frames(&bytes);
    assert_single_terminal(&events);
    assert_monotonic(&events);
    assert_eq!(events.last(), Some(&summary.terminal));
    assert!(matches!(summary.terminal, ProgressEvent::Completed { .. }));
}

fn seed_entry(name: &str, path: &Path) -> InventoryEntry {
    InventoryEntry {
        name: name.to_string(),
        version: "1.0".to_string(),
        path: path.display().to_string(),
        bundle_id: None,
        is_system_app: false,
        installed_at_unix: 10,
        last_checked_at_unix: 10,
    }
}

#[tokio::test]
async fn uninstall_by_alias_removes_bundle_auxiliary_data_and_inventory() {
    let fixture = fixture();
    let apps = fixture.apps_dir();
    let code = write_bundle(&apps, "Visual Studio Code", "com.microsoft.VSCode", "1.90.0");
    let editor = write_bundle(&apps, "Editor", "com.example.editor", "2.1.0");
    let command = format!("{}/Contents/MacOS/Electron --type=renderer", code.display());
    let fixture = fixture.with_processes(FakeProcesses::default().with_process(4242, &command));

    let home = fixture.home();
    let preferences = home.join("Library/Preferences");
    let support = home.join("Library/Application Support/Visual Studio Code");
    let caches = home.join("Library/Caches/com.other.app");
    fs::create_dir_all(&preferences).expect("must create preferences");
    fs::write(preferences.join("com.microsoft.VSCode.plist"), "prefs").expect("must write prefs");
    fs::create_dir_all(&support).expect("must create support dir");
    fs::create_dir_all(&caches).expect("must create unrelated cache");

    let reconciler = fixture.reconciler();
    reconciler
        .record_install("alice", seed_entry("Visual Studio Code", &code))
        .await
        .expect("must seed");
    reconciler
        .record_install("alice", seed_entry("Editor", &editor))
        .await
        .expect("must seed");

    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_uninstall("alice", "vscode", Privilege::Standard)
        .expect("request must validate");
    let sink = RecordingSink::default();
    let terminal = orchestrator
        .run_uninstall(&request, &sink, &orchestrator.new_context())
        .await;

    let details = completion_details(&terminal);
    assert_eq!(details["strategy"], "alias");
    assert_eq!(details["auxiliary_removed"], 2);
    assert_eq!(details["removed_entries"], 1);
    assert_single_terminal(&sink.events());
    assert_monotonic(&sink.events());

    assert!(!code.exists());
    assert!(editor.exists());
    assert_eq!(fixture.processes.signals(), vec![(4242, Signal::Terminate)]);
    assert!(!preferences.join("com.microsoft.VSCode.plist").exists());
    assert!(!support.exists());
    assert!(caches.exists());

    let names: Vec<String> = orchestrator
        .scan(&orchestrator.new_context())
        .await
        .expect("scan must succeed")
        .into_iter()
        .map(|app| app.name)
        .collect();
    assert_eq!(names, vec!["Editor".to_string()]);
    let entries = reconciler.entries("alice").await.expect("must read inventory");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Editor");
}

#[tokio::test]
async fn installed_then_uninstalled_application_is_gone_from_scan_and_inventory() {
    let fixture = fixture();
    publish_zip(&fixture, "Editor-2.1.0.zip", &editor_zip_entries());
    let viewer = write_bundle(&fixture.apps_dir(), "Viewer", "com.example.viewer", "1.0.0");
    let orchestrator = &fixture.orchestrator;
    let install = orchestrator
        .validate_install("alice", "Editor-2.1.0.zip")
        .expect("request must validate");
    let terminal = orchestrator
        .run_install(&install, &RecordingSink::default(), &orchestrator.new_context())
        .await;
    assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");

    let uninstall = orchestrator
        .validate_uninstall("alice", "Editor-2.1.0.zip", Privilege::Standard)
        .expect("request must validate");
    let terminal = orchestrator
        .run_uninstall(&uninstall, &RecordingSink::default(), &orchestrator.new_context())
        .await;
    assert!(matches!(terminal, ProgressEvent::Completed { .. }), "{terminal:?}");

    let scanned: Vec<String> = orchestrator
        .scan(&orchestrator.new_context())
        .await
        .expect("scan must succeed")
        .into_iter()
        .map(|app| app.name)
        .collect();
    assert_eq!(scanned, vec!["Viewer".to_string()]);
    assert!(fixture
        .reconciler()
        .entries("alice")
        .await
        .expect("must read inventory")
        .is_empty());

    let refreshed = orchestrator
        .refresh_inventory("alice", &orchestrator.new_context())
        .await
        .expect("refresh must succeed");
    let names: Vec<&str> = refreshed.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, vec!["Viewer"]);
    assert_eq!(refreshed[0].path, viewer.display().to_string());
}

#[tokio::test]
async fn uninstall_unknown_application_is_not_found_and_changes_nothing() {
    let fixture = fixture();
    let editor = write_bundle(&fixture.apps_dir(), "Editor", "com.example.editor", "2.1.0");
    fixture
        .reconciler()
        .record_install("alice", seed_entry("Editor", &editor))
        .await
        .expect("must seed");
    let before = fixture.reconciler().entries("alice").await.expect("must read");

    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_uninstall("alice", "Nonexistent", Privilege::Elevated)
        .expect("request must validate");
    let sink = RecordingSink::default();
    let terminal = orchestrator
        .run_uninstall(&request, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::NotFound);
    assert!(editor.exists());
    let after = fixture.reconciler().entries("alice").await.expect("must read");
    assert_eq!(before, after);
}

#[tokio::test]
async fn uninstall_refuses_system_application_without_elevation() {
    let fixture = fixture();
    let calculator = write_bundle(&fixture.system_dir(), "Calculator", "com.apple.calculator", "11.0");
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_uninstall("alice", "Calculator", Privilege::Standard)
        .expect("request must validate");
    let sink = RecordingSink::default();

    let terminal = orchestrator
        .run_uninstall(&request, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::PermissionDenied);
    assert!(calculator.exists());
}

#[tokio::test]
async fn uninstall_fails_when_application_keeps_running() {
    let fixture = fixture();
    let editor = write_bundle(&fixture.apps_dir(), "Editor", "com.example.editor", "2.1.0");
    let command = format!("{}/Contents/MacOS/Editor", editor.display());
    let fixture = fixture.with_processes(
        FakeProcesses {
            stubborn: HashSet::from([777]),
            quit_supported: true,
            ..FakeProcesses::default()
        }
        .with_process(777, &command),
    );
    let orchestrator = &fixture.orchestrator;
    let request = orchestrator
        .validate_uninstall("alice", "Editor", Privilege::Standard)
        .expect("request must validate");
    let sink = RecordingSink::default();

    let terminal = orchestrator
        .run_uninstall(&request, &sink, &orchestrator.new_context())
        .await;

    assert_eq!(error_kind(&terminal), ErrorKind::ProcessRunning);
    assert!(editor.exists());
    assert_eq!(
        fixture.processes.quits.lock().expect("quits lock").clone(),
        vec![QuitTarget::BundleId("com.example.editor".to_string())]
    );
    assert_eq!(
        fixture.processes.signals(),
        vec![(777, Signal::Terminate), (777, Signal::Kill)]
    );
}

#[tokio::test]
async fn terminate_stops_cooperative_process_with_terminate_signal() {
    let processes = FakeProcesses::default().with_process(31, "/usr/bin/editor");
    let descriptor = ProcessDescriptor {
        pid: 31,
        command: "/usr/bin/editor".to_string(),
        bundle_path: None,
        bundle_id: None,
    };
    let ctx = OperationContext::new(Duration::from_secs(5));
    let policy = TerminationPolicy {
        attempts: 3,
        wait: Duration::from_millis(1),
    };

    terminate_processes(&processes, &[descriptor], None, policy, &ctx)
        .await
        .expect("process must stop");

    assert_eq!(processes.signals(), vec![(31, Signal::Terminate)]);
}

#[tokio::test]
async fn find_processes_matches_bundle_path_and_bundle_id() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let renamed = write_bundle(root.path(), "Code Insiders", "com.microsoft.VSCode", "1.0");
    let processes = FakeProcesses::default()
        .with_process(10, "/Applications/Editor.app/Contents/MacOS/Editor")
        .with_process(11, "/Applications/Editor.app/Contents/Frameworks/Helper.app/Contents/MacOS/Helper --type=gpu")
        .with_process(12, &format!("{}/Contents/MacOS/Electron", renamed.display()))
        .with_process(13, "/usr/libexec/editord")
        .with_process(14, "/usr/bin/vim notes.txt")
        .with_process(std::process::id(), "/Applications/Editor.app/Contents/MacOS/Editor");
    let ctx = OperationContext::new(Duration::from_secs(5));

    let by_name = find_processes(
        &processes,
        &ProcessQuery {
            name: "Editor".to_string(),
            bundle_id: None,
        },
        &ctx,
    )
    .await
    .expect("lookup must succeed");
    let pids: Vec<u32> = by_name.iter().map(|process| process.pid).collect();
    assert_eq!(pids, vec![10, 11, 13]);

    let by_id = find_processes(
        &processes,
        &ProcessQuery {
            name: "Visual Studio Code".to_string(),
            bundle_id: Some("com.microsoft.vscode".to_string()),
        },
        &ctx,
    )
    .await
    .expect("lookup must succeed");
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].pid, 12);
    assert_eq!(by_id[0].bundle_id.as_deref(), Some("com.microsoft.VSCode"));
}

#[test]
fn process_table_parsing_skips_malformed_rows() {
    let rows = parse_process_table("  1 /sbin/launchd\n  abc nope\n 52 /Applications/Editor.app/Contents/MacOS/Editor -psn\n77\n");
    assert_eq!(
        rows,
        vec![
            ProcessRow {
                pid: 1,
                command: "/sbin/launchd".to_string(),
            },
            ProcessRow {
                pid: 52,
                command: "/Applications/Editor.app/Contents/MacOS/Editor -psn".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn progress_channel_clamps_percent_and_allows_one_terminal() {
    let ctx = OperationContext::new(Duration::from_secs(5));
    let channel = ProgressChannel::open(Vec::new(), ctx.clone(), Duration::ZERO);

    assert!(channel.send(ProgressEvent::progress(40, "downloading")).await);
    assert!(channel.send(ProgressEvent::progress(20, "late report")).await);
    assert!(channel.send(ProgressEvent::completed("done")).await);
    assert!(!channel.send(ProgressEvent::progress(90, "after terminal")).await);
    assert!(
        !channel
            .send(ProgressEvent::error(ErrorKind::Unknown, None))
            .await
    );

    let bytes = channel.close().await.expect("writer must be returned");
    let events = decode_frames(&bytes);
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].percent(), Some(40));
    assert_single_terminal(&events);
    assert!(!ctx.is_cancelled());
}

#[tokio::test]
async fn progress_channel_synthesizes_completion_on_close() {
    let ctx = OperationContext::new(Duration::from_secs(5));
    let channel = ProgressChannel::open(Vec::new(), ctx, Duration::ZERO);
    assert!(channel.send(ProgressEvent::progress(50, "halfway")).await);

    let bytes = channel.close().await.expect("writer must be returned");
    let events = decode_frames(&bytes);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], ProgressEvent::Completed { .. }));
}

#[tokio::test]
async fn progress_channel_write_failure_cancels_operation() {
    let ctx = OperationContext::new(Duration::from_secs(5));
    let channel = ProgressChannel::open(FailingWriter, ctx.clone(), Duration::ZERO);

    assert!(!channel.send(ProgressEvent::progress(5, "starting")).await);
    assert!(!channel.is_attached().await);
    assert!(ctx.is_cancelled());
    assert_eq!(ctx.cancel_reason(), Some(CancelReason::Disconnected));
    assert_eq!(ctx.cancellation_error().kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn progress_channel_cancels_when_idle_peer_goes_away() {
    let ctx = OperationContext::with_poll_interval(Duration::from_secs(5), Duration::from_millis(10));
    let (peer, closed) = watch::channel(false);
    let mut channel = ProgressChannel::open(Vec::new(), ctx.clone(), Duration::ZERO);
    channel.watch_peer(closed);
    assert!(channel.send(ProgressEvent::progress(10, "downloading")).await);

    drop(peer);
    tokio::time::timeout(Duration::from_millis(500), ctx.cancelled())
        .await
        .expect("dropped peer must cancel without a write");

    assert_eq!(ctx.cancel_reason(), Some(CancelReason::Disconnected));
    assert!(!channel.is_attached().await);
    assert!(!channel.send(ProgressEvent::progress(20, "too late")).await);
    let bytes = channel.close().await.expect("writer must be returned");
    assert_eq!(decode_frames(&bytes).len(), 1);
}

#[tokio::test]
async fn progress_channel_cancels_when_peer_reports_closed() {
    let ctx = OperationContext::new(Duration::from_secs(5));
    let (peer, closed) = watch::channel(false);
    let mut channel = ProgressChannel::open(Vec::new(), ctx.clone(), Duration::ZERO);
    channel.watch_peer(closed);

    peer.send(true).expect("watcher must be listening");
    tokio::time::timeout(Duration::from_millis(500), ctx.cancelled())
        .await
        .expect("closed peer must cancel");

    assert_eq!(ctx.cancel_reason(), Some(CancelReason::Disconnected));
    assert_eq!(
        ctx.cancellation_error().message,
        "the operation was cancelled: progress stream disconnected"
    );
}

#[tokio::test]
async fn progress_channel_writes_keepalive_frames_while_idle() {
    let ctx = OperationContext::new(Duration::from_secs(5));
    let channel = ProgressChannel::open(Vec::new(), ctx, Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(90)).await;

    let bytes = channel.close().await.expect("writer must be returned");
    let text = String::from_utf8(bytes).expect("frames are utf-8");
    assert!(text.starts_with(KEEPALIVE_FRAME), "{text}");
    let events = decode_frames(text.as_bytes());
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ProgressEvent::Completed { .. }));
}

#[tokio::test]
async fn run_command_retries_non_zero_exit_then_succeeds() {
    let attempts = Arc::new(Mutex::new(0_u32));
    let counter = attempts.clone();
    let runner = ScriptedRunner::new(move |_| {
        let mut count = counter.lock().expect("counter lock");
        *count += 1;
        if *count < 3 {
            CommandOutput::failure(1, "busy")
        } else {
            CommandOutput::success("ok")
        }
    });
    let ctx = OperationContext::new(Duration::from_secs(5));
    let options = RunOptions::once(Duration::from_secs(1)).with_retries(2, Duration::from_millis(1));

    let output = run_command(runner.as_ref(), &CommandSpec::new("hdiutil").arg("info"), options, &ctx)
        .await
        .expect("third attempt must succeed");

    assert_eq!(output.stdout, "ok");
    assert_eq!(runner.invocations().len(), 3);
}

#[tokio::test]
async fn run_command_classifies_exhausted_failures() {
    let runner = ScriptedRunner::new(|_| CommandOutput::failure(1, "rm: Operation not permitted"));
    let ctx = OperationContext::new(Duration::from_secs(5));
    let options = RunOptions::once(Duration::from_secs(1)).with_retries(1, Duration::from_millis(1));

    let err = run_command(runner.as_ref(), &CommandSpec::new("rm").arg("x"), options, &ctx)
        .await
        .expect_err("command must fail");

    assert!(matches!(err, CommandError::NonZeroExit { code: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(runner.invocations().len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn host_runner_captures_output_and_exit_code() {
    let ctx = OperationContext::new(Duration::from_secs(10));
    let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);

    let output = HostCommandRunner
        .run_once(&spec, Duration::from_secs(5), &ctx)
        .await
        .expect("command must run");

    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.stderr.trim(), "err");
}

#[cfg(unix)]
#[tokio::test]
async fn host_runner_times_out_and_kills_command() {
    let ctx = OperationContext::with_poll_interval(Duration::from_secs(10), Duration::from_millis(20));
    let started = std::time::Instant::now();

    let err = HostCommandRunner
        .run_once(&CommandSpec::new("sleep").arg("5"), Duration::from_millis(200), &ctx)
        .await
        .expect_err("command must time out");

    assert!(matches!(err, CommandError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[cfg(unix)]
#[tokio::test]
async fn host_runner_stops_when_operation_is_cancelled() {
    let ctx = OperationContext::with_poll_interval(Duration::from_secs(10), Duration::from_millis(20));
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel(CancelReason::Requested);
    });
    let started = std::time::Instant::now();

    let err = HostCommandRunner
        .run_once(&CommandSpec::new("sleep").arg("5"), Duration::from_secs(10), &ctx)
        .await
        .expect_err("command must be cancelled");

    assert!(matches!(err, CommandError::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn spawn_failure_for_missing_tool_is_file_not_found() {
    let err = CommandError::Spawn {
        command: "7z x".to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
    };
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
}

#[test]
fn matcher_chain_prefers_stronger_strategies() {
    let candidates = [
        "Visual Studio Code",
        "Editor Pro",
        "Editor",
        "zoom.us",
        "Parallels Desktop",
        "Adobe Photoshop 2024",
    ];
    let matchers = uninstall_matchers();
    let cases = [
        ("editor", 2, MatchStrategy::Exact),
        ("vscode", 0, MatchStrategy::Alias),
        ("zoom", 3, MatchStrategy::Alias),
        ("Studio", 0, MatchStrategy::Substring),
        ("VisualStudio Code", 0, MatchStrategy::WhitespaceInsensitive),
        ("parallels-installer", 4, MatchStrategy::WordFragment),
        ("photoshop-cc", 5, MatchStrategy::WordFragment),
    ];
    for (query, index, strategy) in cases {
        let resolution = resolve(query, &candidates, &matchers)
            .unwrap_or_else(|| panic!("{query} must resolve"));
        assert_eq!(resolution.index, index, "{query}");
        assert_eq!(resolution.strategy, strategy, "{query}");
        assert_eq!(resolution.confidence, strategy.confidence());
    }
    assert!(resolve("terminal", &candidates, &matchers).is_none());
}

#[test]
fn aliases_are_listed_for_display_names() {
    assert_eq!(canonical_alias("VS Code"), Some("Visual Studio Code"));
    let aliases = aliases_for("Visual Studio Code");
    assert!(aliases.contains(&"vscode"));
    assert!(aliases.contains(&"code"));
    assert!(aliases_for("Editor").is_empty());
}

#[test]
fn bundle_search_escalates_from_shallow_to_glob() {
    let root = tempfile::tempdir().expect("must create temp dir");

    let shallow = root.path().join("shallow");
    write_bundle(&shallow.join("Editor 2"), "Editor", "com.example.editor", "2.0");
    let found = find_application_bundles(&shallow).expect("must find bundle");
    assert_eq!(found.depth, SearchDepth::Shallow);

    let deep = root.path().join("deep");
    write_bundle(&deep.join("a/b/c"), "Editor", "com.example.editor", "2.0");
    write_bundle(&deep.join("__MACOSX/a/b"), "Editor", "com.example.editor", "2.0");
    let found = find_application_bundles(&deep).expect("must find bundle");
    assert_eq!(found.depth, SearchDepth::Recursive);
    assert_eq!(found.candidates, vec![deep.join("a/b/c/Editor.app")]);

    let upper = root.path().join("upper");
    let bundle = upper.join("x/y/Editor.APP");
    fs::create_dir_all(bundle.join("Contents")).expect("must create bundle");
    let found = find_application_bundles(&upper).expect("must find bundle");
    assert_eq!(found.depth, SearchDepth::Glob);
    assert_eq!(found.candidates, vec![bundle]);

    assert!(find_application_bundles(&root.path().join("missing")).is_none());
}

#[test]
fn select_bundle_prefers_matching_name() {
    let candidates = vec![
        PathBuf::from("/tmp/x/Uninstaller.app"),
        PathBuf::from("/tmp/x/Sub/Editor.app"),
    ];
    assert_eq!(
        select_bundle(&candidates, "Editor"),
        Some(PathBuf::from("/tmp/x/Sub/Editor.app"))
    );
    assert_eq!(
        select_bundle(&candidates, "Other"),
        Some(PathBuf::from("/tmp/x/Uninstaller.app"))
    );
}

#[test]
fn info_plist_fields_are_read_from_xml() {
    let info = parse_info_plist(&info_plist("Fish &amp; Chips", "com.example.fish", "4.2"));
    assert_eq!(info.name.as_deref(), Some("Fish & Chips"));
    assert_eq!(info.bundle_id.as_deref(), Some("com.example.fish"));
    assert_eq!(info.version(), Some("4.2"));
    assert!(!info.placeholder);
}

#[tokio::test]
async fn corrupt_zip_tries_every_technique_before_placeholder() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("Editor.zip");
    fs::write(&archive, b"not a zip").expect("must write archive");
    let work_dir = root.path().join("work");
    let runner = ScriptedRunner::new(|_| CommandOutput::failure(1, "cannot open"));
    let ctx = OperationContext::new(Duration::from_secs(5));
    let env = ExtractionEnv {
        runner: runner.as_ref(),
        ctx: &ctx,
        options: RunOptions::once(Duration::from_secs(1)),
    };
    let chain = ArchiveChain::for_kind(ArchiveKind::Zip);
    assert_eq!(
        chain.technique_names(),
        vec!["zip", "ditto", "unzip", "tar", "raw-copy"]
    );

    let located = chain
        .locate(&archive, &work_dir, "Editor", true, &env)
        .await
        .expect("placeholder must be produced");

    assert!(located.is_placeholder());
    assert_eq!(located.technique, "placeholder");
    assert!(located.path.ends_with("placeholder/Editor.app"));
    let programs: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.split(' ').next().unwrap_or("").to_string())
        .collect();
    assert_eq!(programs, vec!["ditto", "unzip", "tar"]);
}

#[tokio::test]
async fn disk_image_bundle_is_copied_out_and_image_detached() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("Editor.dmg");
    fs::write(&archive, b"dmg").expect("must write archive");
    let runner = ScriptedRunner::new(|spec| {
        if spec.program == "hdiutil" && spec.args[0] == "attach" {
            write_bundle(&last_arg(spec), "Editor", "com.example.editor", "2.1.0");
            fs::create_dir_all(last_arg(spec).join("Extras")).expect("must create extras");
            return CommandOutput::success("");
        }
        if spec.program == "hdiutil" && spec.args[0] == "detach" {
            return CommandOutput::failure(16, "resource busy");
        }
        CommandOutput::failure(1, "unexpected")
    });
    let ctx = OperationContext::new(Duration::from_secs(5));
    let env = ExtractionEnv {
        runner: runner.as_ref(),
        ctx: &ctx,
        options: RunOptions::once(Duration::from_secs(1)),
    };

    let located = ArchiveChain::for_kind(ArchiveKind::DiskImage)
        .locate(&archive, &root.path().join("work"), "Editor", true, &env)
        .await
        .expect("bundle must be located");

    assert_eq!(located.technique, "hdiutil-attach");
    assert!(!located.is_placeholder());
    assert!(located.path.join("Contents/Info.plist").exists());
    assert!(located.path.ends_with("payload/Editor.app"));
    assert_eq!(located.notes.len(), 1, "failed detach is reported, not fatal");
    let invocations = runner.invocations();
    assert!(invocations[0].starts_with("hdiutil attach "));
    assert!(invocations[0].contains("-readonly -nobrowse -mountpoint"));
    assert!(invocations[1].starts_with("hdiutil detach "));
    assert!(invocations[2].ends_with(" -force"));
}

#[tokio::test]
async fn cancelled_disk_image_extraction_still_detaches_image() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("Editor.dmg");
    fs::write(&archive, b"dmg").expect("must write archive");
    let ctx = OperationContext::new(Duration::from_secs(5));
    let attach_ctx = ctx.clone();
    let runner = ScriptedRunner::new(move |spec| {
        if spec.program == "hdiutil" && spec.args[0] == "attach" {
            write_bundle(&last_arg(spec), "Editor", "com.example.editor", "2.1.0");
            attach_ctx.cancel(CancelReason::Requested);
        }
        CommandOutput::success("")
    });
    let env = ExtractionEnv {
        runner: runner.as_ref(),
        ctx: &ctx,
        options: RunOptions::once(Duration::from_secs(1)),
    };

    let located = ArchiveChain::for_kind(ArchiveKind::DiskImage)
        .locate(&archive, &root.path().join("work"), "Editor", true, &env)
        .await;

    match located {
        Ok(located) => panic!("expected cancellation, located {}", located.path.display()),
        Err(err) => assert_eq!(err.kind, ErrorKind::Cancelled),
    }
    let invocations = runner.invocations();
    assert!(invocations[0].starts_with("hdiutil attach "));
    assert_eq!(
        invocations
            .iter()
            .filter(|invocation| invocation.starts_with("hdiutil detach "))
            .count(),
        1,
        "{invocations:?}"
    );
    assert_eq!(invocations.len(), 2, "no further technique runs after cancel");
}

#[tokio::test]
async fn package_payload_is_expanded_when_pkgutil_fails() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("Editor.pkg");
    fs::write(&archive, b"xar!").expect("must write archive");
    let runner = ScriptedRunner::new(|spec| {
        match spec.program.to_string_lossy().as_ref() {
            "xar" => {
                let container = last_arg(spec);
                fs::create_dir_all(container.join("Editor.pkg")).expect("must create component");
                fs::write(container.join("Editor.pkg").join("Payload"), b"cpio")
                    .expect("must write payload");
                CommandOutput::success("")
            }
            "tar" => {
                write_bundle(
                    &last_arg(spec).join("Applications"),
                    "Editor",
                    "com.example.editor",
                    "2.1.0",
                );
                assert!(spec_arg(spec, 1).ends_with("Payload"));
                CommandOutput::success("")
            }
            _ => CommandOutput::failure(1, "pkgutil: cannot expand"),
        }
    });
    let ctx = OperationContext::new(Duration::from_secs(5));
    let env = ExtractionEnv {
        runner: runner.as_ref(),
        ctx: &ctx,
        options: RunOptions::once(Duration::from_secs(1)),
    };

    let located = ArchiveChain::for_kind(ArchiveKind::InstallerPackage)
        .locate(&archive, &root.path().join("work"), "Editor", true, &env)
        .await
        .expect("bundle must be located");

    assert_eq!(located.technique, "xar");
    assert_eq!(located.depth, Some(SearchDepth::Recursive));
    assert!(runner.invocations()[0].starts_with("pkgutil --expand-full "));
}

#[tokio::test]
async fn unreadable_disk_image_is_no_bundle_found() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("Broken.dmg");
    fs::write(&archive, b"junk").expect("must write archive");
    let runner = ScriptedRunner::new(|_| CommandOutput::failure(1, "image not recognized"));
    let ctx = OperationContext::new(Duration::from_secs(5));
    let env = ExtractionEnv {
        runner: runner.as_ref(),
        ctx: &ctx,
        options: RunOptions::once(Duration::from_secs(1)),
    };

    let err = ArchiveChain::for_kind(ArchiveKind::DiskImage)
        .locate(&archive, &root.path().join("work"), "Broken", true, &env)
        .await
        .expect_err("nothing can open the image");

    assert_eq!(err.kind, ErrorKind::NoBundleFound);
    assert_eq!(runner.invocations().len(), 3);
}

#[cfg(unix)]
#[test]
fn relaxed_permissions_let_the_owner_run_every_file() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().expect("must create temp dir");
    let bundle = write_bundle(root.path(), "Editor", "com.example.editor", "2.1.0");
    let executable = bundle.join("Contents/MacOS/Editor");
    let plist = bundle.join("Contents/Info.plist");
    fs::set_permissions(&executable, fs::Permissions::from_mode(0o444))
        .expect("must strip execute bit");
    fs::set_permissions(bundle.join("Contents/MacOS"), fs::Permissions::from_mode(0o500))
        .expect("must restrict directory");

    fs_utils::relax_permissions(&bundle).expect("must relax permissions");

    let mode = |path: &Path| fs::metadata(path).expect("must stat").permissions().mode();
    assert_eq!(mode(&executable) & 0o700, 0o700);
    assert_eq!(mode(&executable) & 0o044, 0o044, "group and other bits are kept");
    assert_eq!(mode(&plist) & 0o700, 0o700);
    assert_eq!(mode(&bundle.join("Contents/MacOS")) & 0o700, 0o700);
}

#[test]
fn zip_extraction_skips_resource_forks() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let archive = root.path().join("bundle.zip");
    write_zip(
        &archive,
        &[
            ("Editor.app/Contents/MacOS/Editor", b"#!/bin/sh\n"),
            ("__MACOSX/Editor.app/._Info.plist", b"fork"),
        ],
    );
    let ctx = OperationContext::new(Duration::from_secs(5));
    let dst = root.path().join("out");

    let written = extract_zip_archive(&archive, &dst, &ctx).expect("zip must extract");

    assert_eq!(written, 1);
    assert!(dst.join("Editor.app/Contents/MacOS/Editor").exists());
    assert!(!dst.join("__MACOSX").exists());
}

#[tokio::test]
async fn reconciler_replaces_by_key_and_keeps_first_seen_time_on_rescan() {
    let reconciler = InventoryReconciler::new(Arc::new(MemoryInventoryStore::new()));
    let mut first = seed_entry("Editor", Path::new("/Applications/Editor.app"));
    first.installed_at_unix = 100;
    reconciler.record_install("alice", first).await.expect("must record");
    let mut second = seed_entry("editor", Path::new("/Applications/editor.app"));
    second.version = "2.0".to_string();
    reconciler.record_install("alice", second).await.expect("must record");

    let entries = reconciler.entries("alice").await.expect("must read");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, "2.0");

    let mut rescanned = seed_entry("Editor", Path::new("/Applications/editor.app"));
    rescanned.installed_at_unix = 999;
    let replaced = reconciler
        .replace_from_scan("alice", vec![rescanned])
        .await
        .expect("must replace");
    assert_eq!(replaced[0].installed_at_unix, 10);

    let removed = reconciler
        .record_uninstall("alice", "Unrelated", Path::new("/nowhere"))
        .await
        .expect("must reconcile");
    assert_eq!(removed, 0);
    let removed = reconciler
        .record_uninstall("alice", "EDITOR", Path::new("/nowhere"))
        .await
        .expect("must reconcile");
    assert_eq!(removed, 1);
    assert!(reconciler.entries("alice").await.expect("must read").is_empty());
}

#[test]
fn scanner_reports_nested_system_and_aliased_bundles_once() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let apps = root.path().join("Applications");
    let system = root.path().join("System/Applications");
    write_bundle(&apps, "Visual Studio Code", "com.microsoft.VSCode", "1.90.0");
    write_bundle(&apps.join("Adobe Photoshop 2024"), "Adobe Photoshop 2024", "com.adobe.Photoshop", "25.0");
    write_bundle(&system, "Calculator", "com.apple.calculator", "11.0");
    write_bundle(&system, "Visual Studio Code", "com.microsoft.VSCode", "0.1");
    fs::create_dir_all(apps.join("Broken.app")).expect("must create bundle without plist");
    let scanner = Scanner::new(vec![apps.clone(), system.clone()], vec![system.clone()]);

    let found = scanner.scan();

    let names: Vec<&str> = found.iter().map(|app| app.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Adobe Photoshop 2024", "Broken", "Visual Studio Code", "Calculator"]
    );
    let code = &found[2];
    assert_eq!(code.version, "1.90.0");
    assert!(!code.is_system_app);
    assert!(code.aliases.contains(&"vscode".to_string()));
    assert_eq!(found[1].version, PLACEHOLDER_VERSION);
    assert!(found[3].is_system_app);
}

#[test]
fn auxiliary_cleanup_matches_bundle_id_and_name() {
    assert!(is_auxiliary_match("com.example.editor.plist", "Editor", Some("com.example.editor")));
    assert!(is_auxiliary_match("com.example.editor.savedState", "Editor", Some("com.example.editor")));
    assert!(is_auxiliary_match("Editor", "Editor", None));
    assert!(is_auxiliary_match("editor.plist", "Editor", None));
    assert!(!is_auxiliary_match("com.example.editorial.plist", "Editor", Some("com.example.editor")));
    assert!(!is_auxiliary_match("Editor Pro", "Editor", None));
}

#[test]
fn uninstall_target_name_accepts_keys_and_bundle_names() {
    let request = |target: &str| UninstallRequest {
        identity: "alice".to_string(),
        target: target.to_string(),
        privilege: Privilege::Standard,
    };
    assert_eq!(request("Editor-2.1.0-arm64.dmg").target_name(), "Editor");
    assert_eq!(request("/Applications/Editor.app/").target_name(), "Editor");
    assert_eq!(request("Visual Studio Code").target_name(), "Visual Studio Code");
}

#[test]
fn request_validation_maps_to_client_errors() {
    let fixture = fixture();
    let orchestrator = &fixture.orchestrator;

    let err = orchestrator
        .validate_install("alice", "notes.txt")
        .expect_err("unsupported extension must be rejected");
    assert_eq!(err.http_status(), 400);
    let err = orchestrator
        .validate_install("../etc", "Editor.zip")
        .expect_err("unsafe identity must be rejected");
    assert_eq!(err.http_status(), 400);
    let err = orchestrator
        .validate_uninstall("alice", "   ", Privilege::Standard)
        .expect_err("empty target must be rejected");
    assert_eq!(err.http_status(), 400);
}

#[test]
fn settings_apply_file_then_environment() {
    let mut settings = Settings::default();
    apply_config_text(
        &mut settings,
        "applications_dir = \"/opt/apps\"\noperation_deadline = \"2m\"\ncommand_retries = 5\nplaceholder_fallback = false\n",
    )
    .expect("config must parse");
    assert_eq!(settings.applications_dir, PathBuf::from("/opt/apps"));
    assert_eq!(settings.operation_deadline, Duration::from_secs(120));
    assert_eq!(settings.command_retries, 5);
    assert_eq!(settings.command_timeout, Duration::from_secs(300));

    let env: HashMap<&str, &str> = HashMap::from([
        (APPLICATIONS_DIR_ENV, "/srv/apps"),
        (PLACEHOLDER_FALLBACK_ENV, "yes"),
    ]);
    apply_env_overrides(&mut settings, |name| env.get(name).map(|value| value.to_string()))
        .expect("overrides must apply");
    assert_eq!(settings.applications_dir, PathBuf::from("/srv/apps"));
    assert!(settings.placeholder_fallback);

    assert!(apply_config_text(&mut settings, "unknown_key = 1\n").is_err());
    let bad: HashMap<&str, &str> = HashMap::from([(PLACEHOLDER_FALLBACK_ENV, "maybe")]);
    assert!(apply_env_overrides(&mut settings, |name| bad.get(name).map(|v| v.to_string())).is_err());
}

#[test]
fn download_percent_maps_bytes_into_range() {
    assert_eq!(download_percent(10, 40, 0, 100), 10);
    assert_eq!(download_percent(10, 40, 50, 100), 25);
    assert_eq!(download_percent(10, 40, 100, 100), 40);
    assert_eq!(download_percent(10, 40, 500, 100), 40);
    assert_eq!(download_percent(10, 40, 5, 0), 10);
}

#[test]
fn layout_keys_download_cache_by_digest() {
    let layout = StateLayout::new("/tmp/appkeep-test");
    let path = layout.download_path("vendor/Editor-2.1.0.dmg", ArchiveKind::DiskImage);
    assert!(path.starts_with("/tmp/appkeep-test/cache/downloads"));
    let file_name = path.file_name().and_then(|name| name.to_str()).expect("file name");
    assert_eq!(file_name.len(), 64 + ".dmg".len());
    assert!(file_name.ends_with(".dmg"));
    assert_eq!(
        path,
        layout.download_path("vendor/Editor-2.1.0.dmg", ArchiveKind::DiskImage)
    );
}

#[test]
fn work_dir_is_removed_on_drop() {
    let root = tempfile::tempdir().expect("must create temp dir");
    let layout = StateLayout::new(root.path());
    layout.ensure_base_dirs().expect("must create dirs");
    let work = layout.make_work_dir("install").expect("must create work dir");
    let path = work.path().to_path_buf();
    assert!(path.starts_with(layout.tmp_state_dir()));
    drop(work);
    assert!(!path.exists());
}
