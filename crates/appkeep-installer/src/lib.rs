mod artifact;
mod bundle;
mod command;
mod context;
mod download;
mod env;
mod error;
mod fs_utils;
mod install;
mod inventory;
mod layout;
mod matching;
mod outcome;
mod process;
mod progress;
mod scan;
mod service;
mod settings;
mod uninstall;

pub use artifact::{
    build_7z_extract_command, build_dmg_attach_command, build_dmg_detach_command,
    build_ditto_extract_command, build_pkg_expand_command, build_tar_extract_command,
    build_unzip_command, build_xar_extract_command, detach_disk_image, discover_payload_archives,
    extract_zip_archive, ArchiveChain, AttemptOutcome, BundleOrigin, ExtractionEnv,
    ExtractionTechnique, LocatedBundle,
};
pub use bundle::{
    bundle_display_name, find_application_bundles, is_app_bundle, parse_info_plist,
    read_bundle_info, select_bundle, write_placeholder_bundle, BundleInfo, BundleSearch,
    SearchDepth, PLACEHOLDER_VERSION,
};
pub use command::{
    run_command, CommandError, CommandOutput, CommandRunner, CommandSpec, HostCommandRunner,
    RunOptions,
};
pub use context::{CancelReason, OperationContext};
pub use download::{download_package, download_percent, DownloadedPackage};
pub use env::OperationEnv;
pub use error::{classify_io, OperationError};
pub use fs_utils::{copy_dir_recursive, current_unix_timestamp, remove_path};
pub use install::{verify_deployment, InstallReport, InstallRequest, InstallStage, Installer};
pub use inventory::InventoryReconciler;
pub use layout::{default_user_prefix, StateLayout, WorkDir};
pub use matching::{
    aliases_for, canonical_alias, resolve, uninstall_matchers, verification_matchers, Matcher,
    MatchStrategy, Resolution,
};
pub use outcome::{Degradations, Outcome};
pub use process::{
    build_process_list_command, build_quit_command, find_processes, parse_process_table,
    terminate_processes, HostProcessControl, ProcessControl, ProcessDescriptor, ProcessQuery,
    ProcessRow, QuitTarget, Signal, TerminationPolicy,
};
pub use progress::{emit, ProgressChannel, ProgressSink};
pub use scan::{build_plist_convert_command, inspect_bundle, ScannedApplication, Scanner};
pub use service::{Orchestrator, RequestError, StreamSummary};
pub use settings::{
    apply_config_text, apply_env_overrides, load_settings, Settings, APPLICATIONS_DIR_ENV,
    CONFIG_ENV, PACKAGE_STORE_ENV, PLACEHOLDER_FALLBACK_ENV,
};
pub use uninstall::{
    cleanup_auxiliary_data, is_auxiliary_match, Privilege, UninstallReport, UninstallRequest,
    UninstallStage, Uninstaller, AUXILIARY_DIRS,
};

#[cfg(test)]
mod tests;
