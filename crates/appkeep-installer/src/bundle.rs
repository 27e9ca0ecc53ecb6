use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use appkeep_core::name_key;
use globset::GlobBuilder;
use serde::Serialize;
use walkdir::WalkDir;

use crate::fs_utils::set_executable;
use crate::matching::{resolve, verification_matchers};

pub const PLACEHOLDER_VERSION: &str = "unknown";
const PLACEHOLDER_MARKER_KEY: &str = "AppkeepPlaceholder";
const RECURSIVE_MAX_DEPTH: usize = 10;
const GLOB_MAX_DEPTH: usize = 12;

/// Fields read from a bundle's `Contents/Info.plist`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleInfo {
    pub name: Option<String>,
    pub short_version: Option<String>,
    pub build_version: Option<String>,
    pub bundle_id: Option<String>,
    pub executable: Option<String>,
    pub placeholder: bool,
}

impl BundleInfo {
    pub fn version(&self) -> Option<&str> {
        self.short_version
            .as_deref()
            .or(self.build_version.as_deref())
    }
}

pub fn info_plist_path(bundle: &Path) -> PathBuf {
    bundle.join("Contents").join("Info.plist")
}

/// Reads the XML form of a bundle's Info.plist. Binary plists and missing
/// files yield an empty [`BundleInfo`].
pub fn read_bundle_info(bundle: &Path) -> BundleInfo {
    match fs::read(info_plist_path(bundle)) {
        Ok(bytes) if !bytes.starts_with(b"bplist") => {
            parse_info_plist(&String::from_utf8_lossy(&bytes))
        }
        _ => BundleInfo::default(),
    }
}

pub fn parse_info_plist(text: &str) -> BundleInfo {
    BundleInfo {
        name: plist_string(text, "CFBundleDisplayName")
            .or_else(|| plist_string(text, "CFBundleName")),
        short_version: plist_string(text, "CFBundleShortVersionString"),
        build_version: plist_string(text, "CFBundleVersion"),
        bundle_id: plist_string(text, "CFBundleIdentifier"),
        executable: plist_string(text, "CFBundleExecutable"),
        placeholder: text.contains(&format!("<key>{PLACEHOLDER_MARKER_KEY}</key>")),
    }
}

fn plist_string(text: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{key}</key>");
    let rest = &text[text.find(&marker)? + marker.len()..];
    let rest = rest.trim_start().strip_prefix("<string>")?;
    let value = &rest[..rest.find("</string>")?];
    let value = unescape_xml(value.trim());
    (!value.is_empty()).then_some(value)
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn is_app_bundle(path: &Path) -> bool {
    has_app_extension(path) && path.is_dir()
}

fn has_app_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case("app"))
}

fn is_skipped_dir_name(name: &str) -> bool {
    name == "__MACOSX" || name.starts_with("._")
}

/// Display name of a bundle: its directory name without the `.app` suffix.
pub fn bundle_display_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// How far the bundle search had to escalate before it found something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchDepth {
    Shallow,
    Recursive,
    Glob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSearch {
    pub candidates: Vec<PathBuf>,
    pub depth: SearchDepth,
}

/// Looks for `.app` bundles under `root`, escalating from a shallow listing
/// to a full walk and finally to a case-insensitive glob that follows links.
/// Never descends into a bundle once found.
pub fn find_application_bundles(root: &Path) -> Option<BundleSearch> {
    let searches: [(SearchDepth, fn(&Path) -> Vec<PathBuf>); 3] = [
        (SearchDepth::Shallow, shallow_search),
        (SearchDepth::Recursive, recursive_search),
        (SearchDepth::Glob, glob_search),
    ];
    for (depth, search) in searches {
        let candidates = search(root);
        if !candidates.is_empty() {
            tracing::debug!(
                root = %root.display(),
                ?depth,
                count = candidates.len(),
                "found bundles"
            );
            return Some(BundleSearch { candidates, depth });
        }
    }
    None
}

fn shallow_search(root: &Path) -> Vec<PathBuf> {
    if is_app_bundle(root) {
        return vec![root.to_path_buf()];
    }
    let mut found = BTreeSet::new();
    for entry in sorted_children(root) {
        if is_app_bundle(&entry) {
            found.insert(entry);
            continue;
        }
        let skipped = entry
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_skipped_dir_name);
        if skipped || !entry.is_dir() {
            continue;
        }
        for nested in sorted_children(&entry) {
            if is_app_bundle(&nested) {
                found.insert(nested);
            }
        }
    }
    found.into_iter().collect()
}

fn sorted_children(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    children.sort();
    children
}

fn recursive_search(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(RECURSIVE_MAX_DEPTH)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_skipped_dir_name(&name) {
            walker.skip_current_dir();
            continue;
        }
        if entry.path().extension().and_then(|value| value.to_str()) == Some("app") {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    found
}

fn glob_search(root: &Path) -> Vec<PathBuf> {
    let matcher = match GlobBuilder::new("**/*.app")
        .case_insensitive(true)
        .literal_separator(false)
        .build()
    {
        Ok(glob) => glob.compile_matcher(),
        Err(err) => {
            tracing::debug!(error = %err, "invalid bundle glob");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(true)
        .max_depth(GLOB_MAX_DEPTH)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if is_skipped_dir_name(&entry.file_name().to_string_lossy()) {
            walker.skip_current_dir();
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.is_match(relative) {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    found
}

/// Picks the candidate whose name best matches `search_name`, falling back
/// to the shallowest candidate.
pub fn select_bundle(candidates: &[PathBuf], search_name: &str) -> Option<PathBuf> {
    let names: Vec<String> = candidates.iter().map(|path| bundle_display_name(path)).collect();
    if let Some(resolution) = resolve(search_name, &names, &verification_matchers()) {
        return candidates.get(resolution.index).cloned();
    }
    candidates
        .iter()
        .min_by_key(|path| (path.components().count(), path.as_os_str().len()))
        .cloned()
}

/// Writes a minimal runnable bundle named `<name>.app` under `dir`: an
/// Info.plist carrying a placeholder marker and a no-op executable.
pub fn write_placeholder_bundle(dir: &Path, name: &str, version: Option<&str>) -> Result<PathBuf> {
    let bundle = dir.join(format!("{name}.app"));
    let macos_dir = bundle.join("Contents").join("MacOS");
    fs::create_dir_all(&macos_dir)
        .with_context(|| format!("failed to create {}", macos_dir.display()))?;

    let executable = if name_key(name).is_empty() {
        "placeholder".to_string()
    } else {
        name.to_string()
    };
    let identifier = format!("local.appkeep.placeholder.{}", name_key(name));
    let version = version.unwrap_or(PLACEHOLDER_VERSION);
    let plist = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>CFBundleName</key>
	<string>{name}</string>
	<key>CFBundleIdentifier</key>
	<string>{identifier}</string>
	<key>CFBundleShortVersionString</key>
	<string>{version}</string>
	<key>CFBundleExecutable</key>
	<string>{executable}</string>
	<key>CFBundlePackageType</key>
	<string>APPL</string>
	<key>{PLACEHOLDER_MARKER_KEY}</key>
	<true/>
</dict>
</plist>
"#,
        name = escape_xml(name),
        identifier = escape_xml(&identifier),
        version = escape_xml(version),
        executable = escape_xml(&executable),
    );
    let plist_path = info_plist_path(&bundle);
    fs::write(&plist_path, plist)
        .with_context(|| format!("failed to write {}", plist_path.display()))?;

    let executable_path = macos_dir.join(&executable);
    fs::write(&executable_path, "#!/bin/sh\nexit 0\n")
        .with_context(|| format!("failed to write {}", executable_path.display()))?;
    set_executable(&executable_path)?;

    let pkg_info = bundle.join("Contents").join("PkgInfo");
    fs::write(&pkg_info, "APPL????")
        .with_context(|| format!("failed to write {}", pkg_info.display()))?;
    Ok(bundle)
}
