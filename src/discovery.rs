//! Extension discovery and the user extensions directory watcher.
//!
//! Extensions live in `{dir}/{folder}/manifest.json`. A folder whose manifest
//! cannot be read or parsed is logged and skipped, never an error.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, Debouncer, new_debouncer};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::extensions::{ExtensionManifest, HostDirectory, InstalledExtensionRecord};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Longer than a single write; package installs touch many files at once.
const WATCH_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to create extensions dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to watch extensions dir: {0}")]
    Watch(#[from] notify::Error),

    #[error("Extension watcher must be started inside a tokio runtime")]
    NoRuntime,
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// True if a relative path leaves its root via `..`, an absolute path, or a
/// drive prefix.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);
    if path.is_absolute() {
        return true;
    }
    path.components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

/// Drop entry points that point outside the extension folder.
fn sanitize_entries(manifest: &mut ExtensionManifest, folder: &str) {
    for (kind, entry) in [("host", &mut manifest.host), ("view", &mut manifest.view)] {
        if let Some(path) = entry.as_deref()
            && (path.is_empty() || is_path_escape(path))
        {
            tracing::warn!(extension = %folder, kind, entry = %path, "Ignoring entry point outside the extension folder");
            *entry = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Compatibility
// ---------------------------------------------------------------------------

/// Compare dotted numeric versions. Missing components count as zero; any
/// pre-release or build suffix is ignored.
fn parse_version(version: &str) -> Option<Vec<u64>> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next().unwrap_or(core);
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Whether an extension requiring `min_app_version` runs on `app_version`.
/// No requirement, or one that cannot be parsed, counts as compatible.
pub fn is_compatible(min_app_version: Option<&str>, app_version: &str) -> bool {
    let Some(required) = min_app_version else {
        return true;
    };
    let (Some(mut required), Some(mut current)) = (parse_version(required), parse_version(app_version)) else {
        tracing::warn!(required = %required, current = %app_version, "Unparseable version, assuming compatible");
        return true;
    };
    let len = required.len().max(current.len());
    required.resize(len, 0);
    current.resize(len, 0);
    current >= required
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Scan `dir` and build a record for every readable manifest. Records are
/// enabled by default; the directory decides the persisted flag.
pub fn discover_extensions(dir: &Path, bundled: bool) -> Vec<InstalledExtensionRecord> {
    if !dir.exists() {
        return Vec::new();
    }
    let root = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());

    let entries = match std::fs::read_dir(&root) {
        Ok(e) => e,
        Err(err) => {
            tracing::error!(dir = %root.display(), error = %err, "Failed to read extensions dir");
            return Vec::new();
        }
    };

    let app_version = env!("CARGO_PKG_VERSION");
    let mut records = Vec::new();

    for entry in entries.flatten() {
        let folder = entry.path();
        if !folder.is_dir() {
            continue;
        }
        let Some(folder_name) = folder.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if folder_name.starts_with('.') {
            continue;
        }

        let manifest_path = folder.join(MANIFEST_FILE);
        let data = match std::fs::read_to_string(&manifest_path) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(extension = %folder_name, error = %err, "Failed to read manifest.json");
                continue;
            }
        };
        let mut manifest: ExtensionManifest = match serde_json::from_str(&data) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(extension = %folder_name, error = %err, "Invalid manifest.json");
                continue;
            }
        };
        sanitize_entries(&mut manifest, &folder_name);

        let is_compatible = is_compatible(manifest.min_app_version.as_deref(), app_version);
        if !is_compatible {
            tracing::info!(extension = %folder_name, required = ?manifest.min_app_version, app_version, "Extension requires a newer app version");
        }

        let id = manifest_path.to_string_lossy().into_owned();
        let mut record = if bundled {
            InstalledExtensionRecord::bundled(id, manifest, folder)
        } else {
            InstalledExtensionRecord::user(id, manifest, folder)
        };
        record.is_compatible = is_compatible;
        records.push(record);
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Re-scan `dir` into `directory` whenever something under it changes. The
/// watch stops when the returned debouncer is dropped.
///
/// Must be called from within a tokio runtime; rescans are applied there.
pub fn start_extension_watcher(
    dir: PathBuf,
    directory: Arc<HostDirectory>,
) -> Result<Debouncer<RecommendedWatcher>, DiscoveryError> {
    let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
    std::fs::create_dir_all(&dir).map_err(|source| DiscoveryError::CreateDir {
        path: dir.clone(),
        source,
    })?;

    let rescans = spawn_rescan_sink(&runtime, dir.clone(), directory);
    let watched = dir.clone();
    let mut debouncer = new_debouncer(
        Duration::from_millis(WATCH_DEBOUNCE_MS),
        move |events: Result<Vec<DebouncedEvent>, notify::Error>| {
            let events = match events {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Extension watcher error");
                    return;
                }
            };
            let relevant = events.iter().any(|e| {
                matches!(e.kind, DebouncedEventKind::Any) && !is_hidden_change(&watched, &e.path)
            });
            if relevant && rescans.send(discover_extensions(&watched, false)).is_err() {
                tracing::debug!(dir = %watched.display(), "Runtime is gone, dropping rescan");
            }
        },
    )?;

    debouncer.watcher().watch(&dir, RecursiveMode::Recursive)?;
    tracing::info!(dir = %dir.display(), "Watching for extension changes");
    Ok(debouncer)
}

/// Apply rescans on the runtime. The notify callback runs on its own thread,
/// where the directory's debounced sync broadcast has no timer.
fn spawn_rescan_sink(
    runtime: &Handle,
    dir: PathBuf,
    directory: Arc<HostDirectory>,
) -> mpsc::UnboundedSender<Vec<InstalledExtensionRecord>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<InstalledExtensionRecord>>();
    runtime.spawn(async move {
        while let Some(records) = rx.recv().await {
            if directory.sync_user_records(records) {
                tracing::info!(dir = %dir.display(), "Extensions changed on disk");
            }
        }
        tracing::debug!(dir = %dir.display(), "Extension watcher stopped");
    });
    tx
}

/// Changes inside hidden top-level folders (editor swap dirs, `.git`).
fn is_hidden_change(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|relative| relative.components().next())
        .is_some_and(|first| first.as_os_str().to_string_lossy().starts_with('.'))
}
