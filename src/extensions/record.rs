use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::ProcessKind;

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The fields of an extension's `manifest.json` the shell consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    /// Host-process entry point, relative to the manifest folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// View-process entry point, relative to the manifest folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
}

impl ExtensionManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host: None,
            view: None,
            store_name: None,
            min_app_version: None,
        }
    }

    pub fn with_host(mut self, entry: impl Into<String>) -> Self {
        self.host = Some(entry.into());
        self
    }

    pub fn with_view(mut self, entry: impl Into<String>) -> Self {
        self.view = Some(entry.into());
        self
    }

    pub fn entry(&self, kind: ProcessKind) -> Option<&str> {
        match kind {
            ProcessKind::Host => self.host.as_deref(),
            ProcessKind::View => self.view.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Canonical metadata for one installed extension. Only the host creates or
/// mutates these; views hold copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledExtensionRecord {
    /// Absolute path of the manifest file.
    pub id: String,
    pub manifest: ExtensionManifest,
    /// Folder holding the manifest.
    pub absolute_path: PathBuf,
    pub is_bundled: bool,
    pub is_enabled: bool,
    pub is_compatible: bool,
    /// Bumped by the host on every enabled-flag change. An instance built
    /// from an older generation is torn down and rebuilt, so a disable and
    /// re-enable that land together still restart the extension.
    #[serde(default)]
    pub enable_generation: u64,
}

impl InstalledExtensionRecord {
    /// A user extension, enabled and compatible.
    pub fn user(id: impl Into<String>, manifest: ExtensionManifest, folder: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            manifest,
            absolute_path: folder.into(),
            is_bundled: false,
            is_enabled: true,
            is_compatible: true,
            enable_generation: 0,
        }
    }

    /// A bundled extension. Always enabled.
    pub fn bundled(id: impl Into<String>, manifest: ExtensionManifest, folder: impl Into<PathBuf>) -> Self {
        Self {
            is_bundled: true,
            ..Self::user(id, manifest, folder)
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Entry point for `kind`, resolved against the manifest folder.
    pub fn entry_point(&self, kind: ProcessKind) -> Option<PathBuf> {
        self.manifest
            .entry(kind)
            .map(|relative| self.absolute_path.join(relative))
    }

    /// Whether the coordinator of any process should load this record.
    pub fn is_loadable(&self) -> bool {
        self.is_bundled || (self.is_enabled && self.is_compatible)
    }
}

/// `id → record`, ordered so snapshots serialize deterministically.
pub type RecordMap = BTreeMap<String, InstalledExtensionRecord>;

/// Full record set plus the host revision that produced it. Views drop
/// snapshots older than the one they already hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    pub revision: u64,
    pub records: RecordMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_is_relative_to_folder() {
        let manifest = ExtensionManifest::new("pods", "1.0.0").with_view("dist/view.js");
        let record = InstalledExtensionRecord::user("/ext/pods/manifest.json", manifest, "/ext/pods");

        assert_eq!(
            record.entry_point(ProcessKind::View),
            Some(PathBuf::from("/ext/pods/dist/view.js"))
        );
        assert_eq!(record.entry_point(ProcessKind::Host), None);
    }

    #[test]
    fn manifest_parses_camel_case_fields() {
        let json = r#"{
            "name": "metrics",
            "version": "0.2.0",
            "host": "host.js",
            "storeName": "metrics-store",
            "minAppVersion": "1.0.0"
        }"#;
        let manifest: ExtensionManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.host.as_deref(), Some("host.js"));
        assert_eq!(manifest.view, None);
        assert_eq!(manifest.store_name.as_deref(), Some("metrics-store"));
        assert_eq!(manifest.min_app_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn loadable_rules() {
        let manifest = ExtensionManifest::new("x", "1");
        let mut user = InstalledExtensionRecord::user("x", manifest.clone(), "/x");
        assert!(user.is_loadable());
        user.is_enabled = false;
        assert!(!user.is_loadable());
        user.is_enabled = true;
        user.is_compatible = false;
        assert!(!user.is_loadable());

        let mut bundled = InstalledExtensionRecord::bundled("b", manifest, "/b");
        bundled.is_enabled = false;
        assert!(bundled.is_loadable());
    }
}
