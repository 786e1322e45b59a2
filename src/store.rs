//! Persisted enable state for user extensions.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config;

pub const EXTENSIONS_STORE_FILE: &str = "extensions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExtension {
    pub enabled: bool,
    pub name: String,
}

/// `{ extensions: { id → { enabled, name } } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    #[serde(default)]
    pub extensions: BTreeMap<String, StoredExtension>,
}

/// Persistence collaborator for [`StoreState`].
pub trait ExtensionStore: Send + Sync {
    fn load(&self) -> StoreState;
    fn save(&self, state: &StoreState) -> anyhow::Result<()>;
}

/// `extensions.json` inside a config directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the shell's config directory.
    pub fn in_config_dir() -> Self {
        Self::new(config::config_dir())
    }
}

impl ExtensionStore for JsonFileStore {
    fn load(&self) -> StoreState {
        config::load_json_config(&self.dir, EXTENSIONS_STORE_FILE)
    }

    fn save(&self, state: &StoreState) -> anyhow::Result<()> {
        config::save_json_config(&self.dir, EXTENSIONS_STORE_FILE, state)
    }
}

/// Keeps the state in memory. Used by tests and the demo binary.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl ExtensionStore for MemoryStore {
    fn load(&self) -> StoreState {
        self.state.lock().clone()
    }

    fn save(&self, state: &StoreState) -> anyhow::Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoreState {
        let mut state = StoreState::default();
        state.extensions.insert(
            "/ext/a/manifest.json".into(),
            StoredExtension {
                enabled: false,
                name: "a".into(),
            },
        );
        state
    }

    #[test]
    fn json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.load(), StoreState::default());

        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
        assert!(dir.path().join(EXTENSIONS_STORE_FILE).exists());
    }

    #[test]
    fn json_store_uses_camel_case_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.save(&sample()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(EXTENSIONS_STORE_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["extensions"]["/ext/a/manifest.json"]["enabled"], false);
        assert_eq!(json["extensions"]["/ext/a/manifest.json"]["name"], "a");
    }

    #[test]
    fn memory_store_keeps_last_save() {
        let store = MemoryStore::new();
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
    }
}
