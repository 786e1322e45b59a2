//! The contract extension authors implement, and how entry points are
//! mapped to constructors.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

use super::ProcessKind;
use super::record::InstalledExtensionRecord;
use super::registration::Registrar;
use crate::disposer::{Disposer, DisposerStack};

/// A live extension inside one process.
///
/// Every hook is optional. Errors (and panics) from hooks are caught and
/// logged by the coordinator; they never reach other extensions.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn activate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Contribute commands, categories, routes. Runs after every extension in
    /// the batch finished activating.
    fn register(&self, _registrar: &mut Registrar<'_>) {}

    async fn enable(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on disable, before the context's disposers.
    async fn deactivate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-instance handle passed to hooks.
pub struct ExtensionContext {
    pub id: String,
    pub name: String,
    pub version: String,
    pub process: ProcessKind,
    pub is_bundled: bool,
    disposers: DisposerStack,
}

impl ExtensionContext {
    pub(crate) fn new(record: &InstalledExtensionRecord, process: ProcessKind) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name().to_string(),
            version: record.version().to_string(),
            process,
            is_bundled: record.is_bundled,
            disposers: DisposerStack::new(),
        }
    }

    /// Run `disposer` when the extension is disabled. Disposers run newest
    /// first.
    pub fn on_dispose(&self, disposer: Disposer) {
        self.disposers.push(disposer);
    }

    pub(crate) fn disposers(&self) -> &DisposerStack {
        &self.disposers
    }
}

/// Builds an extension from its record.
pub type ExtensionFactory =
    Arc<dyn Fn(&InstalledExtensionRecord) -> anyhow::Result<Box<dyn Extension>> + Send + Sync>;

/// Maps a resolved entry point to the constructor behind it.
pub trait FactoryResolver: Send + Sync {
    fn resolve(
        &self,
        record: &InstalledExtensionRecord,
        kind: ProcessKind,
        entry: &Path,
    ) -> Option<ExtensionFactory>;
}

/// Factories registered at startup, looked up by extension name and process
/// kind. The entry point path only has to exist in the manifest.
#[derive(Default)]
pub struct FactoryTable {
    factories: DashMap<(String, ProcessKind), ExtensionFactory>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, kind: ProcessKind, factory: F)
    where
        F: Fn(&InstalledExtensionRecord) -> anyhow::Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.factories.insert((name.into(), kind), Arc::new(factory));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl FactoryResolver for FactoryTable {
    fn resolve(
        &self,
        record: &InstalledExtensionRecord,
        kind: ProcessKind,
        _entry: &Path,
    ) -> Option<ExtensionFactory> {
        self.factories
            .get(&(record.name().to_string(), kind))
            .map(|f| f.value().clone())
    }
}
