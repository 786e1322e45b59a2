use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::ProcessKind;
use super::instance::ExtensionInstance;
use super::record::InstalledExtensionRecord;
use super::runtime::FactoryResolver;

/// Per-process instance map plus the names known to have no entry point for
/// this process kind. Built at process start and handed to the coordinator.
#[derive(Default)]
pub struct InstanceTable {
    instances: DashMap<String, Arc<ExtensionInstance>>,
    no_instance: DashSet<String>,
}

impl InstanceTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ExtensionInstance>> {
        self.instances.get(id).map(|i| i.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.instances.iter().map(|i| i.key().clone()).collect()
    }

    pub fn instances(&self) -> Vec<Arc<ExtensionInstance>> {
        self.instances.iter().map(|i| i.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn is_marked(&self, name: &str) -> bool {
        self.no_instance.contains(name)
    }

    pub fn marked(&self) -> BTreeSet<String> {
        self.no_instance.iter().map(|n| n.key().clone()).collect()
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<ExtensionInstance>> {
        let removed = self.instances.remove(id).map(|(_, i)| i);
        if let Some(instance) = &removed {
            self.no_instance.remove(instance.name());
        }
        removed
    }

    /// Forget markers for extensions the directory no longer knows about.
    pub(crate) fn retain_marks(&self, known_names: &BTreeSet<&str>) {
        self.no_instance.retain(|name| known_names.contains(name.as_str()));
    }

    fn mark(&self, name: &str) {
        self.no_instance.insert(name.to_string());
    }
}

#[derive(Debug)]
pub enum Instantiation {
    /// A fresh instance, not yet activated.
    Created(Arc<ExtensionInstance>),
    /// This process already runs an instance for the record.
    Existing(Arc<ExtensionInstance>),
    /// The extension has no entry point for this process kind.
    NoEntryPoint,
    /// Constructor missing, failed or panicked. Logged; retried next time.
    Failed,
}

/// Turns records into instances for one process kind.
pub struct Instantiator {
    kind: ProcessKind,
    resolver: Arc<dyn FactoryResolver>,
    table: Arc<InstanceTable>,
}

impl Instantiator {
    pub fn new(kind: ProcessKind, resolver: Arc<dyn FactoryResolver>, table: Arc<InstanceTable>) -> Self {
        Self { kind, resolver, table }
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn instantiate(&self, record: &InstalledExtensionRecord) -> Instantiation {
        if let Some(existing) = self.table.get(&record.id) {
            return Instantiation::Existing(existing);
        }

        let Some(entry) = record.entry_point(self.kind) else {
            tracing::debug!(extension = %record.id, name = %record.name(), process = %self.kind, "No entry point for this process");
            self.table.mark(record.name());
            return Instantiation::NoEntryPoint;
        };

        let Some(factory) = self.resolver.resolve(record, self.kind, &entry) else {
            tracing::error!(
                extension = %record.id,
                name = %record.name(),
                version = %record.version(),
                entry = %entry.display(),
                "No constructor registered for entry point"
            );
            return Instantiation::Failed;
        };

        let extension = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(record))) {
            Ok(Ok(extension)) => extension,
            Ok(Err(e)) => {
                let error = format!("{e:#}");
                tracing::error!(
                    extension = %record.id,
                    name = %record.name(),
                    version = %record.version(),
                    entry = %entry.display(),
                    error = %error,
                    "Extension constructor failed"
                );
                return Instantiation::Failed;
            }
            Err(_) => {
                tracing::error!(
                    extension = %record.id,
                    name = %record.name(),
                    version = %record.version(),
                    entry = %entry.display(),
                    "Extension constructor panicked"
                );
                return Instantiation::Failed;
            }
        };

        match self.table.instances.entry(record.id.clone()) {
            Entry::Occupied(existing) => Instantiation::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                let instance = Arc::new(ExtensionInstance::new(record.clone(), self.kind, extension));
                slot.insert(instance.clone());
                self.table.no_instance.remove(record.name());
                tracing::debug!(extension = %record.id, name = %record.name(), process = %self.kind, "Extension instance created");
                Instantiation::Created(instance)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::record::ExtensionManifest;
    use crate::extensions::runtime::{Extension, FactoryTable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl Extension for Noop {}

    fn record(name: &str, manifest: ExtensionManifest) -> InstalledExtensionRecord {
        InstalledExtensionRecord::user(format!("/ext/{name}/manifest.json"), manifest, format!("/ext/{name}"))
    }

    fn setup(kind: ProcessKind) -> (Arc<FactoryTable>, Arc<InstanceTable>, Instantiator) {
        let factories = Arc::new(FactoryTable::new());
        let table = InstanceTable::new();
        let instantiator = Instantiator::new(kind, factories.clone(), table.clone());
        (factories, table, instantiator)
    }

    #[test]
    fn missing_entry_point_marks_the_name() {
        let (_, table, instantiator) = setup(ProcessKind::View);
        let host_only = record("metrics", ExtensionManifest::new("metrics", "1").with_host("host.js"));

        assert!(matches!(instantiator.instantiate(&host_only), Instantiation::NoEntryPoint));
        assert!(table.is_marked("metrics"));
        assert!(!table.contains(&host_only.id));
    }

    #[test]
    fn existing_instance_is_returned() {
        let (factories, table, instantiator) = setup(ProcessKind::Host);
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        factories.register("pods", ProcessKind::Host, move |_| {
            b.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Noop))
        });
        let pods = record("pods", ExtensionManifest::new("pods", "1").with_host("host.js"));

        assert!(matches!(instantiator.instantiate(&pods), Instantiation::Created(_)));
        assert!(matches!(instantiator.instantiate(&pods), Instantiation::Existing(_)));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn constructor_failure_is_retried_next_time() {
        let (factories, table, instantiator) = setup(ProcessKind::Host);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        factories.register("flaky", ProcessKind::Host, move |_| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first construction fails");
            }
            Ok(Box::new(Noop))
        });
        let flaky = record("flaky", ExtensionManifest::new("flaky", "1").with_host("host.js"));

        assert!(matches!(instantiator.instantiate(&flaky), Instantiation::Failed));
        assert!(!table.is_marked("flaky"));
        assert!(matches!(instantiator.instantiate(&flaky), Instantiation::Created(_)));
    }

    #[test]
    fn constructor_panic_is_contained() {
        let (factories, table, instantiator) = setup(ProcessKind::Host);
        factories.register("boom", ProcessKind::Host, |_| panic!("constructor exploded"));
        let boom = record("boom", ExtensionManifest::new("boom", "1").with_host("host.js"));

        assert!(matches!(instantiator.instantiate(&boom), Instantiation::Failed));
        assert!(table.is_empty());
    }

    #[test]
    fn unresolvable_entry_point_fails() {
        let (_, table, instantiator) = setup(ProcessKind::Host);
        let unknown = record("unknown", ExtensionManifest::new("unknown", "1").with_host("host.js"));

        assert!(matches!(instantiator.instantiate(&unknown), Instantiation::Failed));
        assert!(!table.is_marked("unknown"));
    }

    #[test]
    fn retain_marks_drops_unknown_names() {
        let (_, table, instantiator) = setup(ProcessKind::View);
        instantiator.instantiate(&record("a", ExtensionManifest::new("a", "1")));
        instantiator.instantiate(&record("b", ExtensionManifest::new("b", "1")));

        table.retain_marks(&BTreeSet::from(["b"]));
        assert_eq!(table.marked(), BTreeSet::from(["b".to_string()]));
    }
}
