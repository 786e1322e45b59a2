//! Lifecycle coordinator.
//!
//! One per process. Each reconciliation:
//! 1. tears down instances whose record vanished, was disabled, or changed
//!    version, or whose enabled flag changed since they were built (wait
//!    for any in-flight enable, disable, then deregister);
//! 2. instantiates every loadable record without an instance;
//! 3. activates the new instances concurrently and waits for all of them;
//! 4. registers each one's contributions;
//! 5. starts each one's enable hook and hands back a [`LoadingHandle`].
//!
//! Hook failures stay with the extension that raised them.

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use super::ProcessKind;
use super::instance::ExtensionInstance;
use super::instantiator::{InstanceTable, Instantiation, Instantiator};
use super::record::RecordMap;
use super::registration::Registries;
use super::runtime::FactoryResolver;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Instance finished its enable step.
    Added { id: String, name: String },
    /// Instance was disabled and deregistered.
    Removed { id: String, name: String },
}

/// Settles once an extension's enable step is over, whether or not the hook
/// succeeded. Clones share the same settlement.
#[derive(Clone)]
pub struct LoadingHandle {
    pub id: String,
    pub is_bundled: bool,
    settled: Shared<BoxFuture<'static, ()>>,
}

impl LoadingHandle {
    pub async fn wait(&self) {
        self.settled.clone().await
    }

    pub fn is_settled(&self) -> bool {
        self.settled.peek().is_some()
    }
}

impl std::fmt::Debug for LoadingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingHandle")
            .field("id", &self.id)
            .field("is_bundled", &self.is_bundled)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Wait for the bundled handles in `handles`, for at most `timeout`.
/// Returns `false` on timeout; the hooks keep running either way.
pub async fn wait_for_bundled(handles: &[LoadingHandle], timeout: Duration) -> bool {
    let bundled = join_all(handles.iter().filter(|h| h.is_bundled).map(|h| h.wait()));
    match tokio::time::timeout(timeout, bundled).await {
        Ok(_) => true,
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Bundled extensions still loading after timeout");
            false
        }
    }
}

/// Result of [`Coordinator::auto_init`].
pub struct AutoInit {
    /// Handles from the initial reconciliation.
    pub handles: Vec<LoadingHandle>,
    reaction: JoinHandle<()>,
}

impl AutoInit {
    /// Stop reacting to directory changes.
    pub fn stop(&self) {
        self.reaction.abort();
    }
}

pub struct Coordinator {
    kind: ProcessKind,
    instantiator: Instantiator,
    table: Arc<InstanceTable>,
    registries: Registries,
    events: broadcast::Sender<LifecycleEvent>,
    /// Enable steps started by `load_batch`, by instance id.
    enabling: DashMap<String, LoadingHandle>,
    // Serializes reconciliations from the reaction task and direct callers
    reconciling: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        kind: ProcessKind,
        resolver: Arc<dyn FactoryResolver>,
        table: Arc<InstanceTable>,
        registries: Registries,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            kind,
            instantiator: Instantiator::new(kind, resolver, table.clone()),
            table,
            registries,
            events,
            enabling: DashMap::new(),
            reconciling: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn instances(&self) -> &Arc<InstanceTable> {
        &self.table
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Bring this process's instances in line with `records`.
    pub async fn reconcile(&self, records: &RecordMap) -> Vec<LoadingHandle> {
        let _guard = self.reconciling.lock().await;

        for instance in self.table.instances() {
            let stale = match records.get(instance.id()) {
                None => Some("removed"),
                Some(record) if !record.is_loadable() => Some("disabled"),
                Some(record) if record.version() != instance.version() => Some("version changed"),
                Some(record) if record.enable_generation != instance.record().enable_generation => {
                    Some("re-enabled")
                }
                Some(_) => None,
            };
            if let Some(reason) = stale {
                tracing::info!(extension = %instance.id(), process = %self.kind, reason, "Tearing down extension");
                self.teardown(&instance).await;
            }
        }

        // Keep markers only for records that still lack an entry point here
        let still_without_entry: BTreeSet<&str> = records
            .values()
            .filter(|r| r.manifest.entry(self.kind).is_none())
            .map(|r| r.name())
            .collect();
        self.table.retain_marks(&still_without_entry);

        let mut batch = Vec::new();
        for record in records.values() {
            if !record.is_loadable() || self.table.contains(&record.id) || self.table.is_marked(record.name()) {
                continue;
            }
            if let Instantiation::Created(instance) = self.instantiator.instantiate(record) {
                batch.push(instance);
            }
        }

        if batch.is_empty() {
            return Vec::new();
        }
        tracing::debug!(process = %self.kind, count = batch.len(), "Loading extension batch");
        self.load_batch(batch).await
    }

    /// Activate every instance, wait for all, then register and enable each.
    async fn load_batch(&self, batch: Vec<Arc<ExtensionInstance>>) -> Vec<LoadingHandle> {
        join_all(batch.iter().map(|instance| instance.activate())).await;

        for instance in &batch {
            instance.register(&self.registries);
        }

        batch
            .into_iter()
            .map(|instance| {
                let id = instance.id().to_string();
                let is_bundled = instance.is_bundled();
                let events = self.events.clone();
                let settled = async move {
                    instance.enable().await;
                    let _ = events.send(LifecycleEvent::Added {
                        id: instance.id().to_string(),
                        name: instance.name().to_string(),
                    });
                }
                .boxed()
                .shared();
                // Runs to completion even if nobody waits on the handle
                tokio::spawn(settled.clone());
                let handle = LoadingHandle {
                    id,
                    is_bundled,
                    settled,
                };
                self.enabling.insert(handle.id.clone(), handle.clone());
                handle
            })
            .collect()
    }

    /// Disable and deregister the instance for `id`, if this process has one.
    pub async fn remove_instance(&self, id: &str) -> bool {
        let _guard = self.reconciling.lock().await;
        match self.table.get(id) {
            Some(instance) => {
                self.teardown(&instance).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every instance. Used on process exit.
    pub async fn shutdown(&self) {
        let _guard = self.reconciling.lock().await;
        for instance in self.table.instances() {
            self.teardown(&instance).await;
        }
        tracing::info!(process = %self.kind, "Extension coordinator shut down");
    }

    async fn teardown(&self, instance: &Arc<ExtensionInstance>) {
        // Disable must see the enable step through, or its disposers leak
        if let Some((_, enabling)) = self.enabling.remove(instance.id()) {
            enabling.wait().await;
        }
        instance.disable().await;
        instance.deregister();
        self.table.remove(instance.id());
        let _ = self.events.send(LifecycleEvent::Removed {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
        });
    }

    /// Reconcile against the current directory state now, then again on
    /// every change, always against the latest state.
    pub async fn auto_init(self: &Arc<Self>, mut updates: watch::Receiver<Arc<RecordMap>>) -> AutoInit {
        let initial = updates.borrow_and_update().clone();
        let handles = self.reconcile(&initial).await;

        let coordinator = Arc::downgrade(self);
        let kind = self.kind;
        let reaction = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let records = updates.borrow_and_update().clone();
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.reconcile(&records).await;
            }
            tracing::debug!(process = %kind, "Directory reaction stopped");
        });

        AutoInit { handles, reaction }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposer::Disposer;
    use crate::extensions::contributions::{Category, Command};
    use crate::extensions::directory::{DirectorySource, HostDirectory};
    use crate::extensions::instance::LifecycleState;
    use crate::extensions::record::{ExtensionManifest, InstalledExtensionRecord};
    use crate::extensions::registration::Registrar;
    use crate::extensions::runtime::{Extension, ExtensionContext, FactoryTable};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct Journal(SyncMutex<Vec<String>>);

    impl Journal {
        fn log(&self, entry: String) {
            self.0.lock().push(entry);
        }

        fn count(&self, entry: &str) -> usize {
            self.0.lock().iter().filter(|e| *e == entry).count()
        }

        fn position(&self, entry: &str) -> Option<usize> {
            self.0.lock().iter().position(|e| e == entry)
        }
    }

    #[derive(Clone, Default)]
    struct Script {
        fail_activate: bool,
        activate_delay: Option<Duration>,
        enable_delay: Option<Duration>,
        /// Written during activate
        publish: Option<Arc<SyncMutex<Option<String>>>>,
        /// Read during register
        read: Option<Arc<SyncMutex<Option<String>>>>,
    }

    struct Scripted {
        name: String,
        journal: Arc<Journal>,
        script: Script,
    }

    #[async_trait]
    impl Extension for Scripted {
        async fn activate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.journal.log(format!("{}:activate", self.name));
            if let Some(delay) = self.script.activate_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(slot) = &self.script.publish {
                *slot.lock() = Some(format!("set by {}", self.name));
            }
            if self.script.fail_activate {
                anyhow::bail!("activation failed");
            }
            Ok(())
        }

        fn register(&self, registrar: &mut Registrar<'_>) {
            self.journal.log(format!("{}:register", self.name));
            let title = match &self.script.read {
                Some(slot) => slot.lock().clone().unwrap_or_else(|| "unset".into()),
                None => self.name.clone(),
            };
            registrar.categories(vec![Category::new(format!("{}.category", self.name), "Category")]);
            registrar.commands(vec![Command::new(format!("{}.run", self.name), title)]);
        }

        async fn enable(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
            if let Some(delay) = self.script.enable_delay {
                tokio::time::sleep(delay).await;
            }
            self.journal.log(format!("{}:enable", self.name));
            let journal = self.journal.clone();
            let disposed = format!("{}:disposed", self.name);
            ctx.on_dispose(Disposer::from_fn(move || journal.log(disposed)));
            Ok(())
        }

        async fn deactivate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.journal.log(format!("{}:deactivate", self.name));
            Ok(())
        }
    }

    struct Harness {
        journal: Arc<Journal>,
        factories: Arc<FactoryTable>,
        coordinator: Arc<Coordinator>,
    }

    impl Harness {
        fn new(kind: ProcessKind) -> Self {
            let factories = Arc::new(FactoryTable::new());
            let coordinator = Coordinator::new(kind, factories.clone(), InstanceTable::new(), Registries::new());
            Self {
                journal: Arc::new(Journal::default()),
                factories,
                coordinator,
            }
        }

        fn script(&self, name: &str, kind: ProcessKind, script: Script) {
            let journal = self.journal.clone();
            let owned = name.to_string();
            self.factories.register(name, kind, move |_| {
                journal.log(format!("{owned}:construct"));
                Ok(Box::new(Scripted {
                    name: owned.clone(),
                    journal: journal.clone(),
                    script: script.clone(),
                }))
            });
        }

        fn registries(&self) -> &Registries {
            self.coordinator.registries()
        }
    }

    fn host_record(name: &str) -> InstalledExtensionRecord {
        InstalledExtensionRecord::user(
            name,
            ExtensionManifest::new(name, "1.0.0").with_host("host.js"),
            format!("/ext/{name}"),
        )
    }

    fn records(list: &[InstalledExtensionRecord]) -> RecordMap {
        list.iter().map(|r| (r.id.clone(), r.clone())).collect()
    }

    async fn settle_all(handles: &[LoadingHandle]) {
        join_all(handles.iter().map(|h| h.wait())).await;
    }

    #[tokio::test]
    async fn failing_extension_does_not_affect_siblings() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script { fail_activate: true, ..Default::default() });
        h.script("b", ProcessKind::Host, Script::default());

        let handles = h.coordinator.reconcile(&records(&[host_record("a"), host_record("b")])).await;
        settle_all(&handles).await;

        let b = h.coordinator.instances().get("b").unwrap();
        assert_eq!(b.state(), LifecycleState::Enabled);
        assert_eq!(h.journal.count("b:enable"), 1);
    }

    #[tokio::test]
    async fn activation_failure_still_registers_contributions() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script { fail_activate: true, ..Default::default() });

        let handles = h.coordinator.reconcile(&records(&[host_record("a")])).await;
        settle_all(&handles).await;

        assert!(h.registries().commands.contains("a", "a.run"));
        assert_eq!(h.journal.count("a:enable"), 1);
    }

    #[tokio::test]
    async fn registration_waits_for_every_activation() {
        let h = Harness::new(ProcessKind::Host);
        let slot = Arc::new(SyncMutex::new(None));
        // "a" is constructed first and registers a value "b" sets late in activation
        h.script("a", ProcessKind::Host, Script { read: Some(slot.clone()), ..Default::default() });
        h.script(
            "b",
            ProcessKind::Host,
            Script {
                activate_delay: Some(Duration::from_millis(30)),
                publish: Some(slot.clone()),
                ..Default::default()
            },
        );

        let handles = h.coordinator.reconcile(&records(&[host_record("a"), host_record("b")])).await;
        settle_all(&handles).await;

        assert_eq!(h.registries().commands.get("a", "a.run").unwrap().title, "set by b");
        assert!(h.journal.position("a:register") > h.journal.position("b:activate"));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script::default());
        let map = records(&[host_record("a")]);

        let first = h.coordinator.reconcile(&map).await;
        settle_all(&first).await;
        let second = h.coordinator.reconcile(&map).await;

        assert!(second.is_empty());
        assert_eq!(h.journal.count("a:construct"), 1);
        assert_eq!(h.journal.count("a:activate"), 1);
    }

    #[tokio::test]
    async fn user_records_need_enabled_and_compatible() {
        let h = Harness::new(ProcessKind::Host);
        for name in ["off", "old", "core"] {
            h.script(name, ProcessKind::Host, Script::default());
        }
        let mut off = host_record("off");
        off.is_enabled = false;
        let mut old = host_record("old");
        old.is_compatible = false;
        let mut core = host_record("core");
        core.is_bundled = true;
        core.is_enabled = false;

        let handles = h.coordinator.reconcile(&records(&[off, old, core])).await;
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id, "core");
        assert!(handles[0].is_bundled);
    }

    #[tokio::test]
    async fn extension_without_entry_point_is_marked_not_built() {
        let h = Harness::new(ProcessKind::View);
        h.script("metrics", ProcessKind::Host, Script::default());
        let map = records(&[host_record("metrics")]);

        assert!(h.coordinator.reconcile(&map).await.is_empty());
        assert!(h.coordinator.instances().is_marked("metrics"));
        assert!(h.coordinator.instances().is_empty());

        h.coordinator.reconcile(&RecordMap::new()).await;
        assert!(!h.coordinator.instances().is_marked("metrics"));
    }

    #[tokio::test]
    async fn version_change_tears_down_before_rebuilding() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script::default());
        let mut record = host_record("a");

        settle_all(&h.coordinator.reconcile(&records(&[record.clone()])).await).await;
        record.manifest.version = "2.0.0".into();
        settle_all(&h.coordinator.reconcile(&records(&[record])).await).await;

        assert_eq!(h.journal.count("a:construct"), 2);
        assert_eq!(h.journal.count("a:deactivate"), 1);
        assert!(h.journal.position("a:deactivate") < h.journal.0.lock().iter().rposition(|e| e == "a:activate"));
        assert_eq!(h.coordinator.instances().get("a").unwrap().version(), "2.0.0");
        assert_eq!(h.registries().commands.len(), 1);
    }

    #[tokio::test]
    async fn bundled_wait_times_out_but_hook_still_lands() {
        let h = Harness::new(ProcessKind::Host);
        h.script(
            "slow",
            ProcessKind::Host,
            Script {
                enable_delay: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );
        let mut slow = host_record("slow");
        slow.is_bundled = true;

        let handles = h.coordinator.reconcile(&records(&[slow])).await;
        assert!(!wait_for_bundled(&handles, Duration::from_millis(10)).await);
        assert!(!handles[0].is_settled());

        handles[0].wait().await;
        assert_eq!(h.journal.count("slow:enable"), 1);
        assert!(wait_for_bundled(&handles, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn shutdown_tears_everything_down() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script::default());
        h.script("b", ProcessKind::Host, Script::default());
        settle_all(&h.coordinator.reconcile(&records(&[host_record("a"), host_record("b")])).await).await;

        h.coordinator.shutdown().await;
        assert!(h.coordinator.instances().is_empty());
        assert!(h.registries().commands.is_empty());
        assert!(h.registries().categories.is_empty());
        assert_eq!(h.journal.count("a:deactivate"), 1);
        assert_eq!(h.journal.count("b:deactivate"), 1);
    }

    #[tokio::test]
    async fn auto_init_end_to_end() {
        let h = Harness::new(ProcessKind::Host);
        h.script("ext1", ProcessKind::Host, Script::default());
        let directory = HostDirectory::new(Arc::new(MemoryStore::new()));
        directory.add_record(host_record("ext1"));
        let mut events = h.coordinator.subscribe();

        let init = h.coordinator.auto_init(directory.subscribe()).await;
        assert_eq!(init.handles.len(), 1);
        assert!(!init.handles[0].is_bundled);
        init.handles[0].wait().await;

        assert_eq!(h.journal.count("ext1:construct"), 1);
        assert_eq!(h.journal.count("ext1:activate"), 1);
        assert_eq!(h.journal.count("ext1:register"), 1);
        assert_eq!(h.journal.count("ext1:enable"), 1);
        assert!(h.journal.position("ext1:activate") < h.journal.position("ext1:register"));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Added {
                id: "ext1".into(),
                name: "ext1".into()
            }
        );

        directory.set_enabled("ext1", false).unwrap();
        let removed = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            removed,
            LifecycleEvent::Removed {
                id: "ext1".into(),
                name: "ext1".into()
            }
        );

        assert_eq!(h.journal.count("ext1:deactivate"), 1);
        assert!(!h.coordinator.instances().contains("ext1"));
        assert!(h.registries().commands.is_empty());
        assert_eq!(directory.current().len(), 1);

        // Re-enabling builds a fresh instance
        directory.set_enabled("ext1", true).unwrap();
        let added = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(added, LifecycleEvent::Added { .. }));
        assert_eq!(h.journal.count("ext1:construct"), 2);
        init.stop();
    }

    #[tokio::test]
    async fn removal_before_enable_runs_waits_for_it() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script::default());
        let mut events = h.coordinator.subscribe();

        // The enable task has not been polled yet when the record goes away
        let handles = h.coordinator.reconcile(&records(&[host_record("a")])).await;
        h.coordinator.reconcile(&RecordMap::new()).await;
        settle_all(&handles).await;

        assert_eq!(h.journal.count("a:enable"), 1);
        assert_eq!(h.journal.count("a:deactivate"), 1);
        assert_eq!(h.journal.count("a:disposed"), 1);
        assert!(h.journal.position("a:enable") < h.journal.position("a:deactivate"));
        assert!(!h.coordinator.instances().contains("a"));
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Added { .. }));
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Removed { .. }));
    }

    #[tokio::test]
    async fn removal_during_slow_enable_still_disposes() {
        let h = Harness::new(ProcessKind::Host);
        h.script(
            "a",
            ProcessKind::Host,
            Script {
                enable_delay: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );

        let handles = h.coordinator.reconcile(&records(&[host_record("a")])).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(h.coordinator.remove_instance("a").await);

        assert!(handles[0].is_settled());
        assert_eq!(h.journal.count("a:deactivate"), 1);
        assert_eq!(h.journal.count("a:disposed"), 1);
    }

    #[tokio::test]
    async fn disable_and_reenable_in_one_tick_restarts_the_extension() {
        let h = Harness::new(ProcessKind::Host);
        h.script("ext1", ProcessKind::Host, Script::default());
        let directory = HostDirectory::new(Arc::new(MemoryStore::new()));
        directory.add_record(host_record("ext1"));
        let mut events = h.coordinator.subscribe();

        let init = h.coordinator.auto_init(directory.subscribe()).await;
        init.handles[0].wait().await;
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Added { .. }));

        directory.set_enabled("ext1", false).unwrap();
        directory.set_enabled("ext1", true).unwrap();

        let removed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(removed, LifecycleEvent::Removed { .. }));
        let added = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(added, LifecycleEvent::Added { .. }));

        assert_eq!(h.journal.count("ext1:deactivate"), 1);
        assert_eq!(h.journal.count("ext1:construct"), 2);
        assert_eq!(h.coordinator.instances().get("ext1").unwrap().record().enable_generation, 2);
        init.stop();
    }

    #[tokio::test]
    async fn remove_instance_runs_teardown_once() {
        let h = Harness::new(ProcessKind::Host);
        h.script("a", ProcessKind::Host, Script::default());
        settle_all(&h.coordinator.reconcile(&records(&[host_record("a")])).await).await;

        assert!(h.coordinator.remove_instance("a").await);
        assert!(!h.coordinator.remove_instance("a").await);
        assert_eq!(h.journal.count("a:deactivate"), 1);
    }
}
