use futures_util::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ProcessKind;
use super::record::InstalledExtensionRecord;
use super::registration::{Registrar, Registries};
use super::runtime::{Extension, ExtensionContext};
use crate::disposer::DisposerStack;

/// Where an instance is in its pipeline. `Deregistered` is terminal; a fresh
/// instance is needed to load the extension again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Activating,
    Activated,
    Registered,
    Enabled,
    Disabling,
    Deregistered,
}

/// One extension living in one process.
pub struct ExtensionInstance {
    record: InstalledExtensionRecord,
    extension: Box<dyn Extension>,
    ctx: ExtensionContext,
    state: Mutex<LifecycleState>,
    enabled: AtomicBool,
    registrations: DisposerStack,
}

impl ExtensionInstance {
    pub fn new(record: InstalledExtensionRecord, process: ProcessKind, extension: Box<dyn Extension>) -> Self {
        let ctx = ExtensionContext::new(&record, process);
        Self {
            record,
            extension,
            ctx,
            state: Mutex::new(LifecycleState::Unloaded),
            enabled: AtomicBool::new(false),
            registrations: DisposerStack::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn version(&self) -> &str {
        self.record.version()
    }

    pub fn is_bundled(&self) -> bool {
        self.record.is_bundled
    }

    /// The record this instance was built from.
    pub fn record(&self) -> &InstalledExtensionRecord {
        &self.record
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LifecycleState) {
        let mut current = self.state.lock();
        if *current == LifecycleState::Deregistered {
            return;
        }
        tracing::trace!(extension = %self.id(), from = ?*current, to = ?state, "Lifecycle transition");
        *current = state;
    }

    /// Run the activate hook. Returns whether it succeeded; either way the
    /// instance moves on to `Activated`.
    pub async fn activate(&self) -> bool {
        self.set_state(LifecycleState::Activating);
        let ok = self.guarded("activate", self.extension.activate(&self.ctx)).await;
        self.set_state(LifecycleState::Activated);
        ok
    }

    /// Run the registrar against `registries`.
    pub fn register(&self, registries: &Registries) {
        let mut registrar = Registrar::new(self.id(), registries);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.extension.register(&mut registrar)));
        // Whatever was registered before a panic still gets cleaned up
        for disposer in registrar.finish() {
            self.registrations.push(disposer);
        }
        if outcome.is_err() {
            tracing::error!(extension = %self.id(), name = %self.name(), "Registrar panicked");
        }
        self.set_state(LifecycleState::Registered);
    }

    /// Run the enable hook once. Later calls are no-ops until a disable.
    pub async fn enable(&self) {
        if matches!(self.state(), LifecycleState::Disabling | LifecycleState::Deregistered) {
            tracing::debug!(extension = %self.id(), "Skipping enable of a torn down instance");
            return;
        }
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.guarded("enable", self.extension.enable(&self.ctx)).await;
        self.set_state(LifecycleState::Enabled);
        tracing::info!(extension = %self.id(), name = %self.name(), version = %self.version(), "Extension enabled");
    }

    /// Run the deactivate hook, then the context's disposers. No-op unless
    /// enabled. Returns whether anything ran.
    pub async fn disable(&self) -> bool {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.set_state(LifecycleState::Disabling);
        self.guarded("deactivate", self.extension.deactivate(&self.ctx)).await;
        self.ctx.disposers().dispose_all(self.id());
        tracing::info!(extension = %self.id(), name = %self.name(), "Extension disabled");
        true
    }

    /// Retract every contribution and release anything left on the context.
    pub fn deregister(&self) {
        self.registrations.dispose_all(self.id());
        self.ctx.disposers().dispose_all(self.id());
        self.set_state(LifecycleState::Deregistered);
    }

    async fn guarded<F>(&self, hook: &'static str, fut: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                let error = format!("{e:#}");
                tracing::error!(
                    extension = %self.id(),
                    name = %self.name(),
                    version = %self.version(),
                    hook,
                    error = %error,
                    "Extension hook failed"
                );
                false
            }
            Err(_) => {
                tracing::error!(
                    extension = %self.id(),
                    name = %self.name(),
                    version = %self.version(),
                    hook,
                    "Extension hook panicked"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disposer::Disposer;
    use crate::extensions::contributions::Command;
    use crate::extensions::record::ExtensionManifest;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counts {
        activate: usize,
        enable: usize,
        deactivate: usize,
        disposed: usize,
    }

    struct Probe {
        counts: Arc<Mutex<Counts>>,
        fail_enable: bool,
    }

    #[async_trait]
    impl Extension for Probe {
        async fn activate(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.counts.lock().activate += 1;
            let counts = self.counts.clone();
            ctx.on_dispose(Disposer::from_fn(move || counts.lock().disposed += 1));
            Ok(())
        }

        fn register(&self, registrar: &mut Registrar<'_>) {
            registrar.commands(vec![Command::new("probe.run", "Run")]);
        }

        async fn enable(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.counts.lock().enable += 1;
            if self.fail_enable {
                anyhow::bail!("enable failed");
            }
            Ok(())
        }

        async fn deactivate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            self.counts.lock().deactivate += 1;
            Ok(())
        }
    }

    fn probe(fail_enable: bool) -> (ExtensionInstance, Arc<Mutex<Counts>>) {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let record = InstalledExtensionRecord::user("probe", ExtensionManifest::new("probe", "1.0.0"), "/probe");
        let instance = ExtensionInstance::new(
            record,
            ProcessKind::Host,
            Box::new(Probe {
                counts: counts.clone(),
                fail_enable,
            }),
        );
        (instance, counts)
    }

    #[tokio::test]
    async fn enable_and_disable_are_idempotent() {
        let (instance, counts) = probe(false);
        let registries = Registries::new();

        assert!(instance.activate().await);
        instance.register(&registries);
        instance.enable().await;
        instance.enable().await;
        assert_eq!(counts.lock().enable, 1);
        assert_eq!(instance.state(), LifecycleState::Enabled);

        assert!(instance.disable().await);
        assert!(!instance.disable().await);
        assert_eq!(counts.lock().deactivate, 1);
        assert_eq!(counts.lock().disposed, 1);
    }

    #[tokio::test]
    async fn disable_before_enable_is_a_noop() {
        let (instance, counts) = probe(false);
        assert!(!instance.disable().await);
        assert_eq!(counts.lock().deactivate, 0);
    }

    #[tokio::test]
    async fn failed_enable_still_counts_as_enabled() {
        let (instance, counts) = probe(true);
        instance.enable().await;
        assert!(instance.is_enabled());
        instance.enable().await;
        assert_eq!(counts.lock().enable, 1);
    }

    #[tokio::test]
    async fn deregister_retracts_contributions_and_is_terminal() {
        let (instance, counts) = probe(false);
        let registries = Registries::new();
        instance.activate().await;
        instance.register(&registries);
        assert!(registries.commands.contains("probe", "probe.run"));

        instance.deregister();
        assert!(registries.commands.is_empty());
        assert_eq!(instance.state(), LifecycleState::Deregistered);

        instance.enable().await;
        assert_eq!(instance.state(), LifecycleState::Deregistered);
        assert!(!instance.is_enabled());
        assert_eq!(counts.lock().enable, 0);
    }

    struct Panicky;

    #[async_trait]
    impl Extension for Panicky {
        async fn activate(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            panic!("activate exploded");
        }

        fn register(&self, registrar: &mut Registrar<'_>) {
            registrar.commands(vec![Command::new("before", "Before")]);
            panic!("register exploded");
        }
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let record = InstalledExtensionRecord::user("p", ExtensionManifest::new("p", "1"), "/p");
        let instance = ExtensionInstance::new(record, ProcessKind::View, Box::new(Panicky));
        let registries = Registries::new();

        assert!(!instance.activate().await);
        instance.register(&registries);
        assert_eq!(instance.state(), LifecycleState::Registered);

        instance.deregister();
        assert!(registries.commands.is_empty());
    }
}
