//! Process-local registries and the differencer that keeps an extension's
//! contributions in them in step with what the extension currently offers.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::contributions::{Category, Command, Route};
use crate::disposer::Disposer;

/// Something an extension adds to a registry. The id is its only identity.
pub trait Contribution: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContributionKey {
    pub owner: String,
    pub id: String,
}

impl ContributionKey {
    pub fn new(owner: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            id: id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Contributions of one kind, keyed by (owning extension, contribution id).
pub struct Registry<T> {
    name: &'static str,
    entries: RwLock<BTreeMap<ContributionKey, T>>,
}

impl<T: Contribution> Registry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, owner: &str, item: T) {
        let key = ContributionKey::new(owner, item.id());
        self.entries.write().insert(key, item);
    }

    pub fn remove(&self, owner: &str, id: &str) -> Option<T> {
        self.entries.write().remove(&ContributionKey::new(owner, id))
    }

    pub fn get(&self, owner: &str, id: &str) -> Option<T> {
        self.entries.read().get(&ContributionKey::new(owner, id)).cloned()
    }

    pub fn contains(&self, owner: &str, id: &str) -> bool {
        self.entries.read().contains_key(&ContributionKey::new(owner, id))
    }

    pub fn items(&self) -> Vec<T> {
        self.entries.read().values().cloned().collect()
    }

    pub fn ids_for(&self, owner: &str) -> BTreeSet<String> {
        self.entries
            .read()
            .keys()
            .filter(|k| k.owner == owner)
            .map(|k| k.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Bring `owner`'s entries in `registry` from `previous` to `snapshot`.
///
/// Ids only in `previous` are removed, then ids only in `snapshot` are added.
/// Ids in both are left alone even if the new value differs. Returns the ids
/// now applied, which is the baseline for the next call.
pub fn reconcile<T: Contribution>(
    registry: &Registry<T>,
    owner: &str,
    previous: &BTreeSet<String>,
    snapshot: &[T],
) -> BTreeSet<String> {
    let mut desired: BTreeMap<&str, &T> = BTreeMap::new();
    for item in snapshot {
        if desired.insert(item.id(), item).is_some() {
            tracing::warn!(extension = %owner, registry = registry.name, id = %item.id(), "Duplicate contribution id, keeping the last");
        }
    }

    for id in previous.iter().filter(|id| !desired.contains_key(id.as_str())) {
        registry.remove(owner, id);
    }
    for (id, item) in &desired {
        if !previous.contains(*id) {
            registry.add(owner, (*item).clone());
        }
    }

    desired.keys().map(|id| id.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Reactive values
// ---------------------------------------------------------------------------

type ChangeListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ReactiveInner<T> {
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, ChangeListener<T>)>>,
    next_listener: AtomicU64,
    /// Held from a write through its notification, so listeners see changes
    /// in write order. Reentrant so a listener may set the value itself.
    notifying: ReentrantMutex<()>,
}

/// A value extensions can change over time; observers are told after every
/// change, with the new value.
pub struct Reactive<T> {
    inner: Arc<ReactiveInner<T>>,
}

impl<T> Clone for Reactive<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Reactive<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ReactiveInner {
                value: RwLock::new(value),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                notifying: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    pub fn set(&self, value: T) {
        let _notifying = self.inner.notifying.lock();
        *self.inner.value.write() = value;
        self.notify();
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _notifying = self.inner.notifying.lock();
        f(&mut self.inner.value.write());
        self.notify();
    }

    pub fn on_change<F>(&self, f: F) -> Disposer
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(f)));
        let inner = Arc::downgrade(&self.inner);
        Disposer::from_fn(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.lock().retain(|(listener, _)| *listener != id);
            }
        })
    }

    /// Caller holds `notifying`. Each listener reads the value as it is
    /// called, so one that sets it again does not leave later ones stale.
    fn notify(&self) {
        let listeners: Vec<ChangeListener<T>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&self.get());
        }
    }
}

/// What a registrar hands over: a fixed list or one that changes.
pub enum Snapshot<T> {
    Static(Vec<T>),
    Reactive(Reactive<Vec<T>>),
}

impl<T> From<Vec<T>> for Snapshot<T> {
    fn from(items: Vec<T>) -> Self {
        Snapshot::Static(items)
    }
}

impl<T> From<Reactive<Vec<T>>> for Snapshot<T> {
    fn from(items: Reactive<Vec<T>>) -> Self {
        Snapshot::Reactive(items)
    }
}

/// Apply `snapshot` for `owner` and keep it applied. The returned disposer
/// stops tracking and removes whatever is currently applied.
pub fn apply<T: Contribution>(registry: Arc<Registry<T>>, owner: &str, snapshot: Snapshot<T>) -> Disposer {
    let owner = owner.to_string();
    match snapshot {
        Snapshot::Static(items) => {
            let applied = reconcile(&registry, &owner, &BTreeSet::new(), &items);
            Disposer::from_fn(move || {
                for id in &applied {
                    registry.remove(&owner, id);
                }
            })
        }
        Snapshot::Reactive(source) => {
            let applied = Arc::new(Mutex::new(BTreeSet::new()));
            // Subscribe before the initial pass so a change in between is not lost
            let subscription = {
                let registry = registry.clone();
                let owner = owner.clone();
                let applied = applied.clone();
                source.on_change(move |items: &Vec<T>| {
                    let mut applied = applied.lock();
                    *applied = reconcile(&registry, &owner, &applied, items);
                })
            };
            {
                let mut current = applied.lock();
                *current = reconcile(&registry, &owner, &current, &source.get());
            }
            Disposer::new(move || {
                subscription.dispose()?;
                for id in applied.lock().iter() {
                    registry.remove(&owner, id);
                }
                Ok(())
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Registries + registrar
// ---------------------------------------------------------------------------

/// The process-local registries the GUI, command palette and router read.
#[derive(Clone)]
pub struct Registries {
    pub commands: Arc<Registry<Command>>,
    pub categories: Arc<Registry<Category>>,
    pub routes: Arc<Registry<Route>>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            commands: Arc::new(Registry::new("commands")),
            categories: Arc::new(Registry::new("categories")),
            routes: Arc::new(Registry::new("routes")),
        }
    }
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handed to [`Extension::register`](super::Extension::register). Every
/// contribution made through it is removed again on deregister.
pub struct Registrar<'a> {
    owner: &'a str,
    registries: &'a Registries,
    registrations: Vec<Disposer>,
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(owner: &'a str, registries: &'a Registries) -> Self {
        Self {
            owner,
            registries,
            registrations: Vec::new(),
        }
    }

    pub fn owner(&self) -> &str {
        self.owner
    }

    /// Read access, e.g. to check a category another extension registered.
    pub fn registries(&self) -> &Registries {
        self.registries
    }

    pub fn commands(&mut self, snapshot: impl Into<Snapshot<Command>>) {
        let registry = self.registries.commands.clone();
        self.contribute(registry, snapshot);
    }

    pub fn categories(&mut self, snapshot: impl Into<Snapshot<Category>>) {
        let registry = self.registries.categories.clone();
        self.contribute(registry, snapshot);
    }

    pub fn routes(&mut self, snapshot: impl Into<Snapshot<Route>>) {
        let registry = self.registries.routes.clone();
        self.contribute(registry, snapshot);
    }

    /// Contribute to any registry, including ones outside [`Registries`].
    pub fn contribute<T: Contribution>(&mut self, registry: Arc<Registry<T>>, snapshot: impl Into<Snapshot<T>>) {
        let disposer = apply(registry, self.owner, snapshot.into());
        self.registrations.push(disposer);
    }

    pub(crate) fn finish(self) -> Vec<Disposer> {
        self.registrations
    }
}
