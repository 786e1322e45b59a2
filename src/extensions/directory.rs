//! The installed extension directory.
//!
//! The host owns the canonical [`RecordMap`] and is its only writer. Every
//! mutation bumps a revision, persists the derived [`StoreState`], and
//! broadcasts the full snapshot on [`SYNC`]. Views replace their copy
//! wholesale and never write to it; a toggle from a view is a
//! [`SET_ENABLED`] message the host applies and re-broadcasts.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;

use super::DirectoryError;
use super::record::{DirectorySnapshot, InstalledExtensionRecord, RecordMap};
use crate::disposer::Disposer;
use crate::ipc::{ChannelError, Debounced, HostIpc, MessageChannel, RequestChannel, ViewIpc};
use crate::store::{ExtensionStore, StoreState, StoredExtension};

/// Host → views: the full record set after every mutation.
pub const SYNC: MessageChannel<DirectorySnapshot> =
    MessageChannel::new("extension-directory:sync");

/// View → host, once at startup.
pub const INITIAL_STATE: RequestChannel<(), DirectorySnapshot> =
    RequestChannel::new("extension-directory:initial-state");

/// View → host: user toggled an extension.
pub const SET_ENABLED: MessageChannel<SetEnabled> =
    MessageChannel::new("extension-directory:set-enabled");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEnabled {
    pub id: String,
    pub enabled: bool,
}

/// Read side shared by both directory flavors; what a coordinator consumes.
pub trait DirectorySource: Send + Sync {
    fn current(&self) -> Arc<RecordMap>;
    fn subscribe(&self) -> watch::Receiver<Arc<RecordMap>>;
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

pub struct HostDirectory {
    records: RwLock<RecordMap>,
    revision: AtomicU64,
    published: watch::Sender<Arc<RecordMap>>,
    store: Arc<dyn ExtensionStore>,
    stored: StoreState,
    saved_revision: Mutex<u64>,
    sync: OnceLock<Debounced<DirectorySnapshot>>,
}

impl HostDirectory {
    pub fn new(store: Arc<dyn ExtensionStore>) -> Arc<Self> {
        let stored = store.load();
        let (published, _) = watch::channel(Arc::new(RecordMap::new()));
        Arc::new(Self {
            records: RwLock::new(RecordMap::new()),
            revision: AtomicU64::new(0),
            published,
            store,
            stored,
            saved_revision: Mutex::new(0),
            sync: OnceLock::new(),
        })
    }

    pub fn get(&self, id: &str) -> Option<InstalledExtensionRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        let records = self.records.read();
        DirectorySnapshot {
            revision: self.revision.load(Ordering::SeqCst),
            records: records.clone(),
        }
    }

    /// Persisted enabled flag for `id`, as loaded at startup. User extensions
    /// without a stored entry default to enabled.
    pub fn stored_enabled(&self, id: &str) -> bool {
        self.stored.extensions.get(id).is_none_or(|e| e.enabled)
    }

    /// Insert a record, replacing any existing record with the same id.
    pub fn add_record(&self, record: InstalledExtensionRecord) {
        tracing::debug!(extension = %record.id, version = %record.version(), "Adding extension record");
        self.mutate(|records| {
            records.insert(record.id.clone(), record);
        });
    }

    pub fn remove_record(&self, id: &str) -> Result<InstalledExtensionRecord, DirectoryError> {
        let mut removed = None;
        self.try_mutate(|records| match records.remove(id) {
            Some(record) => {
                removed = Some(record);
                Ok(())
            }
            None => Err(DirectoryError::UnknownExtension(id.to_string())),
        })?;
        tracing::info!(extension = %id, "Removed extension record");
        removed.ok_or_else(|| DirectoryError::UnknownExtension(id.to_string()))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), DirectoryError> {
        self.try_mutate(|records| {
            let record = records
                .get_mut(id)
                .ok_or_else(|| DirectoryError::UnknownExtension(id.to_string()))?;
            if record.is_bundled {
                return Err(DirectoryError::ImmutableBundledState(id.to_string()));
            }
            if record.is_enabled != enabled {
                record.is_enabled = enabled;
                record.enable_generation += 1;
            }
            Ok(())
        })?;
        tracing::info!(extension = %id, enabled, "Extension enabled state changed");
        Ok(())
    }

    /// Replace the user (non-bundled) records with a fresh discovery pass.
    ///
    /// Records already present keep their current enabled flag; new ones are
    /// seeded from the persisted store. Records no longer discovered are
    /// removed. Publishes once, and only if something changed.
    pub fn sync_user_records(&self, discovered: Vec<InstalledExtensionRecord>) -> bool {
        let changed = self
            .try_mutate(|records| {
                let mut next: RecordMap = records
                    .iter()
                    .filter(|(_, r)| r.is_bundled)
                    .map(|(id, r)| (id.clone(), r.clone()))
                    .collect();
                for mut record in discovered {
                    if record.is_bundled {
                        continue;
                    }
                    match records.get(&record.id) {
                        Some(existing) => {
                            record.is_enabled = existing.is_enabled;
                            record.enable_generation = existing.enable_generation;
                        }
                        None => record.is_enabled = self.stored_enabled(&record.id),
                    }
                    next.insert(record.id.clone(), record);
                }
                if next == *records {
                    return Err(());
                }
                *records = next;
                Ok(())
            })
            .is_ok();
        if changed {
            tracing::info!("User extension records re-synced");
        }
        changed
    }

    /// Serve views: initial state requests, toggles, and the debounced sync
    /// broadcast. Returns disposers for the handler and listener.
    pub fn serve(self: &Arc<Self>, host: &HostIpc, debounce: Duration) -> Result<Vec<Disposer>, ChannelError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let initial_state = host.handle(&INITIAL_STATE, move |()| {
            let snapshot = weak.upgrade().map(|d| d.snapshot());
            async move { snapshot.ok_or_else(|| anyhow::anyhow!("extension directory is gone")) }
        })?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let toggles = host.listen(&SET_ENABLED, move |request: SetEnabled| {
            let Some(directory) = weak.upgrade() else {
                return;
            };
            if let Err(e) = directory.set_enabled(&request.id, request.enabled) {
                tracing::warn!(extension = %request.id, error = %e, "Rejected enable toggle from view");
            }
        });

        let broadcaster = host.clone();
        let sync = Debounced::new(debounce, move |snapshot: DirectorySnapshot| {
            broadcaster.broadcast(&SYNC, &snapshot);
        });
        if self.sync.set(sync).is_err() {
            tracing::warn!("Extension directory is already being served; keeping the first broadcaster");
        }
        self.broadcast_current();

        Ok(vec![initial_state, toggles])
    }

    /// Push any sync broadcast still waiting for its trailing edge.
    pub fn flush_sync(&self) {
        if let Some(sync) = self.sync.get() {
            sync.flush();
        }
    }

    fn broadcast_current(&self) {
        if let Some(sync) = self.sync.get() {
            sync.call(self.snapshot());
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut RecordMap)) {
        let applied: Result<(), std::convert::Infallible> = self.try_mutate(|records| {
            f(records);
            Ok(())
        });
        let Ok(()) = applied;
    }

    /// Apply `f` under the write lock. On success: bump the revision and
    /// publish to local subscribers, then (lock released) persist and
    /// schedule the view broadcast.
    fn try_mutate<E>(&self, f: impl FnOnce(&mut RecordMap) -> Result<(), E>) -> Result<(), E> {
        let (revision, state) = {
            let mut records = self.records.write();
            f(&mut records)?;
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            self.published.send_replace(Arc::new(records.clone()));
            (revision, Self::store_state(&records))
        };
        self.persist(revision, &state);
        self.broadcast_current();
        Ok(())
    }

    fn persist(&self, revision: u64, state: &StoreState) {
        let mut saved = self.saved_revision.lock();
        // A concurrent mutation may already have written a newer state
        if revision <= *saved {
            return;
        }
        match self.store.save(state) {
            Ok(()) => *saved = revision,
            Err(e) => tracing::error!(revision, error = %e, "Failed to persist extension store state"),
        }
    }

    fn store_state(records: &RecordMap) -> StoreState {
        StoreState {
            extensions: records
                .values()
                .filter(|r| !r.is_bundled)
                .map(|r| {
                    (
                        r.id.clone(),
                        StoredExtension {
                            enabled: r.is_enabled,
                            name: r.name().to_string(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl DirectorySource for HostDirectory {
    fn current(&self) -> Arc<RecordMap> {
        self.published.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<RecordMap>> {
        self.published.subscribe()
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Read-only mirror of the host directory inside a view process.
pub struct ViewDirectory {
    ipc: ViewIpc,
    revision: Mutex<u64>,
    published: watch::Sender<Arc<RecordMap>>,
    listener: Mutex<Option<Disposer>>,
}

impl ViewDirectory {
    /// Subscribe to sync broadcasts, then fetch the current snapshot. The
    /// listener goes first so no broadcast sent in between is missed.
    pub async fn connect(ipc: ViewIpc) -> Result<Arc<Self>, ChannelError> {
        let (published, _) = watch::channel(Arc::new(RecordMap::new()));
        let directory = Arc::new(Self {
            ipc: ipc.clone(),
            revision: Mutex::new(0),
            published,
            listener: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&directory);
        let listener = ipc.listen(&SYNC, move |snapshot: DirectorySnapshot| {
            if let Some(directory) = weak.upgrade() {
                directory.apply(snapshot);
            }
        });
        *directory.listener.lock() = Some(listener);

        let initial = ipc.request(&INITIAL_STATE, &()).await?;
        directory.apply(initial);
        Ok(directory)
    }

    pub fn get(&self, id: &str) -> Option<InstalledExtensionRecord> {
        self.published.borrow().get(id).cloned()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.lock()
    }

    /// Ask the host to change an extension's enabled flag. The local copy
    /// changes only once the host's broadcast arrives.
    pub fn request_set_enabled(&self, id: &str, enabled: bool) -> Result<(), ChannelError> {
        self.ipc.send(
            &SET_ENABLED,
            &SetEnabled {
                id: id.to_string(),
                enabled,
            },
        )
    }

    fn apply(&self, snapshot: DirectorySnapshot) {
        let mut revision = self.revision.lock();
        if snapshot.revision < *revision {
            tracing::debug!(
                received = snapshot.revision,
                current = *revision,
                "Ignoring stale directory snapshot"
            );
            return;
        }
        *revision = snapshot.revision;
        self.published.send_replace(Arc::new(snapshot.records));
    }
}

impl DirectorySource for ViewDirectory {
    fn current(&self) -> Arc<RecordMap> {
        self.published.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<RecordMap>> {
        self.published.subscribe()
    }
}

impl Drop for ViewDirectory {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            let _ = listener.dispose();
        }
    }
}
