//! Process shells: wire the messaging hub, directory and coordinator
//! together for a host or a view process.

use notify::RecommendedWatcher;
use notify_debouncer_mini::Debouncer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::ShellConfig;
use crate::discovery::{discover_extensions, start_extension_watcher};
use crate::disposer::Disposer;
use crate::extensions::{
    AutoInit, Coordinator, DirectorySource, FactoryResolver, HostDirectory, InstanceTable,
    LoadingHandle, ProcessKind, Registries, ViewDirectory, wait_for_bundled,
};
use crate::ipc::{ChannelError, FRAME_ANNOUNCE, FrameAnnouncement, HostIpc, ViewIpc};
use crate::store::ExtensionStore;
use crate::transport::FrameAddress;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

pub struct HostShell {
    ipc: HostIpc,
    directory: Arc<HostDirectory>,
    coordinator: Arc<Coordinator>,
    init: AutoInit,
    served: Vec<Disposer>,
    _watcher: Option<Debouncer<RecommendedWatcher>>,
    next_process: AtomicU32,
}

impl HostShell {
    /// Discover extensions, start serving views, and load the host side of
    /// every extension. Waits for bundled extensions up to the configured
    /// timeout.
    pub async fn start(
        config: &ShellConfig,
        resolver: Arc<dyn FactoryResolver>,
        store: Arc<dyn ExtensionStore>,
    ) -> anyhow::Result<Self> {
        let ipc = HostIpc::new();
        let directory = HostDirectory::new(store);

        if let Some(bundled_dir) = &config.bundled_extensions_dir {
            for record in discover_extensions(bundled_dir, true) {
                directory.add_record(record);
            }
        }
        let user_dir = config.user_extensions_dir();
        directory.sync_user_records(discover_extensions(&user_dir, false));

        let served = directory.serve(&ipc, config.sync_debounce())?;

        let watcher = if config.watch_extensions {
            match start_extension_watcher(user_dir, directory.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Extension hot reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let coordinator = Coordinator::new(ProcessKind::Host, resolver, InstanceTable::new(), Registries::new());
        let init = coordinator.auto_init(directory.subscribe()).await;
        wait_for_bundled(&init.handles, config.bundled_wait_timeout()).await;

        tracing::info!(
            extensions = directory.current().len(),
            instances = coordinator.instances().len(),
            "Host shell started"
        );

        Ok(Self {
            ipc,
            directory,
            coordinator,
            init,
            served,
            _watcher: watcher,
            next_process: AtomicU32::new(1),
        })
    }

    pub fn ipc(&self) -> &HostIpc {
        &self.ipc
    }

    pub fn directory(&self) -> &Arc<HostDirectory> {
        &self.directory
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn loading_handles(&self) -> &[LoadingHandle] {
        &self.init.handles
    }

    /// Connect a new in-process top-level view.
    pub fn open_view(&self) -> ViewIpc {
        let process_id = self.next_process.fetch_add(1, Ordering::Relaxed);
        self.ipc.connect_in_memory(FrameAddress::top_level(process_id), true)
    }

    /// Connect a nested frame inside an existing view process.
    pub fn open_sub_frame(&self, process_id: u32, frame_id: u32) -> ViewIpc {
        self.ipc.connect_in_memory(FrameAddress::new(process_id, frame_id), false)
    }

    pub async fn shutdown(self) {
        self.init.stop();
        self.coordinator.shutdown().await;
        self.directory.flush_sync();
        for disposer in self.served {
            if let Err(e) = disposer.dispose() {
                tracing::warn!(error = %e, "Failed to release directory handler");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

pub struct ViewShell {
    ipc: ViewIpc,
    directory: Arc<ViewDirectory>,
    coordinator: Arc<Coordinator>,
    init: AutoInit,
}

impl ViewShell {
    /// Announce the frame (when it renders a cluster), mirror the directory,
    /// and load the view side of every extension.
    pub async fn start(
        ipc: ViewIpc,
        resolver: Arc<dyn FactoryResolver>,
        cluster_id: Option<String>,
        bundled_wait: Duration,
    ) -> Result<Self, ChannelError> {
        let address = ipc.address();
        if let Some(cluster_id) = cluster_id {
            ipc.request(
                &FRAME_ANNOUNCE,
                &FrameAnnouncement {
                    cluster_id,
                    frame_id: address.frame_id,
                    process_id: address.process_id,
                },
            )
            .await?;
        }

        let directory = ViewDirectory::connect(ipc.clone()).await?;
        let coordinator = Coordinator::new(ProcessKind::View, resolver, InstanceTable::new(), Registries::new());
        let init = coordinator.auto_init(directory.subscribe()).await;
        wait_for_bundled(&init.handles, bundled_wait).await;

        tracing::info!(
            frame = %address,
            instances = coordinator.instances().len(),
            "View shell started"
        );

        Ok(Self {
            ipc,
            directory,
            coordinator,
            init,
        })
    }

    pub fn ipc(&self) -> &ViewIpc {
        &self.ipc
    }

    pub fn directory(&self) -> &Arc<ViewDirectory> {
        &self.directory
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn loading_handles(&self) -> &[LoadingHandle] {
        &self.init.handles
    }

    pub async fn shutdown(self) {
        self.init.stop();
        self.coordinator.shutdown().await;
        self.ipc.close();
    }
}
