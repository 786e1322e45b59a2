pub mod app_logger;
pub mod config;
mod demo;
pub mod discovery;
pub mod disposer;
pub mod extensions;
pub mod ipc;
pub mod shell;
pub mod store;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use app_logger::{AppLog, init_logging};
pub use config::{ShellConfig, load_shell_config};
pub use extensions::{
    Coordinator, DirectorySource, Extension, ExtensionContext, FactoryResolver, FactoryTable,
    HostDirectory, InstalledExtensionRecord, ProcessKind, Registrar, Registries, ViewDirectory,
};
pub use ipc::{HostIpc, ViewIpc};
pub use shell::{HostShell, ViewShell};
pub use store::{ExtensionStore, JsonFileStore, MemoryStore};

use extensions::{Contribution, Registry};

/// Cluster id the demo view announces itself for.
const DEMO_CLUSTER: &str = "local";

/// Run the shell against a scratch extensions folder: one host, one view,
/// then disable the user extension from the view and watch both sides
/// converge.
pub async fn run() -> anyhow::Result<()> {
    let mut config = load_shell_config();
    let log = init_logging(&config);

    let scratch = std::env::temp_dir().join(format!("extshell-{}", uuid::Uuid::new_v4()));
    let bundled_dir = scratch.join("bundled");
    let user_dir = scratch.join("extensions");
    demo::write_manifests(&bundled_dir, &user_dir)?;
    config.bundled_extensions_dir = Some(bundled_dir);
    config.extensions_dir = Some(user_dir);

    let result = run_in(&config).await;

    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::warn!(dir = %scratch.display(), error = %e, "Failed to remove scratch dir");
    }
    tracing::info!(entries = log.entries(0).len(), "Shell stopped");
    result
}

async fn run_in(config: &ShellConfig) -> anyhow::Result<()> {
    let factories = demo::builtin_factories();
    let host = HostShell::start(config, factories.clone(), Arc::new(MemoryStore::new())).await?;
    let view = ViewShell::start(
        host.open_view(),
        factories,
        Some(DEMO_CLUSTER.to_string()),
        config.bundled_wait_timeout(),
    )
    .await?;

    // Give the reactive routes a moment to fill in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    report("host", host.coordinator());
    report("view", view.coordinator());

    let pod_browser = view
        .directory()
        .current()
        .values()
        .find(|r| r.name() == demo::POD_BROWSER)
        .map(|r| r.id.clone());
    if let Some(id) = pod_browser {
        view.directory().request_set_enabled(&id, false)?;
        tokio::time::sleep(config.sync_debounce() + Duration::from_millis(100)).await;
        tracing::info!(
            extension = %id,
            host_enabled = host.directory().get(&id).is_some_and(|r| r.is_enabled),
            view_enabled = view.directory().get(&id).is_some_and(|r| r.is_enabled),
            running = view.coordinator().instances().contains(&id),
            "Disabled from the view"
        );
        report("view", view.coordinator());
    }

    view.shutdown().await;
    host.shutdown().await;
    Ok(())
}

fn report(process: &str, coordinator: &Coordinator) {
    let registries = coordinator.registries();
    let no_entry_point: Vec<String> = coordinator.instances().marked().into_iter().collect();
    tracing::info!(
        process,
        commands = %ids(&registries.commands),
        categories = %ids(&registries.categories),
        routes = %ids(&registries.routes),
        no_entry_point = %no_entry_point.join(", "),
        "Registries"
    );
}

fn ids<T: Contribution>(registry: &Registry<T>) -> String {
    registry
        .items()
        .iter()
        .map(|item| item.id())
        .collect::<Vec<_>>()
        .join(", ")
}

