//! Two built-in extensions used by the `extshell` binary.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::disposer::Disposer;
use crate::discovery::MANIFEST_FILE;
use crate::extensions::{
    Category, Command, Extension, ExtensionContext, FactoryTable, ProcessKind, Reactive,
    Registrar, Route,
};

pub const OVERVIEW: &str = "cluster-overview";
pub const POD_BROWSER: &str = "pod-browser";

/// Bundled; contributes the "Cluster" category on both sides.
struct ClusterOverview;

#[async_trait]
impl Extension for ClusterOverview {
    async fn activate(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        tracing::info!(extension = %ctx.name, process = %ctx.process, "Cluster overview activated");
        Ok(())
    }

    fn register(&self, registrar: &mut Registrar<'_>) {
        registrar.categories(vec![Category::new("cluster", "Cluster")]);
        registrar.commands(vec![
            Command::new("cluster.refresh", "Refresh cluster").in_category("cluster"),
            Command::new("cluster.settings", "Cluster settings").in_category("cluster"),
        ]);
    }
}

/// User extension, view only. Its routes grow while it is enabled.
struct PodBrowser {
    routes: Reactive<Vec<Route>>,
}

#[async_trait]
impl Extension for PodBrowser {
    fn register(&self, registrar: &mut Registrar<'_>) {
        registrar.commands(vec![Command::new("pods.open", "Open pods").in_category("cluster")]);
        registrar.routes(self.routes.clone());
    }

    async fn enable(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let routes = self.routes.clone();
        let task = tokio::spawn(async move {
            for namespace in ["default", "kube-system"] {
                tokio::time::sleep(Duration::from_millis(20)).await;
                routes.update(|list| {
                    list.push(Route::new(
                        format!("pods.{namespace}"),
                        format!("/pods/{namespace}"),
                        format!("Pods in {namespace}"),
                    ))
                });
            }
        });
        ctx.on_dispose(Disposer::from_fn(move || task.abort()));
        Ok(())
    }
}

/// Register constructors for the built-in extensions.
pub fn register_builtin(factories: &FactoryTable) {
    for kind in [ProcessKind::Host, ProcessKind::View] {
        factories.register(OVERVIEW, kind, |_| Ok(Box::new(ClusterOverview)));
    }
    factories.register(POD_BROWSER, ProcessKind::View, |_| {
        Ok(Box::new(PodBrowser {
            routes: Reactive::new(vec![Route::new("pods", "/pods", "Pods")]),
        }))
    });
}

/// Lay out the manifests the built-in constructors answer to.
pub fn write_manifests(bundled_dir: &Path, user_dir: &Path) -> anyhow::Result<()> {
    write_manifest(
        &bundled_dir.join(OVERVIEW),
        serde_json::json!({ "name": OVERVIEW, "version": "1.0.0", "host": "host.js", "view": "view.js" }),
    )?;
    write_manifest(
        &user_dir.join(POD_BROWSER),
        serde_json::json!({ "name": POD_BROWSER, "version": "0.3.0", "view": "view.js", "minAppVersion": "1.0.0" }),
    )
}

fn write_manifest(folder: &Path, manifest: serde_json::Value) -> anyhow::Result<()> {
    std::fs::create_dir_all(folder)?;
    std::fs::write(folder.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}

pub fn builtin_factories() -> Arc<FactoryTable> {
    let factories = Arc::new(FactoryTable::new());
    register_builtin(&factories);
    factories
}
