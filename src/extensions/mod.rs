//! Extension records, their per-process instances, and the coordinator that
//! drives instances through their lifecycle.

pub mod contributions;
pub mod directory;
pub mod instance;
pub mod instantiator;
pub mod lifecycle;
pub mod record;
pub mod registration;
pub mod runtime;

pub use contributions::{Category, Command, Route};
pub use directory::{DirectorySource, HostDirectory, ViewDirectory};
pub use instance::{ExtensionInstance, LifecycleState};
pub use instantiator::{InstanceTable, Instantiation, Instantiator};
pub use lifecycle::{AutoInit, Coordinator, LifecycleEvent, LoadingHandle, wait_for_bundled};
pub use record::{DirectorySnapshot, ExtensionManifest, InstalledExtensionRecord, RecordMap};
pub use registration::{
    Contribution, ContributionKey, Reactive, Registrar, Registries, Registry, Snapshot,
};
pub use runtime::{
    Extension, ExtensionContext, ExtensionFactory, FactoryResolver, FactoryTable,
};

use serde::{Deserialize, Serialize};

/// Which side of the shell a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Host,
    View,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Host => f.write_str("host"),
            ProcessKind::View => f.write_str("view"),
        }
    }
}

/// Errors returned synchronously by the host directory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    #[error("Enabled state of bundled extension {0} cannot be changed")]
    ImmutableBundledState(String),
}
