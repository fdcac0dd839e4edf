//! Kubernetes client for kubestream
//!
//! This crate provides cluster credential resolution (with periodic refresh)
//! and the `kubectl`-backed inventory lookups used for autocompletion.

mod credentials;
mod inventory;

pub use credentials::{
    Connection, Connector, CredentialError, CredentialProvider, KubeConnector,
    DEFAULT_REFRESH_INTERVAL,
};
pub use inventory::{Inventory, InventoryError, InventoryKind};

// Re-export types that are used in our public API
pub use kubestream_types::InventoryQuery;
