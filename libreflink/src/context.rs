//! Shared state handed to every reconciliation component.

use std::sync::Arc;

use crate::config::ProvisionerConfig;
use crate::error::Result;
use crate::exec::HostSet;
use crate::paths::ManagedRoot;
use crate::store::ClusterStore;

/// Configuration, collaborators and managed roots of one provisioner
/// process.
pub struct Context {
    pub config: ProvisionerConfig,
    pub store: Arc<dyn ClusterStore>,
    pub hosts: HostSet,
    /// Root holding one directory per provisioned volume.
    pub volume_root: ManagedRoot,
    /// Snapshot store / dataset root.
    pub snapshot_root: ManagedRoot,
}

impl Context {
    /// Bundle the pieces, deriving the managed roots from `config`.
    pub fn new(
        config: ProvisionerConfig,
        store: Arc<dyn ClusterStore>,
        hosts: HostSet,
    ) -> Result<Self> {
        config.validate()?;
        let volume_root = ManagedRoot::new(&config.root_path)?;
        let snapshot_root = ManagedRoot::new(&config.snapshot_path)?;
        Ok(Self {
            config,
            store,
            hosts,
            volume_root,
            snapshot_root,
        })
    }

    /// Identity of the node this process runs on.
    pub fn node_name(&self) -> &str {
        self.hosts.local().host()
    }
}
