//! Remote Execution capability.
//!
//! The reconciliation components only ever need three things from a host:
//! check that a directory exists, clone a tree copy-on-write, and remove a
//! tree.  [`RemoteExec`] captures exactly that; which transport carries the
//! commands (local process, `ssh`, `kubectl exec`) is a configuration choice
//! made once in [`HostSet::from_config`].

pub mod command;
#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProvisionerConfig;
use crate::error::{ReflinkError, Result};

pub use command::CommandExec;

/// Path operations against one host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Node identity of the host, as used in volume node affinity.
    fn host(&self) -> &str;

    /// `true` when `path` exists as a directory on the host.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Clone `src` to the (not yet existing) `dst` sharing extents.
    async fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Recursively remove `path`.  Removing a missing path succeeds.
    ///
    /// Implementations do not check managed roots; callers must.
    async fn remove_tree(&self, path: &Path) -> Result<()>;
}

/// The hosts this process provisions on.  The first host is the local one.
#[derive(Clone)]
pub struct HostSet {
    hosts: Vec<Arc<dyn RemoteExec>>,
}

impl HostSet {
    /// Wrap `hosts`; the first one is treated as local.
    pub fn new(hosts: Vec<Arc<dyn RemoteExec>>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(ReflinkError::Config("at least one host is required".into()));
        }
        Ok(Self { hosts })
    }

    /// Build command-backed hosts from the config, placing `node_name` first.
    ///
    /// A non-empty host table must name `node_name`.
    pub fn from_config(cfg: &ProvisionerConfig, node_name: &str) -> Result<Self> {
        let mut hosts: Vec<Arc<dyn RemoteExec>> = Vec::new();
        let mut configured = cfg.effective_hosts(node_name);
        let Some(pos) = configured.iter().position(|h| h.name == node_name) else {
            return Err(ReflinkError::Config(format!(
                "node {node_name:?} is not listed in hosts"
            )));
        };
        let local = configured.remove(pos);
        configured.insert(0, local);
        for host in configured {
            hosts.push(Arc::new(CommandExec::new(
                host.name,
                host.transport,
                cfg.clone_mode,
            )));
        }
        Self::new(hosts)
    }

    /// The host this process runs on.
    pub fn local(&self) -> &Arc<dyn RemoteExec> {
        &self.hosts[0]
    }

    /// The host named `name`, if this process manages it.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn RemoteExec>> {
        self.hosts.iter().find(|h| h.host() == name)
    }

    /// All managed hosts, local first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RemoteExec>> {
        self.hosts.iter()
    }

    /// Number of managed hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Always `false` for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, HostTransport};

    #[test]
    fn empty_host_set_rejected() {
        assert!(HostSet::new(Vec::new()).is_err());
    }

    #[test]
    fn local_node_sorted_first() {
        let mut cfg = ProvisionerConfig::new("/data/v", "/data/s", "reflink");
        cfg.hosts = vec![
            HostConfig {
                name: "node-b".into(),
                transport: HostTransport::Ssh {
                    destination: "root@node-b".into(),
                    port: None,
                    identity_file: None,
                },
            },
            HostConfig {
                name: "node-a".into(),
                transport: HostTransport::Local,
            },
        ];
        let hosts = HostSet::from_config(&cfg, "node-a").unwrap();
        assert_eq!(hosts.local().host(), "node-a");
        assert_eq!(hosts.len(), 2);
        assert!(hosts.get("node-b").is_some());
    }

    #[test]
    fn host_table_without_local_node_rejected() {
        let mut cfg = ProvisionerConfig::new("/data/v", "/data/s", "reflink");
        cfg.hosts = vec![HostConfig {
            name: "node-b".into(),
            transport: HostTransport::Ssh {
                destination: "root@node-b".into(),
                port: None,
                identity_file: None,
            },
        }];
        let err = HostSet::from_config(&cfg, "node-a").err().unwrap();
        assert!(matches!(err, ReflinkError::Config(_)));
        assert!(err.to_string().contains("node-a"));
    }
}
