//! Provisioner configuration.
//!
//! Loaded from a YAML file (`conf.yml` by default).  The legacy PascalCase
//! keys (`RootPath`, `SnapshotPath`, `StorageClass`) are accepted as aliases
//! so existing deployments keep working.
//!
//! ```yaml
//! root_path: /data/volumes
//! snapshot_path: /data/snapshots
//! storage_class: reflink
//! hosts:
//!   - name: node-a
//!     transport: { kind: local }
//!   - name: node-b
//!     transport: { kind: ssh, destination: root@node-b }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReflinkError, Result};

/// Default aggregator endpoint, reachable through the in-cluster service.
pub const DEFAULT_AGGREGATOR_URL: &str = "http://reflink:8080";
/// Default listener for the aggregator (or a worker's local catalog).
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Default API server endpoint: a `kubectl proxy` sidecar.
pub const DEFAULT_API_SERVER: &str = "http://127.0.0.1:8001";
/// Default driver name stamped on snapshot contents.
pub const DEFAULT_SNAPSHOT_DRIVER: &str = "reflink.rk8s.io";
/// Capacity advertised on every provisioned volume (3 TB).
pub const DEFAULT_CAPACITY_BYTES: u64 = 3_000_000_000_000;

/// Which half of the system this process runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Reconciliation loop on a storage node.
    #[default]
    Worker,
    /// HTTP listener merging catalogs from every worker.
    Aggregator,
}

/// How `cp` is asked to clone directory trees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    /// `--reflink=always`: fail unless the filesystem can share extents.
    #[default]
    Always,
    /// `--reflink=auto`: fall back to a byte copy.  Useful on test hosts.
    Auto,
}

impl CloneMode {
    /// The `cp --reflink` flag for this mode.
    pub fn cp_flag(self) -> &'static str {
        match self {
            Self::Always => "--reflink=always",
            Self::Auto => "--reflink=auto",
        }
    }
}

/// How commands reach a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostTransport {
    /// Run commands as local child processes.
    #[default]
    Local,
    /// Run commands over `ssh`.
    Ssh {
        /// `user@host` or a host alias from the ssh config.
        destination: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity_file: Option<PathBuf>,
    },
    /// Run commands inside a pod through `kubectl exec`.
    Kubectl {
        namespace: String,
        pod: String,
        #[serde(default)]
        container: Option<String>,
    },
}

/// A host participating in provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    /// Node identity used in volume node affinity.
    pub name: String,
    #[serde(default)]
    pub transport: HostTransport,
}

/// Full provisioner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Managed root holding one directory per provisioned volume.
    #[serde(alias = "RootPath")]
    pub root_path: PathBuf,
    /// Snapshot store / dataset root.
    #[serde(alias = "SnapshotPath")]
    pub snapshot_path: PathBuf,
    /// Primary storage class handled by this provisioner.
    #[serde(alias = "StorageClass")]
    pub storage_class: String,
    /// Additional class names accepted on claims.
    #[serde(default)]
    pub storage_class_aliases: Vec<String>,
    #[serde(default)]
    pub role: Role,
    /// Identity of the node this process runs on.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_aggregator_url")]
    pub aggregator_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Serve this worker's own catalog on `listen_addr`.
    #[serde(default)]
    pub serve_local_catalog: bool,
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_report_timeout_ms")]
    pub report_timeout_ms: u64,
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,
    /// Unreferenced directories younger than this are left alone.
    #[serde(default)]
    pub orphan_grace_secs: u64,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    #[serde(default = "default_snapshot_driver")]
    pub snapshot_driver: String,
    /// Snapshot class stamped on contents; defaults to the storage class.
    #[serde(default)]
    pub snapshot_class: Option<String>,
    /// Namespaces scanned for snapshot requests.  Empty means all.
    #[serde(default)]
    pub snapshot_namespaces: Vec<String>,
    #[serde(default)]
    pub clone_mode: CloneMode,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

fn default_aggregator_url() -> String {
    DEFAULT_AGGREGATOR_URL.to_owned()
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_owned()
}

fn default_api_server() -> String {
    DEFAULT_API_SERVER.to_owned()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_report_timeout_ms() -> u64 {
    1000
}

fn default_freshness_window_secs() -> u64 {
    120
}

fn default_capacity_bytes() -> u64 {
    DEFAULT_CAPACITY_BYTES
}

fn default_snapshot_driver() -> String {
    DEFAULT_SNAPSHOT_DRIVER.to_owned()
}

impl ProvisionerConfig {
    /// Minimal configuration with every optional field at its default.
    pub fn new(
        root_path: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            root_path: root_path.into(),
            snapshot_path: snapshot_path.into(),
            storage_class: storage_class.into(),
            storage_class_aliases: Vec::new(),
            role: Role::default(),
            node_name: None,
            aggregator_url: default_aggregator_url(),
            listen_addr: default_listen_addr(),
            serve_local_catalog: false,
            api_server: default_api_server(),
            interval_secs: default_interval_secs(),
            report_timeout_ms: default_report_timeout_ms(),
            freshness_window_secs: default_freshness_window_secs(),
            orphan_grace_secs: 0,
            capacity_bytes: default_capacity_bytes(),
            snapshot_driver: default_snapshot_driver(),
            snapshot_class: None,
            snapshot_namespaces: Vec::new(),
            clone_mode: CloneMode::default(),
            hosts: Vec::new(),
        }
    }

    /// Read and validate a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReflinkError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw)
            .map_err(|e| ReflinkError::Config(format!("parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the reconciliation components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.root_path.is_absolute() {
            return Err(ReflinkError::Config(format!(
                "root_path must be absolute, got {}",
                self.root_path.display()
            )));
        }
        if !self.snapshot_path.is_absolute() {
            return Err(ReflinkError::Config(format!(
                "snapshot_path must be absolute, got {}",
                self.snapshot_path.display()
            )));
        }
        if self.root_path.starts_with(&self.snapshot_path)
            || self.snapshot_path.starts_with(&self.root_path)
        {
            return Err(ReflinkError::Config(
                "root_path and snapshot_path must not contain one another".into(),
            ));
        }
        if self.storage_class.trim().is_empty() {
            return Err(ReflinkError::Config("storage_class must be set".into()));
        }
        if self.interval_secs == 0 {
            return Err(ReflinkError::Config("interval_secs must be positive".into()));
        }
        if self.freshness_window_secs == 0 {
            return Err(ReflinkError::Config(
                "freshness_window_secs must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() || !seen.insert(host.name.as_str()) {
                return Err(ReflinkError::Config(format!(
                    "host names must be unique and non-empty, got {:?}",
                    host.name
                )));
            }
        }
        Ok(())
    }

    /// `true` when a claim asking for `class` belongs to this provisioner.
    ///
    /// Claims that do not name a class are accepted.
    pub fn accepts_class(&self, class: Option<&str>) -> bool {
        match class {
            None => true,
            Some(class) => {
                class == self.storage_class
                    || self.storage_class_aliases.iter().any(|alias| alias == class)
            }
        }
    }

    /// Hosts to provision on.  Without an explicit table, the local node is
    /// the only host.
    pub fn effective_hosts(&self, node_name: &str) -> Vec<HostConfig> {
        if self.hosts.is_empty() {
            return vec![HostConfig {
                name: node_name.to_owned(),
                transport: HostTransport::Local,
            }];
        }
        self.hosts.clone()
    }

    /// Snapshot class, defaulting to the storage class.
    pub fn effective_snapshot_class(&self) -> &str {
        self.snapshot_class.as_deref().unwrap_or(&self.storage_class)
    }

    /// Delay between reconciliation passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Upper bound on one report delivery.
    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    /// Age after which a provider's report is dropped.
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    /// Minimum age of a directory before the orphan sweep may remove it.
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}
