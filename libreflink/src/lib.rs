//! # libreflink: copy-on-write local volumes for RK8s
//!
//! `libreflink` provisions local-path volumes by cloning dataset directories
//! with reflinks, so a multi-terabyte dataset becomes a writable volume in
//! moments and only diverging blocks consume space.  It also bridges
//! orchestrator snapshot requests onto the same clone primitive, garbage
//! collects what the orchestrator no longer references, and publishes the
//! datasets each node holds to a central catalog aggregator.
//!
//! Everything is driven by a polling [`reconcile::Reconciler`]: each pass
//! re-derives the desired state from a full listing of the store, so a crash
//! at any point heals on the next pass.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: claims, volumes, snapshot objects, datasets. |
//! | [`error`] | [`ReflinkError`] enum covering all failure modes. |
//! | [`config`] | [`ProvisionerConfig`] loaded from YAML. |
//! | [`paths`] | [`ManagedRoot`] root-safety guard. |
//! | [`sidecar`] | Legacy `<name>.meta` dataset metadata. |
//! | [`exec`] | [`RemoteExec`] trait: exists / clone / remove on a host. |
//! | [`store`] | [`ClusterStore`] trait: orchestrator objects (memory, API server). |
//! | [`provision`] | Claims to cloned volumes. |
//! | [`snapshot`] | Snapshot requests to cloned datasets. |
//! | [`gc`] | Failed-volume and orphan-directory sweeps. |
//! | [`catalog`] | Per-node dataset catalog and its JSON/CSV views. |
//! | [`aggregator`] | [`AggregatorCache`]: latest report per provider. |
//! | [`transport`] | HTTP catalog server and report client on `hyper`. |
//! | [`reconcile`] | The reconciliation loop. |

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod gc;
pub mod paths;
pub mod provision;
pub mod reconcile;
pub mod sidecar;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutil;

pub use aggregator::AggregatorCache;
pub use config::{ProvisionerConfig, Role};
pub use context::Context;
pub use error::{ReflinkError, Result};
pub use exec::{HostSet, RemoteExec};
pub use paths::ManagedRoot;
pub use reconcile::{PassSummary, Reconciler};
pub use store::{ApiServerStore, ClusterStore, MemoryStore};
pub use types::*;
