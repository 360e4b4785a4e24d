//! Orchestrator State Store adapter.
//!
//! [`ClusterStore`] is the only way the reconciliation components observe or
//! change orchestrator state.  Every call may fail transiently; callers treat
//! a failure as "state unknown this pass" and retry on the next one.

pub mod apiserver;
pub mod memory;
mod wire;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ClaimRecord, SnapshotContentRecord, SnapshotRequest, VolumeRecord};

pub use apiserver::ApiServerStore;
pub use memory::MemoryStore;

/// Typed accessors for claims, volumes, snapshot requests and contents.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Claims in every namespace.
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>>;

    /// Every volume, regardless of who provisioned it.
    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>>;

    /// Snapshot requests in `namespace`, or in every namespace for `None`.
    async fn list_snapshot_requests(&self, namespace: Option<&str>)
    -> Result<Vec<SnapshotRequest>>;

    /// Every snapshot content.
    async fn list_snapshot_contents(&self) -> Result<Vec<SnapshotContentRecord>>;

    /// Submit a new volume.  Fails with `AlreadyExists` on a name conflict.
    async fn create_volume(&self, volume: &VolumeRecord) -> Result<()>;

    /// Delete a volume object.  The backing directory is not touched.
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Submit a new snapshot content.  Fails with `AlreadyExists` on a name
    /// conflict.
    async fn create_snapshot_content(&self, content: &SnapshotContentRecord) -> Result<()>;

    /// Persist the status part of `request` (bound content, readiness,
    /// creation time).
    async fn update_snapshot_request_status(&self, request: &SnapshotRequest) -> Result<()>;
}
