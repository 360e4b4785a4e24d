//! In-process [`ClusterStore`].
//!
//! Backs `--dry-run` and every test in the crate.  Objects live in
//! concurrent maps ([`DashMap`]) keyed the same way the orchestrator keys
//! them.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{ReflinkError, Result};
use crate::store::ClusterStore;
use crate::types::{ClaimRecord, ObjectRef, SnapshotContentRecord, SnapshotRequest, VolumeRecord};

/// Orchestrator state held in memory.
#[derive(Default)]
pub struct MemoryStore {
    claims: DashMap<ObjectRef, ClaimRecord>,
    volumes: DashMap<String, VolumeRecord>,
    requests: DashMap<ObjectRef, SnapshotRequest>,
    contents: DashMap<String, SnapshotContentRecord>,
    /// Number of upcoming `create_volume` calls that fail.
    failing_creates: AtomicUsize,
    /// Number of upcoming list calls that fail.
    failing_lists: AtomicUsize,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a claim.
    pub fn insert_claim(&self, claim: ClaimRecord) {
        self.claims.insert(claim.identity(), claim);
    }

    /// Seed a volume.
    pub fn insert_volume(&self, volume: VolumeRecord) {
        self.volumes.insert(volume.name.clone(), volume);
    }

    /// Seed a snapshot request.
    pub fn insert_snapshot_request(&self, request: SnapshotRequest) {
        self.requests.insert(request.identity(), request);
    }

    /// Seed a snapshot content.
    pub fn insert_snapshot_content(&self, content: SnapshotContentRecord) {
        self.contents.insert(content.name.clone(), content);
    }

    /// The volume named `name`.
    pub fn volume(&self, name: &str) -> Option<VolumeRecord> {
        self.volumes.get(name).map(|v| v.clone())
    }

    /// Every stored volume.
    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.volumes.iter().map(|v| v.value().clone()).collect()
    }

    /// Every stored snapshot content.
    pub fn contents(&self) -> Vec<SnapshotContentRecord> {
        self.contents.iter().map(|c| c.value().clone()).collect()
    }

    /// The snapshot request `namespace/name`.
    pub fn snapshot_request(&self, namespace: &str, name: &str) -> Option<SnapshotRequest> {
        self.requests
            .get(&ObjectRef::new(namespace, name))
            .map(|r| r.clone())
    }

    /// Make the next `n` `create_volume` calls fail with a store error.
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` list calls fail with a store error.
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_list(&self, what: &str) -> Result<()> {
        if Self::take_failure(&self.failing_lists) {
            return Err(ReflinkError::Store(format!("injected list failure: {what}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn list_claims(&self) -> Result<Vec<ClaimRecord>> {
        self.check_list("claims")?;
        let mut claims: Vec<_> = self.claims.iter().map(|c| c.value().clone()).collect();
        claims.sort_by(|a, b| a.identity().cmp(&b.identity()));
        Ok(claims)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        self.check_list("volumes")?;
        let mut volumes = self.volumes();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn list_snapshot_requests(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<SnapshotRequest>> {
        self.check_list("snapshot requests")?;
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .filter(|r| namespace.map_or(true, |ns| r.namespace == ns))
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by(|a, b| a.identity().cmp(&b.identity()));
        Ok(requests)
    }

    async fn list_snapshot_contents(&self) -> Result<Vec<SnapshotContentRecord>> {
        self.check_list("snapshot contents")?;
        let mut contents = self.contents();
        contents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(contents)
    }

    async fn create_volume(&self, volume: &VolumeRecord) -> Result<()> {
        if Self::take_failure(&self.failing_creates) {
            return Err(ReflinkError::Store("injected create failure".into()));
        }
        match self.volumes.entry(volume.name.clone()) {
            Entry::Occupied(_) => Err(ReflinkError::AlreadyExists {
                kind: "PersistentVolume".into(),
                name: volume.name.clone(),
            }),
            Entry::Vacant(slot) => {
                debug!(name = %volume.name, "volume stored");
                slot.insert(volume.clone());
                Ok(())
            }
        }
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ReflinkError::NotFound {
                kind: "PersistentVolume".into(),
                name: name.to_owned(),
            })
    }

    async fn create_snapshot_content(&self, content: &SnapshotContentRecord) -> Result<()> {
        match self.contents.entry(content.name.clone()) {
            Entry::Occupied(_) => Err(ReflinkError::AlreadyExists {
                kind: "VolumeSnapshotContent".into(),
                name: content.name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(content.clone());
                Ok(())
            }
        }
    }

    async fn update_snapshot_request_status(&self, request: &SnapshotRequest) -> Result<()> {
        let mut stored = self
            .requests
            .get_mut(&request.identity())
            .ok_or_else(|| ReflinkError::NotFound {
                kind: "VolumeSnapshot".into(),
                name: request.identity().to_string(),
            })?;
        stored.bound_content_name = request.bound_content_name.clone();
        stored.ready_to_use = request.ready_to_use;
        stored.creation_time = request.creation_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn volume(name: &str) -> VolumeRecord {
        VolumeRecord {
            name: name.into(),
            phase: Default::default(),
            capacity_bytes: 1,
            storage_class: "reflink".into(),
            access_modes: Vec::new(),
            reclaim_policy: Default::default(),
            claim_ref: None,
            local_path: PathBuf::from("/data/volumes").join(name),
            node_affinity: Vec::new(),
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_volume_is_conflict() {
        let store = MemoryStore::new();
        store.create_volume(&volume("v1")).await.unwrap();
        let err = store.create_volume(&volume("v1")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_creates(1);
        assert!(store.create_volume(&volume("v1")).await.is_err());
        store.create_volume(&volume("v1")).await.unwrap();

        store.fail_next_lists(1);
        assert!(store.list_volumes().await.is_err());
        assert!(store.list_volumes().await.is_ok());
    }

    #[tokio::test]
    async fn requests_filtered_by_namespace() {
        let store = MemoryStore::new();
        for (ns, name) in [("a", "s1"), ("b", "s2")] {
            store.insert_snapshot_request(SnapshotRequest {
                namespace: ns.into(),
                name: name.into(),
                ..Default::default()
            });
        }
        assert_eq!(store.list_snapshot_requests(Some("a")).await.unwrap().len(), 1);
        assert_eq!(store.list_snapshot_requests(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_update_only_touches_status() {
        let store = MemoryStore::new();
        store.insert_snapshot_request(SnapshotRequest {
            namespace: "ns".into(),
            name: "s".into(),
            source_claim: Some("c1".into()),
            ..Default::default()
        });
        let update = SnapshotRequest {
            namespace: "ns".into(),
            name: "s".into(),
            bound_content_name: Some("snapcontent-1".into()),
            ready_to_use: true,
            ..Default::default()
        };
        store.update_snapshot_request_status(&update).await.unwrap();

        let stored = store.snapshot_request("ns", "s").unwrap();
        assert_eq!(stored.bound_content_name.as_deref(), Some("snapcontent-1"));
        assert!(stored.ready_to_use);
        assert_eq!(stored.source_claim.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn deleting_missing_volume_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete_volume("nope").await.unwrap_err();
        assert!(matches!(err, ReflinkError::NotFound { .. }));
    }
}
