//! Fixtures shared by the unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ProvisionerConfig;
use crate::context::Context;
use crate::exec::fake::FakeExec;
use crate::exec::{HostSet, RemoteExec};
use crate::store::MemoryStore;
use crate::types::{
    AccessMode, ClaimPhase, ClaimRecord, DataSourceRef, ObjectRef, ReclaimPolicy,
    SnapshotContentRecord, VolumePhase, VolumeRecord,
};

pub const VOLUME_ROOT: &str = "/data/volumes";
pub const SNAPSHOT_ROOT: &str = "/data/snapshots";

pub struct Fixture {
    pub ctx: Context,
    pub store: Arc<MemoryStore>,
    pub exec: Arc<FakeExec>,
}

pub fn config(volume_root: &Path, snapshot_root: &Path) -> ProvisionerConfig {
    let mut cfg = ProvisionerConfig::new(volume_root, snapshot_root, "reflink");
    cfg.storage_class_aliases = vec!["reflink-legacy".into()];
    cfg
}

/// Context over a [`MemoryStore`] and a single [`FakeExec`] host.
pub fn fixture(exec: FakeExec) -> Fixture {
    fixture_at(Path::new(VOLUME_ROOT), Path::new(SNAPSHOT_ROOT), exec)
}

pub fn fixture_at(volume_root: &Path, snapshot_root: &Path, exec: FakeExec) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let exec = Arc::new(exec);
    let hosts = HostSet::new(vec![Arc::clone(&exec) as Arc<dyn RemoteExec>]).unwrap();
    let ctx = Context::new(config(volume_root, snapshot_root), store.clone(), hosts).unwrap();
    Fixture { ctx, store, exec }
}

pub fn dataset_path(name: &str) -> PathBuf {
    Path::new(SNAPSHOT_ROOT).join(name)
}

pub fn pending_claim(namespace: &str, name: &str, dataset: &str) -> ClaimRecord {
    ClaimRecord {
        namespace: namespace.into(),
        name: name.into(),
        phase: ClaimPhase::Pending,
        storage_class: Some("reflink".into()),
        data_source: Some(DataSourceRef {
            kind: String::new(),
            name: dataset.into(),
        }),
        selector_source: None,
    }
}

pub fn volume(name: &str, claim: Option<ObjectRef>, local_path: impl Into<PathBuf>) -> VolumeRecord {
    VolumeRecord {
        name: name.into(),
        phase: VolumePhase::Bound,
        capacity_bytes: 1,
        storage_class: "reflink".into(),
        access_modes: vec![AccessMode::ReadWriteOnce],
        reclaim_policy: ReclaimPolicy::Delete,
        claim_ref: claim,
        local_path: local_path.into(),
        node_affinity: vec!["node-a".into()],
        labels: BTreeMap::from([("source".into(), "dataset-x".into())]),
    }
}

pub fn content(name: &str, request: ObjectRef, handle: impl Into<PathBuf>) -> SnapshotContentRecord {
    SnapshotContentRecord {
        name: name.into(),
        driver: crate::config::DEFAULT_SNAPSHOT_DRIVER.into(),
        snapshot_class: Some("reflink".into()),
        labels: BTreeMap::new(),
        source_volume_handle: handle.into(),
        request_ref: request,
        request_uid: String::new(),
    }
}
