//! Kubernetes wire shapes for the handful of resources the provisioner
//! touches, and their conversion into the typed records of
//! [`crate::types`].
//!
//! Only the fields this crate reads or writes are modelled; everything else
//! in the payload is ignored by serde.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AccessMode, ClaimPhase, ClaimRecord, DataSourceRef, ObjectRef, ReclaimPolicy, SOURCE_LABEL,
    SnapshotContentRecord, SnapshotRequest, VolumePhase, VolumeRecord,
};

/// Node label used to pin local volumes to hosts.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectReference {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

// ---------------------------------------------------------------------------
// PersistentVolumeClaim
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Pvc {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PvcSpec,
    #[serde(default)]
    pub status: PhaseStatus,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    #[serde(default)]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub data_source: Option<TypedReference>,
    #[serde(default)]
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Deserialize)]
pub struct TypedReference {
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl From<Pvc> for ClaimRecord {
    fn from(pvc: Pvc) -> Self {
        let phase = pvc
            .status
            .phase
            .as_deref()
            .map(parse_claim_phase)
            .unwrap_or_default();
        let selector_source = pvc
            .spec
            .selector
            .and_then(|mut s| s.match_labels.remove(SOURCE_LABEL));
        Self {
            namespace: pvc.metadata.namespace.unwrap_or_default(),
            name: pvc.metadata.name,
            phase,
            storage_class: pvc.spec.storage_class_name,
            data_source: pvc.spec.data_source.map(|ds| DataSourceRef {
                kind: ds.kind,
                name: ds.name,
            }),
            selector_source,
        }
    }
}

fn parse_claim_phase(phase: &str) -> ClaimPhase {
    match phase {
        "Pending" => ClaimPhase::Pending,
        "Bound" => ClaimPhase::Bound,
        "Lost" => ClaimPhase::Lost,
        _ => ClaimPhase::Unknown,
    }
}

// ---------------------------------------------------------------------------
// PersistentVolume
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct Pv {
    #[serde(rename = "apiVersion", default = "core_api_version")]
    pub api_version: String,
    #[serde(default = "pv_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PvSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PhaseStatus>,
}

fn core_api_version() -> String {
    "v1".to_owned()
}

fn pv_kind() -> String {
    "PersistentVolume".to_owned()
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PvSpec {
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_reclaim_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<VolumeNodeAffinity>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalSource {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct VolumeNodeAffinity {
    #[serde(default)]
    pub required: Option<NodeSelector>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl From<Pv> for VolumeRecord {
    fn from(pv: Pv) -> Self {
        let phase = pv
            .status
            .and_then(|s| s.phase)
            .map(|p| parse_volume_phase(&p))
            .unwrap_or_default();
        let capacity_bytes = pv
            .spec
            .capacity
            .get("storage")
            .and_then(|q| parse_quantity(q))
            .unwrap_or(0);
        let node_affinity = pv
            .spec
            .node_affinity
            .and_then(|a| a.required)
            .map(|r| {
                r.node_selector_terms
                    .into_iter()
                    .flat_map(|t| t.match_expressions)
                    .filter(|e| e.key == HOSTNAME_LABEL && e.operator == "In")
                    .flat_map(|e| e.values)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: pv.metadata.name,
            phase,
            capacity_bytes,
            storage_class: pv.spec.storage_class_name.unwrap_or_default(),
            access_modes: pv
                .spec
                .access_modes
                .iter()
                .filter_map(|m| parse_access_mode(m))
                .collect(),
            reclaim_policy: match pv.spec.persistent_volume_reclaim_policy.as_deref() {
                Some("Retain") => ReclaimPolicy::Retain,
                _ => ReclaimPolicy::Delete,
            },
            claim_ref: pv
                .spec
                .claim_ref
                .map(|r| ObjectRef::new(r.namespace, r.name)),
            local_path: pv.spec.local.map(|l| PathBuf::from(l.path)).unwrap_or_default(),
            node_affinity,
            labels: pv.metadata.labels,
        }
    }
}

impl From<&VolumeRecord> for Pv {
    fn from(v: &VolumeRecord) -> Self {
        let node_affinity = (!v.node_affinity.is_empty()).then(|| VolumeNodeAffinity {
            required: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_owned(),
                        operator: "In".to_owned(),
                        values: v.node_affinity.clone(),
                    }],
                }],
            }),
        });
        Self {
            api_version: core_api_version(),
            kind: pv_kind(),
            metadata: ObjectMeta {
                name: v.name.clone(),
                labels: v.labels.clone(),
                ..Default::default()
            },
            spec: PvSpec {
                capacity: BTreeMap::from([("storage".to_owned(), v.capacity_bytes.to_string())]),
                access_modes: v
                    .access_modes
                    .iter()
                    .map(|m| access_mode_name(*m).to_owned())
                    .collect(),
                persistent_volume_reclaim_policy: Some(
                    match v.reclaim_policy {
                        ReclaimPolicy::Delete => "Delete",
                        ReclaimPolicy::Retain => "Retain",
                    }
                    .to_owned(),
                ),
                storage_class_name: Some(v.storage_class.clone()),
                volume_mode: Some("Filesystem".to_owned()),
                claim_ref: v.claim_ref.as_ref().map(|r| ObjectReference {
                    namespace: r.namespace.clone(),
                    name: r.name.clone(),
                    uid: String::new(),
                }),
                local: Some(LocalSource {
                    path: v.local_path.display().to_string(),
                }),
                node_affinity,
            },
            status: None,
        }
    }
}

fn parse_volume_phase(phase: &str) -> VolumePhase {
    match phase {
        "Pending" => VolumePhase::Pending,
        "Available" => VolumePhase::Available,
        "Bound" => VolumePhase::Bound,
        "Released" => VolumePhase::Released,
        "Failed" => VolumePhase::Failed,
        _ => VolumePhase::Unknown,
    }
}

fn parse_access_mode(mode: &str) -> Option<AccessMode> {
    match mode {
        "ReadWriteOnce" => Some(AccessMode::ReadWriteOnce),
        "ReadOnlyMany" => Some(AccessMode::ReadOnlyMany),
        "ReadWriteMany" => Some(AccessMode::ReadWriteMany),
        _ => None,
    }
}

fn access_mode_name(mode: AccessMode) -> &'static str {
    match mode {
        AccessMode::ReadWriteOnce => "ReadWriteOnce",
        AccessMode::ReadOnlyMany => "ReadOnlyMany",
        AccessMode::ReadWriteMany => "ReadWriteMany",
    }
}

/// Parse a resource quantity such as `3000000000000`, `10Gi` or `3T`.
///
/// Fractional quantities are not produced by this provisioner and yield
/// `None`.
pub fn parse_quantity(q: &str) -> Option<u64> {
    const SUFFIXES: [(&str, u64); 12] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];
    let q = q.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number.parse::<u64>().ok()?.checked_mul(factor);
        }
    }
    q.parse().ok()
}

// ---------------------------------------------------------------------------
// VolumeSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VolumeSnapshot {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VolumeSnapshotSpec,
    #[serde(default)]
    pub status: Option<VolumeSnapshotStatus>,
}

#[derive(Debug, Deserialize, Default)]
pub struct VolumeSnapshotSpec {
    #[serde(default)]
    pub source: VolumeSnapshotSource,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default)]
    pub persistent_volume_claim_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

/// Merge-patch body for the status subresource.
#[derive(Debug, Serialize)]
pub struct StatusPatch {
    pub status: VolumeSnapshotStatus,
}

impl From<&SnapshotRequest> for StatusPatch {
    fn from(r: &SnapshotRequest) -> Self {
        Self {
            status: VolumeSnapshotStatus {
                bound_volume_snapshot_content_name: r.bound_content_name.clone(),
                ready_to_use: Some(r.ready_to_use),
                creation_time: r.creation_time,
            },
        }
    }
}

impl From<VolumeSnapshot> for SnapshotRequest {
    fn from(vs: VolumeSnapshot) -> Self {
        let status = vs.status.unwrap_or_default();
        Self {
            namespace: vs.metadata.namespace.unwrap_or_default(),
            name: vs.metadata.name,
            uid: vs.metadata.uid,
            labels: vs.metadata.labels,
            source_claim: vs.spec.source.persistent_volume_claim_name,
            bound_content_name: status.bound_volume_snapshot_content_name,
            ready_to_use: status.ready_to_use.unwrap_or(false),
            creation_time: status.creation_time,
        }
    }
}

// ---------------------------------------------------------------------------
// VolumeSnapshotContent
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeSnapshotContent {
    #[serde(rename = "apiVersion", default = "snapshot_api_version")]
    pub api_version: String,
    #[serde(default = "content_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotContentSpec,
}

fn snapshot_api_version() -> String {
    "snapshot.storage.k8s.io/v1".to_owned()
}

fn content_kind() -> String {
    "VolumeSnapshotContent".to_owned()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentSpec {
    #[serde(default)]
    pub driver: String,
    #[serde(default = "delete_policy")]
    pub deletion_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
    #[serde(default)]
    pub source: ContentSource,
    #[serde(default)]
    pub volume_snapshot_ref: ObjectReference,
}

fn delete_policy() -> String {
    "Delete".to_owned()
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
}

impl From<VolumeSnapshotContent> for SnapshotContentRecord {
    fn from(c: VolumeSnapshotContent) -> Self {
        let handle = c
            .spec
            .source
            .volume_handle
            .or(c.spec.source.snapshot_handle)
            .unwrap_or_default();
        Self {
            name: c.metadata.name,
            driver: c.spec.driver,
            snapshot_class: c.spec.volume_snapshot_class_name,
            labels: c.metadata.labels,
            source_volume_handle: PathBuf::from(handle),
            request_ref: ObjectRef::new(
                c.spec.volume_snapshot_ref.namespace,
                c.spec.volume_snapshot_ref.name,
            ),
            request_uid: c.spec.volume_snapshot_ref.uid,
        }
    }
}

impl From<&SnapshotContentRecord> for VolumeSnapshotContent {
    fn from(c: &SnapshotContentRecord) -> Self {
        Self {
            api_version: snapshot_api_version(),
            kind: content_kind(),
            metadata: ObjectMeta {
                name: c.name.clone(),
                labels: c.labels.clone(),
                ..Default::default()
            },
            spec: VolumeSnapshotContentSpec {
                driver: c.driver.clone(),
                deletion_policy: delete_policy(),
                volume_snapshot_class_name: c.snapshot_class.clone(),
                source: ContentSource {
                    volume_handle: Some(c.source_volume_handle.display().to_string()),
                    snapshot_handle: None,
                },
                volume_snapshot_ref: ObjectReference {
                    namespace: c.request_ref.namespace.clone(),
                    name: c.request_ref.name.clone(),
                    uid: c.request_uid.clone(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("3000000000000"), Some(3_000_000_000_000));
        assert_eq!(parse_quantity("10Gi"), Some(10 << 30));
        assert_eq!(parse_quantity("3T"), Some(3_000_000_000_000));
        assert_eq!(parse_quantity("1.5Gi"), None);
    }

    #[test]
    fn pvc_decodes_data_source_and_selector() {
        let json = r#"{
            "metadata": {"name": "c1", "namespace": "ns"},
            "spec": {
                "storageClassName": "reflink",
                "dataSource": {"kind": "VolumeSnapshot", "name": "snap-1", "apiGroup": "snapshot.storage.k8s.io"},
                "selector": {"matchLabels": {"source": "dataset-x"}}
            },
            "status": {"phase": "Pending"}
        }"#;
        let claim: ClaimRecord = serde_json::from_str::<Pvc>(json).unwrap().into();
        assert_eq!(claim.identity(), ObjectRef::new("ns", "c1"));
        assert_eq!(claim.phase, ClaimPhase::Pending);
        assert!(claim.data_source.as_ref().unwrap().is_snapshot());
        assert_eq!(claim.selector_source.as_deref(), Some("dataset-x"));
    }

    #[test]
    fn pv_decodes_affinity_and_claim_ref() {
        let json = r#"{
            "metadata": {"name": "pv-1", "labels": {"source": "dataset-x"}},
            "spec": {
                "capacity": {"storage": "3T"},
                "accessModes": ["ReadWriteOnce"],
                "claimRef": {"namespace": "ns", "name": "c1"},
                "local": {"path": "/data/volumes/pv-1"},
                "nodeAffinity": {"required": {"nodeSelectorTerms": [
                    {"matchExpressions": [{"key": "kubernetes.io/hostname", "operator": "In", "values": ["node-a"]}]}
                ]}}
            },
            "status": {"phase": "Failed"}
        }"#;
        let volume: VolumeRecord = serde_json::from_str::<Pv>(json).unwrap().into();
        assert_eq!(volume.phase, VolumePhase::Failed);
        assert_eq!(volume.capacity_bytes, 3_000_000_000_000);
        assert_eq!(volume.claim_ref, Some(ObjectRef::new("ns", "c1")));
        assert_eq!(volume.node_affinity, vec!["node-a".to_owned()]);
        assert_eq!(volume.local_path, PathBuf::from("/data/volumes/pv-1"));
    }

    #[test]
    fn pv_without_local_source_has_empty_path() {
        let json = r#"{"metadata": {"name": "nfs"}, "spec": {"nfs": {"server": "x"}}}"#;
        let volume: VolumeRecord = serde_json::from_str::<Pv>(json).unwrap().into();
        assert!(volume.local_path.as_os_str().is_empty());
    }

    #[test]
    fn volume_encodes_as_local_pv() {
        let record = VolumeRecord {
            name: "abc".into(),
            phase: VolumePhase::Pending,
            capacity_bytes: 42,
            storage_class: "reflink".into(),
            access_modes: vec![AccessMode::ReadWriteOnce],
            reclaim_policy: ReclaimPolicy::Delete,
            claim_ref: Some(ObjectRef::new("ns", "c1")),
            local_path: PathBuf::from("/data/volumes/abc"),
            node_affinity: vec!["node-a".into(), "node-b".into()],
            labels: BTreeMap::from([("source".into(), "dataset-x".into())]),
        };
        let value = serde_json::to_value(Pv::from(&record)).unwrap();
        assert_eq!(value["kind"], "PersistentVolume");
        assert_eq!(value["spec"]["capacity"]["storage"], "42");
        assert_eq!(value["spec"]["local"]["path"], "/data/volumes/abc");
        assert_eq!(value["spec"]["persistentVolumeReclaimPolicy"], "Delete");
        assert_eq!(
            value["spec"]["nodeAffinity"]["required"]["nodeSelectorTerms"][0]["matchExpressions"][0]
                ["values"][1],
            "node-b"
        );
        assert!(value.get("status").is_none());
    }

    #[test]
    fn snapshot_status_patch_shape() {
        let request = SnapshotRequest {
            bound_content_name: Some("snapcontent-1".into()),
            ready_to_use: true,
            ..Default::default()
        };
        let value = serde_json::to_value(StatusPatch::from(&request)).unwrap();
        assert_eq!(value["status"]["boundVolumeSnapshotContentName"], "snapcontent-1");
        assert_eq!(value["status"]["readyToUse"], true);
    }

    #[test]
    fn content_decodes_volume_handle() {
        let json = r#"{
            "metadata": {"name": "snapcontent-1", "labels": {"type": "postgres"}},
            "spec": {
                "driver": "reflink.rk8s.io",
                "deletionPolicy": "Delete",
                "source": {"volumeHandle": "/data/snapshots/abc"},
                "volumeSnapshotRef": {"namespace": "ns", "name": "snap-1", "uid": "u1"}
            }
        }"#;
        let content: SnapshotContentRecord =
            serde_json::from_str::<VolumeSnapshotContent>(json).unwrap().into();
        assert_eq!(content.source_volume_handle, PathBuf::from("/data/snapshots/abc"));
        assert_eq!(content.request_ref, ObjectRef::new("ns", "snap-1"));
        assert_eq!(content.request_uid, "u1");
    }
}
