//! Core data model: claims, volumes, snapshot objects, datasets and catalog
//! reports.
//!
//! These are the typed records the reconciliation components work on.  The
//! store adapters decode orchestrator payloads into them at the boundary, so
//! nothing past [`crate::store`] ever sees loosely-typed JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label written on every provisioned volume naming its source dataset.
pub const SOURCE_LABEL: &str = "source";

/// Label carrying the free-form dataset classification.
pub const TYPE_LABEL: &str = "type";

/// Dataset type reported when nothing better is known.
pub const UNKNOWN_TYPE: &str = "unknown";

/// Data-source kind that routes resolution through snapshot contents.
pub const SNAPSHOT_KIND: &str = "VolumeSnapshot";

// ---------------------------------------------------------------------------
// Object references
// ---------------------------------------------------------------------------

/// `(namespace, name)` identity of a namespaced orchestrator object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    /// Reference to `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Lifecycle phase of a storage claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
    #[serde(other)]
    Unknown,
}

/// Named data source declared on a claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSourceRef {
    /// Resource kind, e.g. `VolumeSnapshot`.  Anything else is treated as a
    /// legacy dataset name.
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

impl DataSourceRef {
    /// `true` when this data source names a snapshot request.
    pub fn is_snapshot(&self) -> bool {
        self.kind == SNAPSHOT_KIND
    }
}

/// A request for storage, owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaimRecord {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub phase: ClaimPhase,
    /// Requested storage class.  `None` means the claim did not ask for one.
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub data_source: Option<DataSourceRef>,
    /// Dataset name taken from the claim's `source` label selector.
    #[serde(default)]
    pub selector_source: Option<String>,
}

impl ClaimRecord {
    /// The claim's `namespace/name`.
    pub fn identity(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// Lifecycle phase of a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// What the orchestrator does with a volume once its claim is released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

/// A provisioned local-path volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Generated unique id, also the directory name under the managed root.
    pub name: String,
    #[serde(default)]
    pub phase: VolumePhase,
    /// Fixed ceiling; backing storage is thinly provisioned.
    pub capacity_bytes: u64,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub claim_ref: Option<ObjectRef>,
    /// Backing directory.  Must lie under the configured root.
    pub local_path: PathBuf,
    /// Node identities allowed to mount the volume.
    #[serde(default)]
    pub node_affinity: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeRecord {
    /// `true` when this volume is bound (or being bound) to `claim`.
    pub fn is_claimed_by(&self, claim: &ObjectRef) -> bool {
        self.claim_ref.as_ref() == Some(claim)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// An orchestrator-native snapshot request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotRequest {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Name of the claim whose volume should be captured.
    #[serde(default)]
    pub source_claim: Option<String>,
    /// Set exactly once, when the request is materialized.
    #[serde(default)]
    pub bound_content_name: Option<String>,
    #[serde(default)]
    pub ready_to_use: bool,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}

impl SnapshotRequest {
    /// The request's `namespace/name`.
    pub fn identity(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }

    /// Bound requests are terminal and never revisited.
    pub fn is_bound(&self) -> bool {
        self.bound_content_name
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }
}

/// Materialized backing data for a [`SnapshotRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContentRecord {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub snapshot_class: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// On-disk directory holding the snapshot data.
    pub source_volume_handle: PathBuf,
    /// Back-reference to the request this content satisfies.
    pub request_ref: ObjectRef,
    #[serde(default)]
    pub request_uid: String,
}

impl SnapshotContentRecord {
    /// `true` when this content was created for `request`.
    pub fn satisfies(&self, request: &SnapshotRequest) -> bool {
        self.request_ref.namespace == request.namespace
            && self.request_ref.name == request.name
            && (self.request_uid.is_empty()
                || request.uid.is_empty()
                || self.request_uid == request.uid)
    }
}

// ---------------------------------------------------------------------------
// Datasets & catalogs
// ---------------------------------------------------------------------------

/// Where a dataset entry was discovered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetOrigin {
    /// Directory paired with a legacy `<name>.meta` sidecar file.
    #[default]
    Sidecar,
    /// Orchestrator-declared snapshot content.
    SnapshotContent,
}

/// A named, reusable directory usable as a provisioning source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub origin: DatasetOrigin,
}

/// One provider's dataset catalog as transmitted to the aggregator.
///
/// Sent as `source` and `dumps`; `Source` is also accepted from older
/// reporters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogReport {
    #[serde(rename = "source", alias = "Source")]
    pub provider_id: String,
    #[serde(rename = "dumps", default)]
    pub entries: Vec<DatasetEntry>,
    /// Stamped by the aggregator on receipt; never taken from the wire.
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
}

impl CatalogReport {
    /// An unstamped report from `provider_id`.
    pub fn new(provider_id: impl Into<String>, entries: Vec<DatasetEntry>) -> Self {
        Self {
            provider_id: provider_id.into(),
            entries,
            received_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_display() {
        assert_eq!(ObjectRef::new("ns", "c1").to_string(), "ns/c1");
    }

    #[test]
    fn unknown_phase_decodes() {
        let phase: VolumePhase = serde_json::from_str("\"Terminating\"").expect("decode");
        assert_eq!(phase, VolumePhase::Unknown);
    }

    #[test]
    fn empty_bound_content_is_unbound() {
        let mut req = SnapshotRequest {
            bound_content_name: Some(String::new()),
            ..Default::default()
        };
        assert!(!req.is_bound());
        req.bound_content_name = Some("snapcontent-1".into());
        assert!(req.is_bound());
    }

    #[test]
    fn report_ignores_received_at_on_the_wire() {
        let json = r#"{"source":"node-a","dumps":[{"name":"d1","type":"pg"}],"received_at":"2020-01-01T00:00:00Z"}"#;
        let report: CatalogReport = serde_json::from_str(json).expect("decode");
        assert_eq!(report.provider_id, "node-a");
        assert_eq!(report.entries[0].kind, "pg");
        assert!(report.received_at.is_none());
    }

    #[test]
    fn content_matches_request_by_identity_and_uid() {
        let content = SnapshotContentRecord {
            name: "snapcontent-1".into(),
            driver: "reflink.rk8s.io".into(),
            snapshot_class: None,
            labels: BTreeMap::new(),
            source_volume_handle: PathBuf::from("/snap/x"),
            request_ref: ObjectRef::new("ns", "snap"),
            request_uid: "uid-1".into(),
        };
        let mut req = SnapshotRequest {
            namespace: "ns".into(),
            name: "snap".into(),
            uid: "uid-1".into(),
            ..Default::default()
        };
        assert!(content.satisfies(&req));
        req.uid = "uid-2".into();
        assert!(!content.satisfies(&req));
    }
}
