//! Snapshot Bridge: materializes snapshot requests as cloned datasets.
//!
//! For each unbound request the bridge clones the backing directory of the
//! source claim's volume into the snapshot store, declares a snapshot
//! content pointing at the clone, then marks the request bound and ready.
//! Bound requests are terminal.
//!
//! A content created for a request whose status update then failed is found
//! again on the next pass and only the binding is retried, so one request
//! never produces two datasets.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::error::{ReflinkError, Result};
use crate::exec::RemoteExec;
use crate::types::{SnapshotContentRecord, SnapshotRequest, VolumeRecord};

/// Prefix of generated snapshot content names.
pub const CONTENT_PREFIX: &str = "snapcontent-";

/// Outcome of one snapshot pass.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    /// Contents created this pass.
    pub materialized: Vec<String>,
    /// Requests bound to a content left over from an earlier pass.
    pub rebound: usize,
    /// Requests waiting on their source volume, or whose volume lives on
    /// another node.
    pub waiting: usize,
    pub failed: usize,
}

/// Snapshot Bridge over a [`Context`].
pub struct SnapshotBridge<'a> {
    ctx: &'a Context,
}

impl<'a> SnapshotBridge<'a> {
    /// A bridge acting on `ctx`'s store and hosts.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Process every request once.
    ///
    /// `contents` is the current list of snapshot contents; contents created
    /// during the pass are appended so later requests see them.
    pub async fn snapshot_pass(
        &self,
        requests: &[SnapshotRequest],
        volumes: &[VolumeRecord],
        contents: &mut Vec<SnapshotContentRecord>,
    ) -> SnapshotReport {
        let mut report = SnapshotReport::default();
        for request in requests {
            if request.is_bound() {
                continue;
            }

            if let Some(existing) = contents.iter().find(|c| c.satisfies(request)) {
                let name = existing.name.clone();
                match self.bind(request, &name).await {
                    Ok(()) => report.rebound += 1,
                    Err(e) => {
                        warn!(request = %request.identity(), error = %e, "binding failed, retrying next pass");
                        report.failed += 1;
                    }
                }
                continue;
            }

            let Some(volume) = source_volume(request, volumes) else {
                debug!(request = %request.identity(), "source volume not found yet");
                report.waiting += 1;
                continue;
            };

            if self.clone_host(volume).is_none() {
                debug!(
                    request = %request.identity(),
                    volume = %volume.name,
                    nodes = ?volume.node_affinity,
                    "source volume lives on hosts this process does not manage",
                );
                report.waiting += 1;
                continue;
            }

            match self.materialize(request, volume).await {
                Ok(content) => {
                    report.materialized.push(content.name.clone());
                    contents.push(content);
                }
                Err(e) => {
                    warn!(request = %request.identity(), error = %e, "snapshot failed, retrying next pass");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Clone `volume` into the snapshot store and bind `request` to it.
    ///
    /// The returned content exists even when the binding step failed.
    #[instrument(skip(self, request, volume), fields(request = %request.identity(), volume = %volume.name))]
    pub async fn materialize(
        &self,
        request: &SnapshotRequest,
        volume: &VolumeRecord,
    ) -> Result<SnapshotContentRecord> {
        self.ctx.volume_root.ensure_contains(&volume.local_path)?;

        let host = self.clone_host(volume).ok_or_else(|| {
            ReflinkError::InvalidArgument(format!(
                "volume {} is pinned to unmanaged nodes {:?}",
                volume.name, volume.node_affinity
            ))
        })?;

        let (id, target) = self.ctx.snapshot_root.fresh_child();
        host.clone_tree(&volume.local_path, &target).await?;

        let mut labels: BTreeMap<String, String> = volume.labels.clone();
        labels.extend(request.labels.clone());

        let content = SnapshotContentRecord {
            name: format!("{CONTENT_PREFIX}{id}"),
            driver: self.ctx.config.snapshot_driver.clone(),
            snapshot_class: Some(self.ctx.config.effective_snapshot_class().to_owned()),
            labels,
            source_volume_handle: target,
            request_ref: request.identity(),
            request_uid: request.uid.clone(),
        };
        self.ctx.store.create_snapshot_content(&content).await?;
        info!(content = %content.name, path = %content.source_volume_handle.display(), host = host.host(), "snapshot content created");

        if let Err(e) = self.bind(request, &content.name).await {
            warn!(content = %content.name, error = %e, "content created but request not bound");
        }
        Ok(content)
    }

    /// The managed host holding `volume`.  Volumes without node affinity
    /// are taken to be local.
    fn clone_host(&self, volume: &VolumeRecord) -> Option<&Arc<dyn RemoteExec>> {
        if volume.node_affinity.is_empty() {
            return Some(self.ctx.hosts.local());
        }
        volume
            .node_affinity
            .iter()
            .find_map(|name| self.ctx.hosts.get(name))
    }

    async fn bind(&self, request: &SnapshotRequest, content_name: &str) -> Result<()> {
        let mut updated = request.clone();
        updated.bound_content_name = Some(content_name.to_owned());
        updated.ready_to_use = true;
        updated.creation_time = Some(Utc::now());
        self.ctx.store.update_snapshot_request_status(&updated).await?;
        info!(request = %request.identity(), content = content_name, "snapshot request bound");
        Ok(())
    }
}

/// The volume bound to the request's source claim in the request's
/// namespace.
pub fn source_volume<'v>(
    request: &SnapshotRequest,
    volumes: &'v [VolumeRecord],
) -> Option<&'v VolumeRecord> {
    let claim = request.source_claim.as_deref()?;
    volumes.iter().find(|v| {
        v.claim_ref
            .as_ref()
            .is_some_and(|r| r.namespace == request.namespace && r.name == claim)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;
    use crate::store::ClusterStore;
    use crate::testutil::{fixture, volume};
    use crate::types::ObjectRef;

    const VOLUME_DIR: &str = "/data/volumes/pv-1";

    fn request(name: &str, claim: &str) -> SnapshotRequest {
        SnapshotRequest {
            namespace: "ns".into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            labels: BTreeMap::from([("type".into(), "postgres".into())]),
            source_claim: Some(claim.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unbound_request_materialized_once() {
        let fx = fixture(FakeExec::new("node-a").with_dir(VOLUME_DIR));
        let pv = volume("pv-1", Some(ObjectRef::new("ns", "c1")), VOLUME_DIR);
        let req = request("snap", "c1");
        fx.store.insert_snapshot_request(req.clone());

        let mut contents = Vec::new();
        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[req], &[pv.clone()], &mut contents)
            .await;

        assert_eq!(report.materialized.len(), 1);
        let stored = fx.store.contents();
        assert_eq!(stored.len(), 1);
        let content = &stored[0];
        assert!(content.name.starts_with(CONTENT_PREFIX));
        assert!(fx.ctx.snapshot_root.contains(&content.source_volume_handle));
        assert_eq!(content.request_ref, ObjectRef::new("ns", "snap"));
        assert_eq!(content.labels.get("type").map(String::as_str), Some("postgres"));
        assert_eq!(content.labels.get("source").map(String::as_str), Some("dataset-x"));
        assert_eq!(content.driver, crate::config::DEFAULT_SNAPSHOT_DRIVER);

        let bound = fx.store.snapshot_request("ns", "snap").unwrap();
        assert_eq!(bound.bound_content_name.as_deref(), Some(content.name.as_str()));
        assert!(bound.ready_to_use);
        assert!(bound.creation_time.is_some());

        // The bound request is terminal on the next pass.
        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[bound], &[pv], &mut contents)
            .await;
        assert!(report.materialized.is_empty());
        assert_eq!(fx.store.contents().len(), 1);
        assert_eq!(fx.exec.clones(), 1);
    }

    #[tokio::test]
    async fn missing_source_volume_waits() {
        let fx = fixture(FakeExec::new("node-a"));
        let req = request("snap", "c1");
        let other_ns = volume("pv-1", Some(ObjectRef::new("other", "c1")), VOLUME_DIR);

        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[req], &[other_ns], &mut Vec::new())
            .await;

        assert_eq!(report.waiting, 1);
        assert!(fx.store.contents().is_empty());
        assert_eq!(fx.exec.clones(), 0);
    }

    #[tokio::test]
    async fn volume_on_unmanaged_node_waits() {
        let fx = fixture(FakeExec::new("node-a").with_dir(VOLUME_DIR));
        let mut pv = volume("pv-1", Some(ObjectRef::new("ns", "c1")), VOLUME_DIR);
        pv.node_affinity = vec!["node-b".into()];
        let req = request("snap", "c1");
        fx.store.insert_snapshot_request(req.clone());

        let bridge = SnapshotBridge::new(&fx.ctx);
        let report = bridge
            .snapshot_pass(&[req.clone()], &[pv.clone()], &mut Vec::new())
            .await;

        assert_eq!(report.waiting, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fx.exec.clones(), 0);
        assert!(fx.store.contents().is_empty());
        assert!(bridge.materialize(&req, &pv).await.is_err());
        assert_eq!(fx.exec.clones(), 0);
    }

    #[tokio::test]
    async fn leftover_content_is_rebound_not_recloned() {
        let fx = fixture(FakeExec::new("node-a").with_dir(VOLUME_DIR));
        let pv = volume("pv-1", Some(ObjectRef::new("ns", "c1")), VOLUME_DIR);
        let req = request("snap", "c1");
        fx.store.insert_snapshot_request(req.clone());
        let leftover = SnapshotContentRecord {
            name: "snapcontent-old".into(),
            driver: crate::config::DEFAULT_SNAPSHOT_DRIVER.into(),
            snapshot_class: None,
            labels: BTreeMap::new(),
            source_volume_handle: "/data/snapshots/old".into(),
            request_ref: req.identity(),
            request_uid: req.uid.clone(),
        };

        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[req], &[pv], &mut vec![leftover])
            .await;

        assert_eq!(report.rebound, 1);
        assert_eq!(fx.exec.clones(), 0);
        let bound = fx.store.snapshot_request("ns", "snap").unwrap();
        assert_eq!(bound.bound_content_name.as_deref(), Some("snapcontent-old"));
    }

    #[tokio::test]
    async fn volume_outside_root_is_refused() {
        let fx = fixture(FakeExec::new("node-a").with_dir("/etc"));
        let pv = volume("pv-1", Some(ObjectRef::new("ns", "c1")), "/etc");

        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[request("snap", "c1")], &[pv], &mut Vec::new())
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(fx.exec.clones(), 0);
    }

    #[tokio::test]
    async fn clone_failure_leaves_request_unbound() {
        let fx = fixture(FakeExec::new("node-a").with_dir(VOLUME_DIR));
        fx.exec.fail_clones(true);
        let pv = volume("pv-1", Some(ObjectRef::new("ns", "c1")), VOLUME_DIR);
        let req = request("snap", "c1");
        fx.store.insert_snapshot_request(req.clone());

        let report = SnapshotBridge::new(&fx.ctx)
            .snapshot_pass(&[req], &[pv], &mut Vec::new())
            .await;

        assert_eq!(report.failed, 1);
        assert!(fx.store.contents().is_empty());
        let listed = fx.store.list_snapshot_requests(Some("ns")).await.unwrap();
        assert!(!listed[0].is_bound());
    }
}
