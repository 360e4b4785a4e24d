//! Provisioning Engine: turns pending claims into cloned volumes.
//!
//! Per pending claim:
//!
//! 1. drop claims for other storage classes;
//! 2. resolve a source directory (snapshot content, then legacy named data
//!    source, then `source` label selector; first match wins);
//! 3. skip claims that already have a volume;
//! 4. find the hosts where the source exists;
//! 5. clone it copy-on-write into a fresh directory under the managed root;
//! 6. submit the volume object.
//!
//! A clone whose volume object never gets created is left on disk; the
//! orphan sweep in [`crate::gc`] reclaims it on a later pass.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::error::{ReflinkError, Result};
use crate::paths::validate_name;
use crate::types::{
    AccessMode, ClaimPhase, ClaimRecord, ObjectRef, ReclaimPolicy, SOURCE_LABEL,
    SnapshotContentRecord, VolumePhase, VolumeRecord,
};

/// Which rule resolved a claim's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRule {
    /// Data source of kind `VolumeSnapshot`, via its snapshot content.
    Snapshot,
    /// Named data source looked up in the snapshot store.
    NamedDataset,
    /// `source` label selector looked up in the snapshot store.
    LabelSelector,
}

/// A claim's resolved source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// Dataset name recorded in the volume's `source` label.
    pub dataset: String,
    pub path: PathBuf,
    pub rule: SourceRule,
}

/// Outcome of one provisioning pass.
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    /// Names of volumes created this pass.
    pub created: Vec<String>,
    /// Claims already provisioned.
    pub already_provisioned: usize,
    /// Claims whose source could not be resolved or found yet.
    pub unresolved: usize,
    /// Claims whose clone or volume submission failed.
    pub failed: usize,
}

/// Provisioning Engine over a [`Context`].
pub struct Provisioner<'a> {
    ctx: &'a Context,
}

impl<'a> Provisioner<'a> {
    /// A provisioner acting on `ctx`'s store and hosts.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Resolve the directory `claim` should be cloned from.
    ///
    /// `contents` is `None` when snapshot contents could not be listed this
    /// pass; snapshot-backed claims then stay unresolved.
    pub fn resolve_source(
        &self,
        claim: &ClaimRecord,
        contents: Option<&[SnapshotContentRecord]>,
    ) -> Option<ResolvedSource> {
        if let Some(ds) = &claim.data_source {
            if ds.is_snapshot() {
                // A snapshot reference never falls through to the legacy rules.
                let request = ObjectRef::new(&claim.namespace, &ds.name);
                return contents?
                    .iter()
                    .find(|c| c.request_ref == request && self.usable_content(c))
                    .map(|c| ResolvedSource {
                        dataset: ds.name.clone(),
                        path: c.source_volume_handle.clone(),
                        rule: SourceRule::Snapshot,
                    });
            }
            if let Some(source) = self.dataset_source(&ds.name, SourceRule::NamedDataset) {
                return Some(source);
            }
        }
        claim
            .selector_source
            .as_deref()
            .and_then(|name| self.dataset_source(name, SourceRule::LabelSelector))
    }

    /// Contents of our driver and class whose data lies in the snapshot
    /// store.
    fn usable_content(&self, content: &SnapshotContentRecord) -> bool {
        let config = &self.ctx.config;
        if content.driver != config.snapshot_driver {
            return false;
        }
        if content
            .snapshot_class
            .as_deref()
            .is_some_and(|c| c != config.effective_snapshot_class())
        {
            return false;
        }
        if !self.ctx.snapshot_root.contains(&content.source_volume_handle) {
            warn!(content = %content.name, path = %content.source_volume_handle.display(), "snapshot content outside the snapshot store, ignored");
            return false;
        }
        true
    }

    fn dataset_source(&self, name: &str, rule: SourceRule) -> Option<ResolvedSource> {
        match self.ctx.snapshot_root.child(name) {
            Ok(path) => Some(ResolvedSource {
                dataset: name.to_owned(),
                path,
                rule,
            }),
            Err(e) => {
                warn!(dataset = name, error = %e, "ignoring unusable dataset name");
                None
            }
        }
    }

    /// Run one provisioning pass over `claims`.
    ///
    /// `volumes` must be the complete current volume list: it is the
    /// duplicate guard.
    pub async fn provision_pass(
        &self,
        claims: &[ClaimRecord],
        volumes: &[VolumeRecord],
        contents: Option<&[SnapshotContentRecord]>,
    ) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        let mut claimed: HashSet<ObjectRef> =
            volumes.iter().filter_map(|v| v.claim_ref.clone()).collect();

        for claim in claims {
            if claim.phase != ClaimPhase::Pending {
                continue;
            }
            if !self.ctx.config.accepts_class(claim.storage_class.as_deref()) {
                continue;
            }
            let Some(source) = self.resolve_source(claim, contents) else {
                debug!(claim = %claim.identity(), "no source resolved yet");
                report.unresolved += 1;
                continue;
            };
            let identity = claim.identity();
            if claimed.contains(&identity) {
                debug!(claim = %identity, "already provisioned");
                report.already_provisioned += 1;
                continue;
            }

            match self.provision_claim(claim, &source).await {
                Ok(Some(volume)) => {
                    claimed.insert(identity);
                    report.created.push(volume.name);
                }
                Ok(None) => report.unresolved += 1,
                Err(e) => {
                    warn!(claim = %identity, error = %e, "provisioning failed, retrying next pass");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Clone `source` for `claim` and submit the volume.
    ///
    /// Returns `Ok(None)` when the source is not present on any host yet.
    #[instrument(skip(self, claim, source), fields(claim = %claim.identity(), source = %source.path.display()))]
    pub async fn provision_claim(
        &self,
        claim: &ClaimRecord,
        source: &ResolvedSource,
    ) -> Result<Option<VolumeRecord>> {
        let mut candidates = Vec::new();
        for host in self.ctx.hosts.iter() {
            match host.exists(&source.path).await {
                Ok(true) => candidates.push(host),
                Ok(false) => {}
                Err(e) => warn!(host = host.host(), error = %e, "existence check failed"),
            }
        }
        if candidates.is_empty() {
            info!("source not present on any host, retrying next pass");
            return Ok(None);
        }

        let (id, target) = self.ctx.volume_root.fresh_child();
        let mut cloned_on = Vec::new();
        for host in candidates {
            match host.clone_tree(&source.path, &target).await {
                Ok(()) => cloned_on.push(host.host().to_owned()),
                Err(e) => warn!(host = host.host(), error = %e, "clone failed"),
            }
        }
        if cloned_on.is_empty() {
            return Err(ReflinkError::Exec {
                op: "clone".into(),
                host: "*".into(),
                path: target.display().to_string(),
                reason: "clone failed on every host holding the source".into(),
            });
        }

        let volume = self.volume_for(claim, source, id, target, cloned_on);
        match self.ctx.store.create_volume(&volume).await {
            Ok(()) => {
                info!(
                    volume = %volume.name,
                    path = %volume.local_path.display(),
                    nodes = ?volume.node_affinity,
                    "volume created",
                );
                Ok(Some(volume))
            }
            Err(e) if e.is_conflict() => {
                info!(volume = %volume.name, "volume already exists");
                Ok(Some(volume))
            }
            Err(e) => Err(e),
        }
    }

    fn volume_for(
        &self,
        claim: &ClaimRecord,
        source: &ResolvedSource,
        id: String,
        local_path: PathBuf,
        nodes: Vec<String>,
    ) -> VolumeRecord {
        let mut labels = BTreeMap::new();
        if validate_name(&source.dataset).is_ok() {
            labels.insert(SOURCE_LABEL.to_owned(), source.dataset.clone());
        }
        VolumeRecord {
            name: id,
            phase: VolumePhase::Pending,
            capacity_bytes: self.ctx.config.capacity_bytes,
            storage_class: self.ctx.config.storage_class.clone(),
            access_modes: vec![AccessMode::ReadWriteOnce],
            reclaim_policy: ReclaimPolicy::Delete,
            claim_ref: Some(claim.identity()),
            local_path,
            node_affinity: nodes,
            labels,
        }
    }
}
