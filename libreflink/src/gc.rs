//! Garbage Collector.
//!
//! Two independent sweeps:
//!
//! - **failed volumes**: delete the volume object, then its directory;
//! - **orphans**: remove directories under the managed roots that no volume
//!   or snapshot content references.
//!
//! Every removal is preceded by [`ManagedRoot::ensure_contains`]; a path
//! outside the roots is refused and the volume left untouched.
//!
//! [`ManagedRoot::ensure_contains`]: crate::paths::ManagedRoot::ensure_contains

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::error::ReflinkError;
use crate::exec::RemoteExec;
use crate::paths::ManagedRoot;
use crate::sidecar;
use crate::types::{SnapshotContentRecord, VolumePhase, VolumeRecord};

/// Result of a garbage collection run.
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Failed volume objects deleted.
    pub volumes_deleted: u64,
    /// Backing directories of failed volumes removed.
    pub volume_dirs_removed: u64,
    /// Unreferenced directories removed.
    pub orphans_removed: u64,
    /// Deletions refused by the root-safety guard.
    pub refused: u64,
    /// Errors encountered (GC continues past every per-item error).
    pub errors: Vec<String>,
}

impl GcResult {
    /// Merges another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.volumes_deleted += other.volumes_deleted;
        self.volume_dirs_removed += other.volume_dirs_removed;
        self.orphans_removed += other.orphans_removed;
        self.refused += other.refused;
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Garbage Collector over a [`Context`].
pub struct GarbageCollector<'a> {
    ctx: &'a Context,
}

impl<'a> GarbageCollector<'a> {
    /// A collector acting on `ctx`'s store and hosts.
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Delete every failed volume whose directory lies under the volume root.
    pub async fn sweep_failed_volumes(&self, volumes: &[VolumeRecord]) -> GcResult {
        let mut result = GcResult::default();
        for volume in volumes.iter().filter(|v| v.phase == VolumePhase::Failed) {
            result.merge(self.delete_failed_volume(volume).await);
        }
        result
    }

    #[instrument(skip(self, volume), fields(volume = %volume.name, path = %volume.local_path.display()))]
    async fn delete_failed_volume(&self, volume: &VolumeRecord) -> GcResult {
        let mut result = GcResult::default();
        if let Err(e) = self.ctx.volume_root.ensure_contains(&volume.local_path) {
            warn!(error = %e, "refusing to reclaim volume outside the managed root");
            result.refused += 1;
            result.errors.push(e.to_string());
            return result;
        }

        // The object goes first so nothing can re-attach to the path.
        match self.ctx.store.delete_volume(&volume.name).await {
            Ok(()) => {
                info!("failed volume deleted");
                result.volumes_deleted += 1;
            }
            Err(ReflinkError::NotFound { .. }) => debug!("volume object already gone"),
            Err(e) => {
                warn!(error = %e, "volume delete failed, retrying next pass");
                result.errors.push(e.to_string());
                return result;
            }
        }

        for host in self.hosts_for(volume) {
            match host.remove_tree(&volume.local_path).await {
                Ok(()) => {
                    info!(host = host.host(), "volume directory removed");
                    result.volume_dirs_removed += 1;
                }
                Err(e) => {
                    warn!(host = host.host(), error = %e, "volume directory removal failed");
                    result.errors.push(e.to_string());
                }
            }
        }
        result
    }

    /// Hosts holding a copy of `volume`: its affinity hosts known to this
    /// process, or the local host when none is.
    fn hosts_for(&self, volume: &VolumeRecord) -> Vec<Arc<dyn RemoteExec>> {
        let hosts: Vec<_> = volume
            .node_affinity
            .iter()
            .filter_map(|name| self.ctx.hosts.get(name).cloned())
            .collect();
        if hosts.is_empty() {
            vec![Arc::clone(self.ctx.hosts.local())]
        } else {
            hosts
        }
    }

    /// Remove unreferenced directories under both managed roots on the local
    /// host.
    ///
    /// `volumes` and `contents` must be complete lists; a partial list would
    /// make live directories look orphaned.
    pub async fn sweep_orphans(
        &self,
        volumes: &[VolumeRecord],
        contents: &[SnapshotContentRecord],
    ) -> GcResult {
        let referenced: HashSet<&Path> = volumes
            .iter()
            .map(|v| v.local_path.as_path())
            .chain(contents.iter().map(|c| c.source_volume_handle.as_path()))
            .collect();

        let mut result = GcResult::default();
        for root in [&self.ctx.volume_root, &self.ctx.snapshot_root] {
            result.merge(self.sweep_root(root, &referenced).await);
        }
        result
    }

    async fn sweep_root(&self, root: &ManagedRoot, referenced: &HashSet<&Path>) -> GcResult {
        let mut result = GcResult::default();
        let candidates = match list_dirs(root.path()).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(root = %root.path().display(), error = %e, "cannot scan managed root");
                result.errors.push(e.to_string());
                return result;
            }
        };

        let local = self.ctx.hosts.local();
        let grace = self.ctx.config.orphan_grace();
        for dir in candidates {
            if referenced.contains(dir.as_path()) {
                continue;
            }
            if sidecar::has_sidecar(&dir).await {
                debug!(path = %dir.display(), "keeping legacy sidecar dataset");
                continue;
            }
            if !grace.is_zero() && younger_than(&dir, grace).await {
                debug!(path = %dir.display(), "orphan within grace period");
                continue;
            }
            if let Err(e) = root.ensure_contains(&dir) {
                result.refused += 1;
                result.errors.push(e.to_string());
                continue;
            }
            match local.remove_tree(&dir).await {
                Ok(()) => {
                    info!(path = %dir.display(), "orphan directory removed");
                    result.orphans_removed += 1;
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "orphan removal failed");
                    result.errors.push(e.to_string());
                }
            }
        }
        result
    }
}

/// Direct child directories of `root`.  A missing root has none.
async fn list_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn younger_than(dir: &Path, grace: std::time::Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(dir).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age < grace)
}
