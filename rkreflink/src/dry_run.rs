//! Read-only execution for `--dry-run`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libreflink::{HostSet, RemoteExec, Result};
use tracing::info;

/// Forwards existence checks and only logs clones and removals.
pub struct DryRunExec {
    inner: Arc<dyn RemoteExec>,
}

impl DryRunExec {
    /// Wrap every host of `hosts`, keeping their order.
    pub fn wrap(hosts: &HostSet) -> Result<HostSet> {
        HostSet::new(
            hosts
                .iter()
                .map(|inner| {
                    Arc::new(DryRunExec {
                        inner: Arc::clone(inner),
                    }) as Arc<dyn RemoteExec>
                })
                .collect(),
        )
    }
}

#[async_trait]
impl RemoteExec for DryRunExec {
    fn host(&self) -> &str {
        self.inner.host()
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        info!(host = self.host(), src = %src.display(), dst = %dst.display(), "dry-run: would clone");
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        info!(host = self.host(), path = %path.display(), "dry-run: would remove");
        Ok(())
    }
}
