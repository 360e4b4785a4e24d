//! Reconciliation Loop.
//!
//! One pass re-derives everything from a full listing of the store:
//!
//! 1. list volumes and snapshot contents;
//! 2. garbage-collect failed volumes, then orphans (only when both lists are
//!    complete);
//! 3. provision pending claims;
//! 4. materialize unbound snapshot requests;
//! 5. build the node's catalog and deliver it.
//!
//! Passes are strictly sequential with a fixed sleep in between.  A pass is
//! never interrupted; shutdown is observed while sleeping.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use crate::aggregator::AggregatorCache;
use crate::catalog;
use crate::context::Context;
use crate::gc::{GarbageCollector, GcResult};
use crate::provision::Provisioner;
use crate::snapshot::SnapshotBridge;
use crate::transport::ReportClient;
use crate::types::SnapshotRequest;

/// Counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub volumes_created: usize,
    pub volumes_deleted: u64,
    pub orphans_removed: u64,
    pub snapshots_bound: usize,
    pub catalog_size: usize,
    pub report_delivered: bool,
    /// Per-item and listing failures; none of them stopped the pass.
    pub errors: usize,
}

/// Polling loop running provisioning, snapshots, garbage collection and catalog reporting.
pub struct Reconciler {
    ctx: Context,
    reporter: Option<ReportClient>,
    local_catalog: Option<Arc<AggregatorCache>>,
    pass: u64,
}

impl Reconciler {
    /// A reconciler without a reporter or local catalog.
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            reporter: None,
            local_catalog: None,
            pass: 0,
        }
    }

    /// Deliver each pass's catalog to the aggregator.
    pub fn with_reporter(mut self, reporter: ReportClient) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Also record each pass's catalog into `cache`, for local serving.
    pub fn with_local_catalog(mut self, cache: Arc<AggregatorCache>) -> Self {
        self.local_catalog = Some(cache);
        self
    }

    /// The context every pass runs against.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run passes until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let interval = self.ctx.config.interval();
        loop {
            self.run_pass().await;
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, reconciliation stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Run one complete pass.
    pub async fn run_pass(&mut self) -> PassSummary {
        self.pass += 1;
        let span = info_span!("pass", n = self.pass, node = %self.ctx.node_name());
        let summary = self.pass_inner().instrument(span.clone()).await;
        span.in_scope(|| {
            info!(
                created = summary.volumes_created,
                deleted = summary.volumes_deleted,
                orphans = summary.orphans_removed,
                snapshots = summary.snapshots_bound,
                catalog = summary.catalog_size,
                reported = summary.report_delivered,
                errors = summary.errors,
                "pass complete",
            )
        });
        summary
    }

    async fn pass_inner(&self) -> PassSummary {
        let ctx = &self.ctx;
        let mut summary = PassSummary::default();

        let volumes = match ctx.store.list_volumes().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "listing volumes failed");
                summary.errors += 1;
                None
            }
        };
        let mut contents = match ctx.store.list_snapshot_contents().await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "listing snapshot contents failed");
                summary.errors += 1;
                None
            }
        };

        let gc = GarbageCollector::new(ctx);
        let mut collected = GcResult::default();
        if let Some(volumes) = &volumes {
            collected.merge(gc.sweep_failed_volumes(volumes).await);
            if let Some(contents) = &contents {
                collected.merge(gc.sweep_orphans(volumes, contents).await);
            }
        }
        summary.volumes_deleted = collected.volumes_deleted;
        summary.orphans_removed = collected.orphans_removed;
        summary.errors += collected.errors.len();

        match (ctx.store.list_claims().await, &volumes) {
            (Ok(claims), Some(volumes)) => {
                let report = Provisioner::new(ctx)
                    .provision_pass(&claims, volumes, contents.as_deref())
                    .await;
                summary.volumes_created = report.created.len();
                summary.errors += report.failed;
            }
            (Ok(_), None) => {}
            (Err(e), _) => {
                warn!(error = %e, "listing claims failed");
                summary.errors += 1;
            }
        }

        if let (Some(volumes), Some(contents)) = (&volumes, contents.as_mut()) {
            let requests = self.list_requests(&mut summary).await;
            let report = SnapshotBridge::new(ctx)
                .snapshot_pass(&requests, volumes, contents)
                .await;
            summary.snapshots_bound = report.materialized.len() + report.rebound;
            summary.errors += report.failed;
        }

        match &contents {
            Some(contents) => {
                let report = catalog::build_report(ctx, contents).await;
                summary.catalog_size = report.entries.len();
                if let Some(reporter) = &self.reporter {
                    match reporter.send(&report).await {
                        Ok(()) => summary.report_delivered = true,
                        Err(e) => warn!(error = %e, "catalog report not delivered"),
                    }
                }
                if let Some(cache) = &self.local_catalog {
                    cache.record(report, Utc::now());
                }
            }
            None => warn!("snapshot contents unknown, catalog not refreshed"),
        }

        summary
    }

    async fn list_requests(&self, summary: &mut PassSummary) -> Vec<SnapshotRequest> {
        let namespaces = &self.ctx.config.snapshot_namespaces;
        let scopes: Vec<Option<&str>> = if namespaces.is_empty() {
            vec![None]
        } else {
            namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };

        let mut requests = Vec::new();
        for scope in scopes {
            match self.ctx.store.list_snapshot_requests(scope).await {
                Ok(mut listed) => requests.append(&mut listed),
                Err(e) => {
                    warn!(namespace = scope.unwrap_or("*"), error = %e, "listing snapshot requests failed");
                    summary.errors += 1;
                }
            }
        }
        requests
    }
}
