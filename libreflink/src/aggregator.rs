//! Aggregator cache: the latest catalog report per provider.
//!
//! Shared between concurrent HTTP handlers through an `Arc`.  Each report
//! replaces the previous one from the same provider; reads merge every
//! report received within the freshness window.  Stale reports are skipped,
//! not evicted, so a provider that resumes reporting reappears at once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::types::{CatalogReport, DatasetEntry};

/// Latest catalog report per provider, filtered by freshness on read.
pub struct AggregatorCache {
    reports: DashMap<String, CatalogReport>,
    window: Duration,
}

impl AggregatorCache {
    /// An empty cache whose reports go stale after `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            reports: DashMap::new(),
            window,
        }
    }

    /// Store `report` as its provider's latest, stamped with `now`.
    pub fn record(&self, mut report: CatalogReport, now: DateTime<Utc>) {
        report.received_at = Some(now);
        debug!(provider = %report.provider_id, entries = report.entries.len(), "catalog report recorded");
        self.reports.insert(report.provider_id.clone(), report);
    }

    /// Providers whose latest report is fresh at `now`, sorted by id.
    pub fn fresh_reports(&self, now: DateTime<Utc>) -> Vec<CatalogReport> {
        let mut fresh: Vec<CatalogReport> = self
            .reports
            .iter()
            .filter(|r| self.is_fresh(r.value(), now))
            .map(|r| r.value().clone())
            .collect();
        fresh.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        fresh
    }

    /// Every entry of every fresh report, grouped by provider.
    pub fn merged_view(&self, now: DateTime<Utc>) -> Vec<DatasetEntry> {
        self.fresh_reports(now)
            .into_iter()
            .flat_map(|r| r.entries)
            .collect()
    }

    /// Number of providers ever seen, fresh or not.
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    /// `true` when no provider has reported.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    fn is_fresh(&self, report: &CatalogReport, now: DateTime<Utc>) -> bool {
        // A receipt stamp ahead of `now` counts as fresh.
        report.received_at.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .map_or(true, |age| age <= self.window)
        })
    }
}
