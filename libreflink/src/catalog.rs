//! Dataset catalogs: building a node's catalog and rendering catalog views.
//!
//! A node's catalog merges two sources:
//!
//! | Origin | Name | Type |
//! |--------|------|------|
//! | snapshot content of our driver/class whose directory exists | requesting snapshot's name | `type` label |
//! | legacy `<store>/<name>` + `<store>/<name>.meta` | directory name | sidecar `type` |
//!
//! Missing types are reported as [`UNKNOWN_TYPE`].  Entries are sorted by
//! name, descending, so timestamp-named datasets list newest first.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{ReflinkError, Result};
use crate::sidecar;
use crate::types::{
    CatalogReport, DatasetEntry, DatasetOrigin, SnapshotContentRecord, TYPE_LABEL, UNKNOWN_TYPE,
};

/// Build this node's catalog.
///
/// Contents whose backing directory is missing are left out silently.
pub async fn build_catalog(
    ctx: &Context,
    contents: &[SnapshotContentRecord],
) -> Vec<DatasetEntry> {
    let local = ctx.hosts.local();
    let class = ctx.config.effective_snapshot_class();
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for content in contents {
        if content.driver != ctx.config.snapshot_driver {
            continue;
        }
        if content.snapshot_class.as_deref().is_some_and(|c| c != class) {
            continue;
        }
        match local.exists(&content.source_volume_handle).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(content = %content.name, "backing directory missing, not cataloged");
                continue;
            }
            Err(e) => {
                warn!(content = %content.name, error = %e, "existence check failed, not cataloged");
                continue;
            }
        }
        if !seen.insert(content.source_volume_handle.clone()) {
            continue;
        }
        entries.push(DatasetEntry {
            name: content.request_ref.name.clone(),
            kind: content
                .labels
                .get(TYPE_LABEL)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_TYPE.to_owned()),
            source_path: Some(content.source_volume_handle.clone()),
            origin: DatasetOrigin::SnapshotContent,
        });
    }

    match sidecar::scan(ctx.snapshot_root.path()).await {
        Ok(legacy) => {
            for dataset in legacy {
                if !seen.insert(dataset.path.clone()) {
                    continue;
                }
                entries.push(DatasetEntry {
                    name: dataset.name,
                    kind: dataset.kind,
                    source_path: Some(dataset.path),
                    origin: DatasetOrigin::Sidecar,
                });
            }
        }
        Err(e) => warn!(error = %e, "legacy dataset scan failed"),
    }

    sort_entries(&mut entries);
    entries
}

/// Build this node's catalog as a report for the aggregator.
pub async fn build_report(ctx: &Context, contents: &[SnapshotContentRecord]) -> CatalogReport {
    CatalogReport::new(ctx.node_name(), build_catalog(ctx, contents).await)
}

/// Sort by name descending, then by type for a stable order.
pub fn sort_entries(entries: &mut [DatasetEntry]) {
    entries.sort_by(|a, b| b.name.cmp(&a.name).then_with(|| a.kind.cmp(&b.kind)));
}

#[derive(Serialize)]
struct Row<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct Listing<'a> {
    dumps: Vec<Row<'a>>,
}

/// Structured view: `{"dumps":[{"name":..,"type":..}]}`.
pub fn render_json(entries: &[DatasetEntry]) -> Result<Vec<u8>> {
    let listing = Listing {
        dumps: entries
            .iter()
            .map(|e| Row {
                name: &e.name,
                kind: &e.kind,
            })
            .collect(),
    };
    serde_json::to_vec(&listing).map_err(ReflinkError::internal)
}

/// Flat view: one `name,type` record per entry, no header.
pub fn render_csv(entries: &[DatasetEntry]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in entries {
        writer
            .write_record([entry.name.as_str(), entry.kind.as_str()])
            .map_err(ReflinkError::internal)?;
    }
    writer.into_inner().map_err(ReflinkError::internal)
}
