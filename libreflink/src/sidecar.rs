//! Legacy sidecar-metadata datasets.
//!
//! Before snapshot contents existed, datasets were plain directories in the
//! snapshot store with a JSON sidecar next to them:
//!
//! ```text
//! <snapshot_path>/
//!   <dataset>/        # dataset contents
//!   <dataset>.meta    # {"type": "postgres"}
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ReflinkError, Result};
use crate::paths::{SIDECAR_SUFFIX, sidecar_path};
use crate::types::UNKNOWN_TYPE;

#[derive(Debug, Deserialize)]
struct SidecarMeta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// A dataset directory discovered through its sidecar file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDataset {
    pub name: String,
    pub path: PathBuf,
    pub kind: String,
}

/// `true` when `dir` has a paired sidecar file.
pub async fn has_sidecar(dir: &Path) -> bool {
    match sidecar_path(dir) {
        Some(meta) => tokio::fs::metadata(&meta)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false),
        None => false,
    }
}

/// Read the `type` field of the sidecar paired with `dir`.
///
/// Returns `None` when there is no sidecar; a sidecar that cannot be parsed
/// or has no `type` yields [`UNKNOWN_TYPE`].
pub async fn read_type(dir: &Path) -> Option<String> {
    let meta = sidecar_path(dir)?;
    let raw = tokio::fs::read(&meta).await.ok()?;
    let kind = match serde_json::from_slice::<SidecarMeta>(&raw) {
        Ok(SidecarMeta { kind: Some(kind) }) if !kind.is_empty() => kind,
        Ok(_) => UNKNOWN_TYPE.to_owned(),
        Err(e) => {
            debug!(path = %meta.display(), error = %e, "unparsable sidecar, type unknown");
            UNKNOWN_TYPE.to_owned()
        }
    };
    Some(kind)
}

/// List every sidecar-paired dataset directly under `store`.
///
/// Entries that vanish while scanning are skipped.
pub async fn scan(store: &Path) -> Result<Vec<LegacyDataset>> {
    let mut dir = match tokio::fs::read_dir(store).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ReflinkError::Internal(format!(
                "read_dir {}: {e}",
                store.display()
            )));
        }
    };

    let mut found = Vec::new();
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(store = %store.display(), error = %e, "dataset scan interrupted");
                break;
            }
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        if name.ends_with(SIDECAR_SUFFIX) {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(kind) = read_type(&path).await {
            found.push(LegacyDataset { name, path, kind });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_reads_types_and_skips_unpaired() {
        let tmp = tempfile::tempdir().unwrap();
        let store = tmp.path();
        std::fs::create_dir(store.join("dump-1")).unwrap();
        std::fs::write(store.join("dump-1.meta"), r#"{"type":"postgres"}"#).unwrap();
        std::fs::create_dir(store.join("dump-2")).unwrap();
        std::fs::write(store.join("dump-2.meta"), "not json").unwrap();
        std::fs::create_dir(store.join("unpaired")).unwrap();
        std::fs::write(store.join("stray-file"), "x").unwrap();

        let mut found = scan(store).await.unwrap();
        found.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "dump-1");
        assert_eq!(found[0].kind, "postgres");
        assert_eq!(found[1].kind, UNKNOWN_TYPE);
    }

    #[tokio::test]
    async fn missing_type_field_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d.meta"), "{}").unwrap();
        assert_eq!(
            read_type(&tmp.path().join("d")).await.as_deref(),
            Some(UNKNOWN_TYPE)
        );
        assert!(has_sidecar(&tmp.path().join("d")).await);
    }

    #[tokio::test]
    async fn missing_store_is_empty() {
        let found = scan(Path::new("/nonexistent/reflink/store")).await.unwrap();
        assert!(found.is_empty());
    }
}
