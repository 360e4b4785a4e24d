//! Managed-root guard and on-disk naming.
//!
//! Every destructive operation in this crate goes through
//! [`ManagedRoot::ensure_contains`] first.  The check is component-wise, so
//! `/data/volumes2/x` is *not* under `/data/volumes`, and any `..` component
//! is rejected outright.

use std::path::{Component, Path, PathBuf};

use crate::error::{ReflinkError, Result};

/// Suffix of legacy sidecar metadata files next to dataset directories.
pub const SIDECAR_SUFFIX: &str = ".meta";

/// A directory this provisioner owns the children of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRoot {
    root: PathBuf,
}

impl ManagedRoot {
    /// Guard `root`, which must be absolute and free of `..`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() || has_parent_component(&root) {
            return Err(ReflinkError::InvalidArgument(format!(
                "managed root must be an absolute normalized path, got {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// The guarded root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `true` when `path` is a strict descendant of the root.
    pub fn contains(&self, path: &Path) -> bool {
        path.is_absolute()
            && !has_parent_component(path)
            && path != self.root
            && path.starts_with(&self.root)
    }

    /// Fail closed unless `path` is a strict descendant of the root.
    pub fn ensure_contains(&self, path: &Path) -> Result<()> {
        if self.contains(path) {
            Ok(())
        } else {
            Err(ReflinkError::UnsafePath {
                path: path.display().to_string(),
                root: self.root.display().to_string(),
            })
        }
    }

    /// Path of the direct child `name`.  `name` must be a single component.
    pub fn child(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// A fresh, uniquely named child directory path and its id.
    pub fn fresh_child(&self) -> (String, PathBuf) {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.root.join(&id);
        (id, path)
    }
}

/// Path of the legacy sidecar file paired with `dataset_dir`.
pub fn sidecar_path(dataset_dir: &Path) -> Option<PathBuf> {
    let name = dataset_dir.file_name()?.to_str()?;
    Some(dataset_dir.with_file_name(format!("{name}{SIDECAR_SUFFIX}")))
}

/// Reject names that would escape their parent directory.
pub fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') => Ok(()),
        _ => Err(ReflinkError::InvalidArgument(format!(
            "{name:?} is not a plain directory name"
        ))),
    }
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> ManagedRoot {
        ManagedRoot::new("/data/volumes").expect("root")
    }

    #[test]
    fn descendants_are_contained() {
        let root = root();
        assert!(root.contains(Path::new("/data/volumes/abc")));
        assert!(root.contains(Path::new("/data/volumes/abc/def")));
    }

    #[test]
    fn root_itself_is_not_a_target() {
        assert!(!root().contains(Path::new("/data/volumes")));
    }

    #[test]
    fn sibling_with_shared_prefix_rejected() {
        assert!(!root().contains(Path::new("/data/volumes2/abc")));
    }

    #[test]
    fn parent_traversal_rejected() {
        let err = root()
            .ensure_contains(Path::new("/data/volumes/../etc"))
            .unwrap_err();
        assert!(matches!(err, ReflinkError::UnsafePath { .. }));
    }

    #[test]
    fn relative_paths_rejected() {
        assert!(!root().contains(Path::new("data/volumes/abc")));
        assert!(ManagedRoot::new("relative").is_err());
    }

    #[test]
    fn child_names_validated() {
        let root = root();
        assert_eq!(
            root.child("dataset-x").expect("child"),
            PathBuf::from("/data/volumes/dataset-x")
        );
        assert!(root.child("../etc").is_err());
        assert!(root.child("a/b").is_err());
        assert!(root.child("..").is_err());
        assert!(root.child("").is_err());
    }

    #[test]
    fn fresh_children_are_unique() {
        let root = root();
        let (a, pa) = root.fresh_child();
        let (b, _) = root.fresh_child();
        assert_ne!(a, b);
        assert!(root.contains(&pa));
    }

    #[test]
    fn sidecar_is_sibling_file() {
        assert_eq!(
            sidecar_path(Path::new("/snap/dump-1")),
            Some(PathBuf::from("/snap/dump-1.meta"))
        );
    }
}
