//! In-memory [`RemoteExec`] used by unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ReflinkError, Result};
use crate::exec::RemoteExec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Clone { src: PathBuf, dst: PathBuf },
    Remove(PathBuf),
}

/// Tracks which directories "exist" and records every mutation.
pub struct FakeExec {
    host: String,
    dirs: Mutex<HashSet<PathBuf>>,
    ops: Mutex<Vec<Op>>,
    fail_clones: Mutex<bool>,
}

impl FakeExec {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_owned(),
            dirs: Mutex::new(HashSet::new()),
            ops: Mutex::new(Vec::new()),
            fail_clones: Mutex::new(false),
        }
    }

    pub fn with_dir(self, path: impl Into<PathBuf>) -> Self {
        self.dirs.lock().unwrap().insert(path.into());
        self
    }

    pub fn fail_clones(&self, fail: bool) {
        *self.fail_clones.lock().unwrap() = fail;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clones(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Clone { .. }))
            .count()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl RemoteExec for FakeExec {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.has_dir(path))
    }

    async fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        if *self.fail_clones.lock().unwrap() || !self.has_dir(src) {
            return Err(ReflinkError::Exec {
                op: "clone".into(),
                host: self.host.clone(),
                path: dst.display().to_string(),
                reason: "injected failure".into(),
            });
        }
        self.dirs.lock().unwrap().insert(dst.to_path_buf());
        self.ops.lock().unwrap().push(Op::Clone {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        self.dirs.lock().unwrap().retain(|d| !d.starts_with(path));
        self.ops.lock().unwrap().push(Op::Remove(path.to_path_buf()));
        Ok(())
    }
}
