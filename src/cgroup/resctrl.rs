use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::{attach_tree, PrivilegedFs};

/// A resctrl monitoring group owned by one benchmark.
///
/// The kernel populates `mon_data` when the directory is created and
/// accounts every TID written to `tasks`.
#[derive(Debug, Clone)]
pub struct ResCtrlGroup {
    root: PathBuf,
    proc_root: PathBuf,
    fs: PrivilegedFs,
    name: String,
}

impl ResCtrlGroup {
    pub fn new(
        root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        fs: PrivilegedFs,
        name: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            proc_root: proc_root.into(),
            fs,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    pub async fn create(&self) -> Result<()> {
        self.fs
            .mkdir(&self.path())
            .await
            .with_context(|| format!("creating resctrl group {}", self.name))?;
        debug!(group = %self.name, "created resctrl group");
        Ok(())
    }

    /// Remove the group. A group that is already gone is not an error.
    pub async fn remove(&self) -> Result<()> {
        let removed = self
            .fs
            .rmdir(&self.path())
            .await
            .with_context(|| format!("removing resctrl group {}", self.name))?;
        debug!(group = %self.name, removed, "resctrl group released");
        Ok(())
    }

    /// Account every thread of `pid` and its descendants to this group.
    pub async fn add_all_threads(&self, pid: u32) -> Result<usize> {
        let tasks = self.path().join("tasks");
        attach_tree(self.fs, &self.proc_root, &tasks, &self.name, pid).await
    }
}
