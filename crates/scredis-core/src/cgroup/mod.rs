//! Cgroups v2 placement for the workload.
//!
//! Each launch gets its own leaf under the configured parent in the
//! unified hierarchy at `/sys/fs/cgroup`. The leaf is removed with
//! `rmdir(2)` once the workload is gone; cgroupfs does not allow removing
//! its control files individually.

use std::path::{Path, PathBuf};

use scredis_common::constants::CGROUP_V2_PATH;
use scredis_common::error::{Result, ScredisError};

/// Handle to a cgroup for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Creates `<parent>/<name>` in the unified hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create(parent: &str, name: &str) -> Result<Self> {
        Self::create_under(Path::new(CGROUP_V2_PATH), parent, name)
    }

    /// Creates `<root>/<parent>/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create_under(root: &Path, parent: &str, name: &str) -> Result<Self> {
        let path = root.join(parent).join(name);
        std::fs::create_dir_all(&path).map_err(|e| ScredisError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string())
            .map_err(|e| ScredisError::io(procs_path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup. A cgroup that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed, typically
    /// because processes are still attached.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "cgroup destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScredisError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_nests_under_parent() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::create_under(root.path(), "sc-redis", "redis-1").unwrap();
        assert!(cg.path().ends_with("sc-redis/redis-1"));
        assert!(cg.path().is_dir());
    }

    #[test]
    fn add_process_writes_pid() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::create_under(root.path(), "sc-redis", "redis-2").unwrap();
        cg.add_process(4242).unwrap();
        let procs = std::fs::read_to_string(cg.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, "4242");
    }

    #[test]
    fn destroy_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupManager::create_under(root.path(), "sc-redis", "redis-3").unwrap();
        cg.destroy().unwrap();
        assert!(!cg.path().exists());
        cg.destroy().unwrap();
    }
}
