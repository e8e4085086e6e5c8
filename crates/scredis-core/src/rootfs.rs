//! Per-launch root filesystem preparation.
//!
//! Every launch unpacks the bundled archive into its own directory under
//! the work dir, named `sc-redis-<uuid>` so concurrent launches never share
//! a tree.

use std::fs::File;
use std::path::{Path, PathBuf};

use scredis_common::constants::{ROOTFS_DIR_PREFIX, WORKLOAD_CONFIG_PATH};
use scredis_common::error::{Result, ScredisError};

/// Extracts the root filesystem archive.
#[derive(Debug, Clone)]
pub struct RootfsExporter {
    archive: PathBuf,
}

impl RootfsExporter {
    /// Creates an exporter for the archive at `archive`.
    ///
    /// Plain `.tar` and gzip-compressed `.tar.gz` / `.tgz` are supported.
    #[must_use]
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
        }
    }

    /// Returns the archive path.
    #[must_use]
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Unpacks the archive into a fresh directory under `work_dir` and
    /// returns its absolute path.
    ///
    /// A partially extracted directory is removed before returning an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::RootfsExportFailed`] if the directory cannot
    /// be created or the archive cannot be read or unpacked.
    pub fn export(&self, work_dir: &Path) -> Result<PathBuf> {
        let target = work_dir.join(format!("{ROOTFS_DIR_PREFIX}{}", uuid::Uuid::new_v4()));
        tracing::info!(
            archive = %self.archive.display(),
            target = %target.display(),
            "exporting container rootfs"
        );

        let failed = |source: std::io::Error| ScredisError::RootfsExportFailed {
            path: target.clone(),
            source,
        };

        std::fs::create_dir_all(work_dir).map_err(failed)?;
        std::fs::create_dir(&target).map_err(failed)?;

        if let Err(e) = self.unpack(&target) {
            if let Err(cleanup) = std::fs::remove_dir_all(&target) {
                tracing::warn!(
                    path = %target.display(),
                    error = %cleanup,
                    "failed to remove partially exported rootfs"
                );
            }
            return Err(failed(e));
        }

        let target = std::fs::canonicalize(&target).map_err(failed)?;
        tracing::debug!(path = %target.display(), "rootfs exported");
        Ok(target)
    }

    fn unpack(&self, target: &Path) -> std::io::Result<()> {
        let file = File::open(&self.archive)?;
        if is_gzip_archive(&self.archive) {
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder).unpack(target)
        } else {
            tar::Archive::new(file).unpack(target)
        }
    }
}

/// Writes the workload configuration file into `rootfs`.
///
/// `directives` is written verbatim; without an override the file is left
/// empty so the workload runs on its defaults.
///
/// # Errors
///
/// Returns an I/O error if the file or its parent cannot be written.
pub fn write_workload_config(rootfs: &Path, directives: Option<&str>) -> Result<PathBuf> {
    let path = rootfs.join(WORKLOAD_CONFIG_PATH.trim_start_matches('/'));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ScredisError::io(parent, e))?;
    }
    let mut content = directives.unwrap_or_default().to_string();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    std::fs::write(&path, content).map_err(|e| ScredisError::io(&path, e))?;
    tracing::debug!(path = %path.display(), overridden = directives.is_some(), "workload config written");
    Ok(path)
}

/// Removes a per-launch root filesystem.
///
/// A directory that is already gone is not an error.
///
/// # Errors
///
/// Returns an I/O error if removal fails.
pub fn remove_rootfs(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "rootfs removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ScredisError::io(path, e)),
    }
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}
