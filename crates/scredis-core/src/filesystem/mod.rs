//! Filesystem management for container isolation.
//!
//! Mount setup inside the new mount namespace, followed by `pivot_root`
//! into the exported root filesystem.

pub mod mount;
pub mod pivot_root;

use std::path::{Path, PathBuf};

/// Resolves a container-absolute path against the root filesystem on the
/// host side.
///
/// Leading slashes are stripped so `/dev/null` resolves to
/// `<rootfs>/dev/null` rather than replacing the root.
#[must_use]
pub fn target_in(rootfs: &Path, container_path: &str) -> PathBuf {
    rootfs.join(container_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_in_stays_under_rootfs() {
        let root = Path::new("/var/lib/scredis/sc-redis-1");
        assert_eq!(target_in(root, "/dev/null"), root.join("dev/null"));
        assert_eq!(target_in(root, "tmp"), root.join("tmp"));
    }
}
