//! Mount utilities for container filesystem setup.
//!
//! Everything here runs in the init stage, inside the container's mount
//! namespace and before `pivot_root`, with paths resolved against the
//! root filesystem.

use scredis_common::error::{Result, ScredisError};

use crate::spec::{BLOCK_DEVICE, CHAR_DEVICE, DeviceRule};

/// File type and device number for a device node rule.
///
/// # Errors
///
/// Returns an error for wildcard numbers or unknown device types, neither
/// of which names a concrete node.
pub fn device_number(rule: &DeviceRule) -> Result<(DeviceKind, u64, u64)> {
    let invalid = |why: &str| ScredisError::Config {
        message: format!(
            "device node {}: {why}",
            rule.path.as_deref().unwrap_or("<unnamed>")
        ),
    };
    let kind = match rule.kind {
        CHAR_DEVICE => DeviceKind::Char,
        BLOCK_DEVICE => DeviceKind::Block,
        _ => return Err(invalid("unknown device type")),
    };
    let major = u64::try_from(rule.major_number).map_err(|_| invalid("wildcard major"))?;
    let minor = u64::try_from(rule.minor_number).map_err(|_| invalid("wildcard minor"))?;
    Ok((kind, major, minor))
}

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use nix::mount::{MsFlags, mount};
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};
    use scredis_common::error::{Result, ScredisError};

    use super::{DeviceKind, device_number};
    use crate::filesystem::target_in;
    use crate::spec::{DeviceRule, MountSpec};

    const NONE: Option<&'static str> = None;

    fn mount_failed(target: &Path, e: nix::Error) -> ScredisError {
        ScredisError::io(target, std::io::Error::from(e))
    }

    fn ensure_dir(path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| ScredisError::io(path, e))
    }

    /// Stops mount events from propagating back to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if remounting `/` fails.
    pub fn make_mounts_private() -> Result<()> {
        let root = Path::new("/");
        mount(NONE, root, NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)
            .map_err(|e| mount_failed(root, e))?;
        tracing::debug!("mount propagation set to private");
        Ok(())
    }

    /// Bind-mounts the root filesystem onto itself so it becomes a mount
    /// point, which `pivot_root(2)` requires.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind mount fails.
    pub fn bind_rootfs(rootfs: &Path) -> Result<()> {
        mount(
            Some(rootfs),
            rootfs,
            NONE,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            NONE,
        )
        .map_err(|e| mount_failed(rootfs, e))?;
        tracing::debug!(rootfs = %rootfs.display(), "rootfs bind-mounted");
        Ok(())
    }

    /// Mounts a fresh `proc` at `<rootfs>/proc`.
    ///
    /// With `restrict_sys`, `/proc/sys` is additionally remounted
    /// read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if any mount fails.
    pub fn mount_proc(rootfs: &Path, restrict_sys: bool) -> Result<()> {
        let target = target_in(rootfs, "/proc");
        ensure_dir(&target)?;
        mount(
            Some("proc"),
            &target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            NONE,
        )
        .map_err(|e| mount_failed(&target, e))?;

        if restrict_sys {
            let sys = target.join("sys");
            mount(Some(&sys), &sys, NONE, MsFlags::MS_BIND, NONE)
                .map_err(|e| mount_failed(&sys, e))?;
            mount(
                NONE,
                &sys,
                NONE,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                NONE,
            )
            .map_err(|e| mount_failed(&sys, e))?;
        }
        tracing::debug!(restrict_sys, "proc mounted");
        Ok(())
    }

    /// Applies the additional mounts listed in the spec.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount point cannot be created or mounted.
    pub fn apply_mounts(rootfs: &Path, mounts: &[MountSpec]) -> Result<()> {
        for spec in mounts {
            let target = target_in(rootfs, &spec.destination);
            ensure_dir(&target)?;
            mount(
                Some(spec.kind.as_str()),
                &target,
                Some(spec.kind.as_str()),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                NONE,
            )
            .map_err(|e| mount_failed(&target, e))?;
            tracing::debug!(kind = %spec.kind, destination = %spec.destination, "mounted");
        }
        Ok(())
    }

    /// Mounts a tmpfs on `<rootfs>/dev` and creates the listed device nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the tmpfs cannot be mounted or a node cannot be
    /// created.
    pub fn populate_dev(rootfs: &Path, nodes: &[DeviceRule]) -> Result<()> {
        let dev = target_in(rootfs, "/dev");
        ensure_dir(&dev)?;
        mount(
            Some("tmpfs"),
            &dev,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
        )
        .map_err(|e| mount_failed(&dev, e))?;

        for rule in nodes {
            let Some(path) = rule.path.as_deref() else {
                continue;
            };
            let (kind, major, minor) = device_number(rule)?;
            let node = target_in(rootfs, path);
            let sflag = match kind {
                DeviceKind::Char => SFlag::S_IFCHR,
                DeviceKind::Block => SFlag::S_IFBLK,
            };
            let mode = rule.file_mode.unwrap_or(0o666);
            mknod(
                &node,
                sflag,
                Mode::from_bits_truncate(mode),
                makedev(major, minor),
            )
            .map_err(|e| mount_failed(&node, e))?;
            std::fs::set_permissions(&node, std::fs::Permissions::from_mode(mode))
                .map_err(|e| ScredisError::io(&node, e))?;
        }
        tracing::debug!(count = nodes.len(), "device nodes created");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::{apply_mounts, bind_rootfs, make_mounts_private, mount_proc, populate_dev};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::device_nodes;

    #[test]
    fn device_nodes_have_concrete_numbers() {
        for rule in device_nodes() {
            let (kind, major, _) = device_number(&rule).unwrap();
            assert_eq!(kind, DeviceKind::Char);
            assert!(major > 0);
        }
    }

    #[test]
    fn wildcard_rules_are_not_nodes() {
        let rule = crate::spec::allowed_devices()
            .into_iter()
            .find(|r| r.major_number == crate::spec::ANY)
            .unwrap();
        assert!(device_number(&rule).is_err());
    }
}
