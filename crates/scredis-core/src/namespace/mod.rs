//! Linux namespace management for container isolation.
//!
//! The PID namespace is special: `unshare(CLONE_NEWPID)` only affects
//! children of the caller, so the host enters it around the fork (see
//! [`pid::PidNamespaceGuard`]) while every other namespace is unshared by
//! the child itself before it execs the init stage.

pub mod pid;
pub mod uts;

use std::collections::BTreeMap;

use scredis_common::error::{Result, ScredisError};

use crate::spec::ns;

/// Which namespaces a container is created in.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceSet {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl NamespaceSet {
    /// Reads the namespace map of a container spec.
    ///
    /// Entries set to `false` are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for namespace keys the runtime does not support.
    pub fn from_spec(namespaces: &BTreeMap<String, bool>) -> Result<Self> {
        let mut set = Self::default();
        for (key, _) in namespaces.iter().filter(|(_, enabled)| **enabled) {
            match key.as_str() {
                ns::PID => set.pid = true,
                ns::MOUNT => set.mount = true,
                ns::NET => set.network = true,
                ns::IPC => set.ipc = true,
                ns::UTS => set.uts = true,
                other => {
                    return Err(ScredisError::Config {
                        message: format!("unsupported namespace: {other}"),
                    });
                }
            }
        }
        Ok(set)
    }

    /// `unshare(2)` flags for every namespace except PID.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn unshare_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags
    }
}

/// Moves the calling process into fresh namespaces for `flags`.
///
/// Meant to run in the forked child before exec; a multi-threaded caller
/// cannot unshare its mount namespace.
///
/// # Errors
///
/// Returns the raw errno if `unshare(2)` fails.
#[cfg(target_os = "linux")]
pub fn create_namespaces(flags: nix::sched::CloneFlags) -> nix::Result<()> {
    nix::sched::unshare(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(keys: &[(&str, bool)]) -> BTreeMap<String, bool> {
        keys.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn reads_enabled_namespaces() {
        let set = NamespaceSet::from_spec(&map(&[
            ("NEWIPC", true),
            ("NEWNS", true),
            ("NEWPID", true),
            ("NEWUTS", true),
            ("NEWNET", false),
        ]))
        .unwrap();
        assert!(set.pid && set.mount && set.ipc && set.uts);
        assert!(!set.network);
    }

    #[test]
    fn rejects_unknown_namespace() {
        let err = NamespaceSet::from_spec(&map(&[("NEWUSER", true)])).unwrap_err();
        assert!(err.to_string().contains("NEWUSER"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pid_is_never_part_of_unshare_flags() {
        use nix::sched::CloneFlags;

        let set = NamespaceSet {
            pid: true,
            network: true,
            ..NamespaceSet::default()
        };
        let flags = set.unshare_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
    }
}
