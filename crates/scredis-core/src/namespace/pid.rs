//! PID namespace isolation.
//!
//! The container's init stage must be PID 1 of its own namespace. Only
//! children forked after `unshare(CLONE_NEWPID)` land in the new namespace,
//! so the host enters it for exactly one fork and then restores its own
//! namespace for later children (`ip` invocations during teardown, for
//! instance).

use std::fs::File;

use scredis_common::error::{Result, ScredisError};

/// Restores the caller's PID namespace for future children on drop.
#[derive(Debug)]
pub struct PidNamespaceGuard {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    original: File,
}

impl PidNamespaceGuard {
    /// Makes the next child of the calling thread PID 1 of a new namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the current namespace cannot be opened or
    /// `unshare(CLONE_NEWPID)` fails.
    #[cfg(target_os = "linux")]
    pub fn enter_for_children() -> Result<Self> {
        use nix::sched::{CloneFlags, unshare};

        let original = File::open("/proc/self/ns/pid")
            .map_err(|e| ScredisError::io("/proc/self/ns/pid", e))?;
        unshare(CloneFlags::CLONE_NEWPID).map_err(|e| ScredisError::PermissionDenied {
            message: format!("PID namespace creation failed: {e}"),
        })?;
        tracing::debug!("PID namespace armed for next child");
        Ok(Self { original })
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error; PID namespaces require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn enter_for_children() -> Result<Self> {
        Err(ScredisError::Config {
            message: "Linux required for native container operations".into(),
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for PidNamespaceGuard {
    fn drop(&mut self) {
        use nix::sched::{CloneFlags, setns};

        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWPID) {
            tracing::warn!(error = %e, "failed to restore PID namespace for children");
        }
    }
}
