//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. The old root is
//! stacked under the new one and lazily detached, so no `put_old`
//! directory is needed inside the image.

use std::path::Path;

use scredis_common::error::{Result, ScredisError};

/// Switches the root filesystem to `new_root`, which must be a mount point,
/// and leaves the caller in `/`.
///
/// # Errors
///
/// Returns an error if `pivot_root(2)` or detaching the old root fails.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};
    use nix::unistd::chdir;

    let failed = |what: &str, e: nix::Error| ScredisError::InitFailure {
        message: format!("{what} ({}): {e}", new_root.display()),
    };

    tracing::info!(new_root = %new_root.display(), "performing pivot_root");
    chdir(new_root).map_err(|e| failed("chdir to new root", e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| failed("pivot_root", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| failed("detaching old root", e))?;
    chdir("/").map_err(|e| failed("chdir to /", e))?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(ScredisError::Config {
        message: "Linux required for native container operations".into(),
    })
}
