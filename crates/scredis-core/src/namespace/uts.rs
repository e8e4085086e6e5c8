//! UTS namespace isolation.
//!
//! Gives the container its own hostname.

use scredis_common::error::{Result, ScredisError};

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| ScredisError::PermissionDenied {
        message: format!("sethostname({hostname}) failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(ScredisError::Config {
        message: "Linux required for native container operations".into(),
    })
}
