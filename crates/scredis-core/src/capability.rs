//! Linux capability management for least-privilege execution.
//!
//! Drops every capability from the bounding set except those the
//! container specification retains.

use std::fmt;
use std::str::FromStr;

use scredis_common::error::{Result, ScredisError};

/// Highest capability number assumed when the kernel does not report one.
const FALLBACK_CAP_LAST: u32 = 40;

/// Linux capabilities a workload may retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Change file ownership.
    Chown,
    /// Bypass file permission checks.
    DacOverride,
    /// Bypass owner checks on files.
    Fowner,
    /// Send signals to arbitrary processes.
    Kill,
    /// Manipulate group IDs.
    Setgid,
    /// Manipulate user IDs.
    Setuid,
    /// Transfer capabilities.
    Setpcap,
    /// Bind to ports below 1024.
    NetBindService,
    /// Use raw and packet sockets.
    NetRaw,
    /// Use `chroot(2)`.
    SysChroot,
    /// Create special files with `mknod(2)`.
    Mknod,
    /// Set file capabilities.
    Setfcap,
}

impl Capability {
    /// Kernel capability number.
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::Chown => 0,
            Self::DacOverride => 1,
            Self::Fowner => 3,
            Self::Kill => 5,
            Self::Setgid => 6,
            Self::Setuid => 7,
            Self::Setpcap => 8,
            Self::NetBindService => 10,
            Self::NetRaw => 13,
            Self::SysChroot => 18,
            Self::Mknod => 27,
            Self::Setfcap => 31,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Chown => "CHOWN",
            Self::DacOverride => "DAC_OVERRIDE",
            Self::Fowner => "FOWNER",
            Self::Kill => "KILL",
            Self::Setgid => "SETGID",
            Self::Setuid => "SETUID",
            Self::Setpcap => "SETPCAP",
            Self::NetBindService => "NET_BIND_SERVICE",
            Self::NetRaw => "NET_RAW",
            Self::SysChroot => "SYS_CHROOT",
            Self::Mknod => "MKNOD",
            Self::Setfcap => "SETFCAP",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = ScredisError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_uppercase();
        let name = name.strip_prefix("CAP_").unwrap_or(&name);
        let cap = match name {
            "CHOWN" => Self::Chown,
            "DAC_OVERRIDE" => Self::DacOverride,
            "FOWNER" => Self::Fowner,
            "KILL" => Self::Kill,
            "SETGID" => Self::Setgid,
            "SETUID" => Self::Setuid,
            "SETPCAP" => Self::Setpcap,
            "NET_BIND_SERVICE" => Self::NetBindService,
            "NET_RAW" => Self::NetRaw,
            "SYS_CHROOT" => Self::SysChroot,
            "MKNOD" => Self::Mknod,
            "SETFCAP" => Self::Setfcap,
            _ => {
                return Err(ScredisError::Config {
                    message: format!("unknown capability: {s}"),
                });
            }
        };
        Ok(cap)
    }
}

/// Parses the capability names of a container spec.
///
/// # Errors
///
/// Returns an error on the first unknown name.
pub fn parse_capabilities<S: AsRef<str>>(names: &[S]) -> Result<Vec<Capability>> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

/// Drops all Linux capabilities except those in the allowlist from the
/// bounding set of the calling process.
///
/// # Errors
///
/// Returns an error if `prctl(PR_CAPBSET_DROP)` fails for a capability the
/// kernel knows about.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn drop_capabilities(keep: &[Capability]) -> Result<()> {
    let last = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(FALLBACK_CAP_LAST);

    let mut dropped = 0_u32;
    for cap in 0..=last {
        if keep.iter().any(|k| k.number() == cap) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP takes the capability number as its only
        // argument and touches no memory owned by this process.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAPBSET_DROP,
                libc::c_ulong::from(cap),
                0_u64,
                0_u64,
                0_u64,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                continue;
            }
            return Err(ScredisError::PermissionDenied {
                message: format!("dropping capability {cap}: {err}"),
            });
        }
        dropped += 1;
    }
    tracing::info!(retained = keep.len(), dropped, "dropping capabilities");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; capabilities are a Linux concept.
#[cfg(not(target_os = "linux"))]
pub fn drop_capabilities(_keep: &[Capability]) -> Result<()> {
    Err(ScredisError::Config {
        message: "Linux required for native container operations".into(),
    })
}
