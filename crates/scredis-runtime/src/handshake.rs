//! Host ↔ init synchronisation.
//!
//! A Unix socket pair is created before the fork. The init end lands on
//! [`HANDSHAKE_FD`] in the child and is marked close-on-exec before the
//! workload is executed, so:
//!
//! 1. the host writes one [`SyncMessage`] and shuts down its write side;
//! 2. the init stage reads it to EOF and finishes the container;
//! 3. right before `exec` the init stage writes [`EXEC_MARKER`];
//! 4. the host reads to EOF: the bare marker means the workload was exec'd,
//!    an [`InitReport`] means setup failed, and nothing at all means the
//!    init stage died without a word.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use scredis_common::constants::HANDSHAKE_FD;
use scredis_common::error::{Result, ScredisError};
use serde::{Deserialize, Serialize};

/// Written by the init stage immediately before it execs the workload.
pub const EXEC_MARKER: &[u8] = b"exec\n";

/// Host-side results the init stage needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Name of the veth end moved into the container's network namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_interface: Option<String>,
}

/// Failure report written by the init stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    /// Rendered error.
    pub error: String,
}

/// Creates the socket pair, returning the host end and the raw init end
/// that must be installed in the child.
///
/// # Errors
///
/// Returns an error if `socketpair(2)` fails.
pub fn pair() -> Result<(HostHandshake, OwnedFd)> {
    let (host, init) = UnixStream::pair().map_err(|e| ScredisError::RuntimeCreateFailed {
        message: format!("handshake socketpair: {e}"),
    })?;
    Ok((HostHandshake { stream: host }, OwnedFd::from(init)))
}

/// Host end of the handshake.
#[derive(Debug)]
pub struct HostHandshake {
    stream: UnixStream,
}

impl HostHandshake {
    /// Wraps an already connected stream.
    #[must_use]
    pub const fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Sends `msg` and closes the host's write side.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::RuntimeStartFailed`] if the write fails.
    pub fn send(&mut self, msg: &SyncMessage) -> Result<()> {
        let raw = serde_json::to_vec(msg)?;
        self.stream
            .write_all(&raw)
            .and_then(|()| self.stream.shutdown(Shutdown::Write))
            .map_err(|e| ScredisError::RuntimeStartFailed {
                message: format!("handshake write: {e}"),
            })
    }

    /// Blocks until the init end is closed.
    ///
    /// Returns `None` once the workload was exec'd, or the report the init
    /// stage left when it failed.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::RuntimeStartFailed`] if the read fails, the
    /// init stage closed the socket without announcing the exec, or it
    /// wrote something that is not a report.
    pub fn await_ready(&mut self) -> Result<Option<InitReport>> {
        let mut raw = Vec::new();
        let _ = self
            .stream
            .read_to_end(&mut raw)
            .map_err(|e| ScredisError::RuntimeStartFailed {
                message: format!("handshake read: {e}"),
            })?;
        if raw.is_empty() {
            return Err(ScredisError::RuntimeStartFailed {
                message: "init stage exited before executing the workload".into(),
            });
        }
        // A failed exec appends its report after the marker.
        let report = raw.strip_prefix(EXEC_MARKER).unwrap_or(raw.as_slice());
        if report.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(report)
            .map(Some)
            .map_err(|e| ScredisError::RuntimeStartFailed {
                message: format!("malformed init report: {e}"),
            })
    }
}

/// Init end of the handshake.
#[derive(Debug)]
pub struct InitHandshake {
    stream: UnixStream,
}

impl InitHandshake {
    /// Wraps an already connected stream.
    #[must_use]
    pub const fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Adopts the descriptor the host installed, normally [`HANDSHAKE_FD`].
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::InitFailure`] if `fd` is not open.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(ScredisError::InitFailure {
                message: format!(
                    "handshake fd {fd} is not open: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        // SAFETY: the descriptor is open and was handed to this process
        // for exclusive use by the host.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Self { stream })
    }

    /// Reads the host's message. Blocks until the host starts the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the message is malformed.
    pub fn receive(&mut self) -> Result<SyncMessage> {
        let mut raw = Vec::new();
        let _ = self
            .stream
            .read_to_end(&mut raw)
            .map_err(|e| ScredisError::InitFailure {
                message: format!("handshake read: {e}"),
            })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Marks the descriptor close-on-exec so a successful exec closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if `fcntl(2)` fails.
    pub fn seal(&self) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = self.stream.as_raw_fd();
        // SAFETY: sets a descriptor flag on a descriptor this value owns.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(ScredisError::InitFailure {
                message: format!(
                    "sealing handshake fd: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        Ok(())
    }

    /// Tells the host the workload is about to be exec'd.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::InitFailure`] if the write fails.
    pub fn announce_exec(&mut self) -> Result<()> {
        self.stream
            .write_all(EXEC_MARKER)
            .map_err(|e| ScredisError::InitFailure {
                message: format!("handshake write: {e}"),
            })
    }

    /// Reports `error` to the host. Best effort: the init stage is about
    /// to exit either way.
    pub fn report_failure(&mut self, error: &str) {
        let report = InitReport {
            error: error.to_string(),
        };
        let sent = serde_json::to_vec(&report)
            .map_err(std::io::Error::from)
            .and_then(|raw| self.stream.write_all(&raw));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "could not report init failure to host");
        }
    }
}

/// Installs the init end at [`HANDSHAKE_FD`] in a freshly forked child.
///
/// Only async-signal-safe calls are made; this runs between `fork` and
/// `exec`.
///
/// # Errors
///
/// Returns the OS error of the failing call.
pub fn install_in_child(fd: RawFd) -> std::io::Result<()> {
    // dup2 onto itself is a no-op that would leave close-on-exec set.
    let rc = if fd == HANDSHAKE_FD {
        // SAFETY: clears descriptor flags on an inherited descriptor.
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) }
    } else {
        // SAFETY: duplicates an inherited descriptor; the target is
        // silently closed first if open.
        unsafe { libc::dup2(fd, HANDSHAKE_FD) }
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> (HostHandshake, InitHandshake) {
        let (a, b) = UnixStream::pair().unwrap();
        (HostHandshake::from_stream(a), InitHandshake::from_stream(b))
    }

    #[test]
    fn message_reaches_init() {
        let (mut host, mut init) = connected();
        let msg = SyncMessage {
            peer_interface: Some("veth4242c".into()),
        };
        host.send(&msg).unwrap();
        assert_eq!(init.receive().unwrap(), msg);
    }

    #[test]
    fn announced_exec_means_ready() {
        let (mut host, mut init) = connected();
        host.send(&SyncMessage::default()).unwrap();
        let _ = init.receive().unwrap();
        init.announce_exec().unwrap();
        drop(init);
        assert_eq!(host.await_ready().unwrap(), None);
    }

    #[test]
    fn silent_close_is_a_start_failure() {
        let (mut host, init) = connected();
        host.send(&SyncMessage::default()).unwrap();
        drop(init);
        let err = host.await_ready().unwrap_err();
        assert!(matches!(err, ScredisError::RuntimeStartFailed { .. }));
        assert!(err.to_string().contains("before executing"));
    }

    #[test]
    fn failed_exec_after_announcement_is_reported() {
        let (mut host, mut init) = connected();
        host.send(&SyncMessage::default()).unwrap();
        let _ = init.receive().unwrap();
        init.announce_exec().unwrap();
        init.report_failure("exec redis-server: ENOENT");
        drop(init);
        let report = host.await_ready().unwrap().unwrap();
        assert_eq!(report.error, "exec redis-server: ENOENT");
    }

    #[test]
    fn failure_report_reaches_host() {
        let (mut host, mut init) = connected();
        host.send(&SyncMessage::default()).unwrap();
        let _ = init.receive().unwrap();
        init.report_failure("pivot_root failed");
        drop(init);
        let report = host.await_ready().unwrap().unwrap();
        assert_eq!(report.error, "pivot_root failed");
    }

    #[test]
    fn garbage_from_init_is_a_start_failure() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut host = HostHandshake::from_stream(a);
        b.write_all(b"not json").unwrap();
        drop(b);
        assert!(matches!(
            host.await_ready(),
            Err(ScredisError::RuntimeStartFailed { .. })
        ));
    }

    #[test]
    fn closed_descriptor_is_rejected() {
        assert!(InitHandshake::from_fd(-1).is_err());
    }
}
