//! Host signal forwarding.
//!
//! Every signal the launcher can catch is forwarded unchanged to the
//! supervised process from a dedicated thread, so `kill`, Ctrl-C and
//! terminal resizes reach the workload as if it were a direct child of the
//! shell.
//!
//! Handlers go in before the launch acquires anything ([`SignalRelay::arm`]),
//! so a signal during setup cannot kill the launcher past its rollback. The
//! forwarding thread starts once the workload's pid is known.

use std::thread::JoinHandle;

use nix::sys::signal::Signal;
use scredis_common::error::{Result, ScredisError};
use signal_hook::consts::FORBIDDEN;
use signal_hook::iterator::Signals;

use crate::runtime::ProcessHandle;

/// Every signal number that may be caught: all known signals minus
/// `SIGKILL`, `SIGSTOP`, `SIGILL`, `SIGFPE` and `SIGSEGV`.
#[must_use]
pub fn catchable_signals() -> Vec<i32> {
    Signal::iterator()
        .map(|sig| sig as i32)
        .filter(|signo| !FORBIDDEN.contains(signo))
        .collect()
}

/// Forwards host signals to one process.
#[derive(Debug, Clone)]
pub struct SignalRelay {
    signals: Vec<i32>,
}

impl SignalRelay {
    /// Relay for every catchable signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signals: catchable_signals(),
        }
    }

    /// Relay for an explicit set of signals. Forbidden signals are dropped.
    #[must_use]
    pub fn with_signals(signals: &[i32]) -> Self {
        Self {
            signals: signals
                .iter()
                .copied()
                .filter(|signo| !FORBIDDEN.contains(signo))
                .collect(),
        }
    }

    /// Signals this relay subscribes to.
    #[must_use]
    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    /// Installs the handlers without a target yet.
    ///
    /// From here on the launcher no longer dies of a catchable signal;
    /// whatever arrives is held until [`ArmedRelay::attach`].
    ///
    /// # Errors
    ///
    /// Returns an error if the handlers cannot be registered.
    pub fn arm(self) -> Result<ArmedRelay> {
        let signals = Signals::new(&self.signals).map_err(|e| ScredisError::Config {
            message: format!("registering signal handlers: {e}"),
        })?;
        tracing::debug!(count = self.signals.len(), "signal handlers installed");
        Ok(ArmedRelay { signals })
    }

    /// Arms and immediately starts forwarding to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handlers cannot be registered or the thread
    /// cannot be spawned.
    pub fn spawn(self, target: ProcessHandle) -> Result<JoinHandle<()>> {
        self.arm()?.attach(target)
    }
}

/// A relay with handlers installed, waiting for the process to forward to.
pub struct ArmedRelay {
    signals: Signals,
}

impl ArmedRelay {
    /// Starts forwarding to `target`, beginning with anything caught while
    /// armed. The thread runs until the launcher exits; there is no
    /// cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn attach(self, target: ProcessHandle) -> Result<JoinHandle<()>> {
        let mut signals = self.signals;
        tracing::debug!(pid = target.pid(), "signal relay attached");

        std::thread::Builder::new()
            .name("signal-relay".into())
            .spawn(move || {
                for signo in signals.forever() {
                    forward(target, signo);
                }
            })
            .map_err(|e| ScredisError::Config {
                message: format!("spawning signal relay: {e}"),
            })
    }
}

impl std::fmt::Debug for ArmedRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmedRelay").finish_non_exhaustive()
    }
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn forward(target: ProcessHandle, signo: i32) {
    let Ok(sig) = Signal::try_from(signo) else {
        tracing::debug!(signo, "ignoring unknown signal");
        return;
    };
    tracing::debug!(pid = target.pid(), signal = %sig, "forwarding signal");
    if let Err(e) = target.signal(sig) {
        tracing::debug!(error = %e, "signal not delivered");
    }
}
