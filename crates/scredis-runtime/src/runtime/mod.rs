//! Container runtime abstraction.
//!
//! The orchestrator only ever talks to a [`ContainerRuntime`] and the
//! [`RunningContainer`] handles it returns; [`native::NativeRuntime`] is the
//! Linux implementation.

pub mod native;

use std::convert::Infallible;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use scredis_common::error::{Result, ScredisError};
use scredis_core::spec::ContainerSpec;

use crate::handshake::{InitHandshake, SyncMessage};

/// How one standard stream of the container is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioBinding {
    /// Share the launcher's stream.
    #[default]
    Inherit,
    /// Connect to `/dev/null`.
    Null,
}

impl StdioBinding {
    /// Converts into a [`Stdio`] for process spawning.
    #[must_use]
    pub fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
        }
    }

    /// Short name passed to the init stage as the console description.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Null => "null",
        }
    }
}

/// The workload to run inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    argv: Vec<String>,
    env: Vec<String>,
    stdin: StdioBinding,
    stdout: StdioBinding,
    stderr: StdioBinding,
}

impl LaunchCommand {
    /// Starts building a command running `argv`.
    pub fn builder(argv: impl IntoIterator<Item = impl Into<String>>) -> LaunchCommandBuilder {
        LaunchCommandBuilder {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: StdioBinding::default(),
            stdout: StdioBinding::default(),
            stderr: StdioBinding::default(),
        }
    }

    /// Workload argument vector.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Environment as `KEY=VALUE` strings.
    #[must_use]
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Environment split into key/value pairs; malformed entries are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|kv| kv.split_once('='))
    }

    /// Standard input binding.
    #[must_use]
    pub const fn stdin(&self) -> StdioBinding {
        self.stdin
    }

    /// Standard output binding.
    #[must_use]
    pub const fn stdout(&self) -> StdioBinding {
        self.stdout
    }

    /// Standard error binding.
    #[must_use]
    pub const fn stderr(&self) -> StdioBinding {
        self.stderr
    }
}

/// Builder for [`LaunchCommand`].
#[derive(Debug, Clone)]
pub struct LaunchCommandBuilder {
    argv: Vec<String>,
    env: Vec<String>,
    stdin: StdioBinding,
    stdout: StdioBinding,
    stderr: StdioBinding,
}

impl LaunchCommandBuilder {
    /// Replaces the environment.
    #[must_use]
    pub fn env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the standard input binding.
    #[must_use]
    pub const fn stdin(mut self, binding: StdioBinding) -> Self {
        self.stdin = binding;
        self
    }

    /// Sets the standard output binding.
    #[must_use]
    pub const fn stdout(mut self, binding: StdioBinding) -> Self {
        self.stdout = binding;
        self
    }

    /// Sets the standard error binding.
    #[must_use]
    pub const fn stderr(mut self, binding: StdioBinding) -> Self {
        self.stderr = binding;
        self
    }

    /// Finishes the command.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument vector is empty.
    pub fn build(self) -> Result<LaunchCommand> {
        if self.argv.is_empty() {
            return Err(ScredisError::Config {
                message: "workload command is empty".into(),
            });
        }
        Ok(LaunchCommand {
            argv: self.argv,
            env: self.env,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited normally with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitOutcome {
    /// Exit code the launcher should report: the status itself, or
    /// `128 + signo` for a signal death.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signo) => 128 + signo,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signo)) => Self::Signaled(signo),
            (None, None) => Self::Exited(1),
        }
    }
}

/// Signal target that outlives borrows of the container handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    /// Handle for the host-side `pid`.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Host-side process id.
    #[must_use]
    pub const fn pid(self) -> u32 {
        self.pid
    }

    /// Delivers `sig` to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if `kill(2)` fails, including when the process is
    /// already gone.
    pub fn signal(self, sig: Signal) -> Result<()> {
        let pid = i32::try_from(self.pid).map_err(|_| ScredisError::Config {
            message: format!("pid {} out of range", self.pid),
        })?;
        signal::kill(Pid::from_raw(pid), sig).map_err(|e| ScredisError::PermissionDenied {
            message: format!("kill({pid}, {sig}) failed: {e}"),
        })
    }
}

/// Live handle to a created container.
///
/// Must be destroyed on every exit path.
pub trait RunningContainer: Send {
    /// Host-side pid of the container's first process.
    fn pid(&self) -> u32;

    /// Copyable signal target for this container.
    fn handle(&self) -> ProcessHandle {
        ProcessHandle::new(self.pid())
    }

    /// Releases the init stage and waits until it has handed over to the
    /// workload.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::RuntimeStartFailed`] if the init stage
    /// reports a failure or the handshake breaks.
    fn start(&mut self) -> Result<()>;

    /// Blocks until the workload exits.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    fn wait(&mut self) -> Result<ExitOutcome>;

    /// Delivers `sig` to the container's first process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, sig: Signal) -> Result<()> {
        self.handle().signal(sig)
    }

    /// Kills the workload if still alive and releases runtime resources.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup failure; later steps still run.
    fn destroy(self: Box<Self>) -> Result<()>;
}

/// Everything the init stage needs to finish building the container.
#[derive(Debug, Clone)]
pub struct InitContext {
    /// Spec read back from the root filesystem.
    pub spec: ContainerSpec,
    /// Workload argument vector.
    pub argv: Vec<String>,
    /// Host-side results delivered through the handshake.
    pub sync: SyncMessage,
    /// Console description passed by the host.
    pub console: String,
}

/// Creates containers from a spec and finishes them from the inside.
pub trait ContainerRuntime {
    /// Creates the container process and its host-side resources. The
    /// process is parked until [`RunningContainer::start`].
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::RuntimeCreateFailed`] if the spec is rejected
    /// or the process cannot be created.
    fn create(
        &self,
        spec: &ContainerSpec,
        command: &LaunchCommand,
    ) -> Result<Box<dyn RunningContainer>>;

    /// Runs in the init stage: finishes isolation and replaces the process
    /// with the workload. Only returns on failure.
    ///
    /// Implementations call [`InitHandshake::announce_exec`] immediately
    /// before the exec; the host treats a handshake closed without it as a
    /// failed start.
    ///
    /// # Errors
    ///
    /// Returns the first setup failure.
    fn init(&self, ctx: &InitContext, handshake: &mut InitHandshake) -> Result<Infallible>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_empty_argv() {
        assert!(LaunchCommand::builder(Vec::<String>::new()).build().is_err());
    }

    #[test]
    fn builder_keeps_env_and_stdio() {
        let cmd = LaunchCommand::builder(["redis-server", "/etc/redis.conf"])
            .env(["HOME=/", "PATH=/usr/local/bin", "garbage"])
            .stdin(StdioBinding::Null)
            .build()
            .unwrap();
        assert_eq!(cmd.argv(), ["redis-server", "/etc/redis.conf"]);
        assert_eq!(cmd.stdin(), StdioBinding::Null);
        assert_eq!(cmd.stdout(), StdioBinding::Inherit);
        let pairs: Vec<_> = cmd.env_pairs().collect();
        assert_eq!(pairs, vec![("HOME", "/"), ("PATH", "/usr/local/bin")]);
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(ExitOutcome::Exited(0).exit_code(), 0);
        assert_eq!(ExitOutcome::Exited(3).exit_code(), 3);
        assert_eq!(ExitOutcome::Signaled(15).exit_code(), 143);
    }

    #[test]
    fn exit_status_maps_to_outcome() {
        assert_eq!(
            ExitOutcome::from(ExitStatus::from_raw(7 << 8)),
            ExitOutcome::Exited(7)
        );
        assert_eq!(
            ExitOutcome::from(ExitStatus::from_raw(9)),
            ExitOutcome::Signaled(9)
        );
    }

    #[test]
    fn signalling_a_live_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        ProcessHandle::new(child.id())
            .signal(Signal::SIGTERM)
            .unwrap();
        let outcome = ExitOutcome::from(child.wait().unwrap());
        assert_eq!(outcome, ExitOutcome::Signaled(15));
    }
}
