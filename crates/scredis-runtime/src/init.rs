//! Stage 1: the process the host re-executes inside the new namespaces.
//!
//! Everything here runs on the main thread; no thread may exist when the
//! mount namespace work and the final exec happen.

use std::convert::Infallible;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use scredis_common::constants::{ENV_CONSOLE, ENV_HANDSHAKE_FD, ENV_ROOTFS};
use scredis_common::error::{Result, ScredisError};
use scredis_core::spec;

use crate::handshake::InitHandshake;
use crate::runtime::{ContainerRuntime, InitContext};

/// Variables the host passes to the init stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeEnv {
    /// Console description, `inherit` when absent.
    pub console: String,
    /// Descriptor number of the handshake socket.
    pub fd: RawFd,
    /// Root filesystem on the host side.
    pub rootfs: PathBuf,
}

impl HandshakeEnv {
    /// Reads the handshake variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::InitFailure`] if a variable is missing or
    /// malformed, which usually means `init` was run by hand.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the handshake variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::InitFailure`] if a variable is missing or
    /// malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let missing = |key: &str| ScredisError::InitFailure {
            message: format!("{key} not set; init is only run by the launcher"),
        };
        let raw_fd = lookup(ENV_HANDSHAKE_FD).ok_or_else(|| missing(ENV_HANDSHAKE_FD))?;
        let fd = raw_fd.parse().map_err(|_| ScredisError::InitFailure {
            message: format!("{ENV_HANDSHAKE_FD}={raw_fd} is not a descriptor"),
        })?;
        let rootfs = lookup(ENV_ROOTFS)
            .map(PathBuf::from)
            .ok_or_else(|| missing(ENV_ROOTFS))?;
        Ok(Self {
            console: lookup(ENV_CONSOLE).unwrap_or_else(|| "inherit".into()),
            fd,
            rootfs,
        })
    }
}

/// Runs stage 1 and execs the workload. Only returns on failure, after the
/// failure was reported to the host.
///
/// The runtime is built through `make_runtime` once the handshake is
/// adopted, so its setup errors reach the host too. `user_args` are the
/// arguments after `--`; when empty, the spec's own `args` are used.
///
/// # Errors
///
/// Returns [`ScredisError::InitFailure`] describing the first failure.
pub fn run_init<R: ContainerRuntime>(
    make_runtime: impl FnOnce() -> Result<R>,
    user_args: Vec<String>,
) -> Result<Infallible> {
    let env = HandshakeEnv::from_env()?;
    let mut handshake = InitHandshake::from_fd(env.fd)?;

    let result =
        make_runtime().and_then(|runtime| finish(&runtime, &env, user_args, &mut handshake));
    let Err(e) = result;
    tracing::error!(error = %e, "init stage failed");
    handshake.report_failure(&e.to_string());
    Err(match e {
        e @ ScredisError::InitFailure { .. } => e,
        other => ScredisError::InitFailure {
            message: other.to_string(),
        },
    })
}

fn finish<R: ContainerRuntime>(
    runtime: &R,
    env: &HandshakeEnv,
    user_args: Vec<String>,
    handshake: &mut InitHandshake,
) -> Result<Infallible> {
    let ctx = prepare(&env.rootfs, &env.console, user_args, handshake)?;
    handshake.seal()?;
    runtime.init(&ctx, handshake)
}

/// Reads everything the runtime needs. Blocks until the host calls start.
fn prepare(
    rootfs: &Path,
    console: &str,
    user_args: Vec<String>,
    handshake: &mut InitHandshake,
) -> Result<InitContext> {
    std::env::set_current_dir(rootfs).map_err(|e| ScredisError::io(rootfs, e))?;
    let spec = spec::load_spec(Path::new("."))?;
    let argv = select_argv(user_args, &spec.args);
    tracing::debug!(rootfs = %rootfs.display(), ?argv, "spec loaded, waiting for start");

    let sync = handshake.receive()?;
    Ok(InitContext {
        spec,
        argv,
        sync,
        console: console.to_string(),
    })
}

fn select_argv(user_args: Vec<String>, spec_args: &[String]) -> Vec<String> {
    if user_args.is_empty() {
        spec_args.to_vec()
    } else {
        user_args
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::handshake::{HostHandshake, SyncMessage};
    use crate::runtime::{LaunchCommand, RunningContainer};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_is_read() {
        let env = HandshakeEnv::from_lookup(lookup(&[
            (ENV_HANDSHAKE_FD, "3"),
            (ENV_ROOTFS, "/var/lib/scredis/sc-redis-1"),
            (ENV_CONSOLE, "null"),
        ]))
        .unwrap();
        assert_eq!(env.fd, 3);
        assert_eq!(env.rootfs, PathBuf::from("/var/lib/scredis/sc-redis-1"));
        assert_eq!(env.console, "null");
    }

    #[test]
    fn missing_env_is_an_init_failure() {
        let err = HandshakeEnv::from_lookup(lookup(&[(ENV_HANDSHAKE_FD, "3")])).unwrap_err();
        assert!(matches!(err, ScredisError::InitFailure { .. }));
        let err = HandshakeEnv::from_lookup(lookup(&[
            (ENV_HANDSHAKE_FD, "three"),
            (ENV_ROOTFS, "/"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("three"));
    }

    #[test]
    fn user_args_override_spec_args() {
        let spec_args = vec!["redis-server".to_string(), "/etc/redis.conf".to_string()];
        assert_eq!(select_argv(Vec::new(), &spec_args), spec_args);
        assert_eq!(
            select_argv(vec!["redis-cli".into()], &spec_args),
            vec!["redis-cli".to_string()]
        );
    }

    struct Refusing;

    impl ContainerRuntime for Refusing {
        fn create(
            &self,
            _spec: &spec::ContainerSpec,
            _command: &LaunchCommand,
        ) -> Result<Box<dyn RunningContainer>> {
            unreachable!("init stage never creates")
        }

        fn init(&self, ctx: &InitContext, _handshake: &mut InitHandshake) -> Result<Infallible> {
            Err(ScredisError::Config {
                message: format!("refusing {}", ctx.argv.join(" ")),
            })
        }
    }

    #[test]
    fn prepare_reads_spec_and_sync_message() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec::build(&spec::SpecOptions {
            hostname: "redis".into(),
            restrict_sys: true,
            cgroup_name: "redis".into(),
            cgroup_parent: "sc-redis".into(),
            environment: spec::default_environment("redis"),
            network: None,
            rootfs: dir.path().to_path_buf(),
            args: vec!["redis-server".into(), "/etc/redis.conf".into()],
        });
        let _ = spec::write_spec(&spec, dir.path()).unwrap();

        let (a, b) = UnixStream::pair().unwrap();
        let mut host = HostHandshake::from_stream(a);
        let mut init = InitHandshake::from_stream(b);
        host.send(&SyncMessage {
            peer_interface: Some("veth7c".into()),
        })
        .unwrap();

        let cwd = std::env::current_dir().unwrap();
        let ctx = prepare(dir.path(), "inherit", Vec::new(), &mut init);
        std::env::set_current_dir(cwd).unwrap();
        let ctx = ctx.unwrap();

        assert_eq!(ctx.spec, spec);
        assert_eq!(ctx.argv, spec.args);
        assert_eq!(ctx.sync.peer_interface.as_deref(), Some("veth7c"));

        let Err(e) = Refusing.init(&ctx, &mut init);
        assert!(e.to_string().contains("refusing redis-server"));
        init.report_failure(&e.to_string());
        drop(init);
        let report = host.await_ready().unwrap().unwrap();
        assert!(report.error.contains("refusing"));
    }
}
