//! Linux runtime built from namespaces, a cgroup, and a veth pair.
//!
//! `create` re-executes the launcher as `sc-redis init -- <argv>` inside
//! fresh namespaces and parks it on the handshake while the host moves it
//! into its cgroup and plugs in its network. `init` runs inside that child,
//! finishes the mount and network setup, pivots into the rootfs, drops
//! capabilities, and execs the workload.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use ipnetwork::Ipv4Network;
use nix::sys::signal::Signal;
use scredis_common::constants::{
    CGROUP_V2_PATH, ENV_CONSOLE, ENV_HANDSHAKE_FD, ENV_ROOTFS, HANDSHAKE_FD, INIT_SUBCOMMAND,
    VETH_PREFIX,
};
use scredis_common::error::{Result, ScredisError};
use scredis_core::bridge::{HostNetwork, IpCommand};
use scredis_core::capability::{drop_capabilities, parse_capabilities};
use scredis_core::cgroup::CgroupManager;
use scredis_core::filesystem::{mount, pivot_root};
use scredis_core::namespace::pid::PidNamespaceGuard;
use scredis_core::namespace::{NamespaceSet, create_namespaces, uts};
use scredis_core::spec::{ContainerSpec, NetworkDescriptor};

use super::{ContainerRuntime, ExitOutcome, InitContext, LaunchCommand, RunningContainer};
use crate::handshake::{self, HostHandshake, InitHandshake, SyncMessage};

/// Interface name of the container's bridged link.
const CONTAINER_IFACE: &str = "eth0";

/// Native Linux container runtime.
#[derive(Debug, Clone)]
pub struct NativeRuntime {
    ip: IpCommand,
    cgroup_root: PathBuf,
}

impl NativeRuntime {
    /// Creates a runtime using the system `ip` and the unified cgroup
    /// hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip(8)` cannot be found.
    pub fn new() -> Result<Self> {
        Ok(Self {
            ip: IpCommand::locate()?,
            cgroup_root: PathBuf::from(CGROUP_V2_PATH),
        })
    }

    fn spawn(&self, spec: &ContainerSpec, command: &LaunchCommand) -> Result<NativeContainer> {
        let namespaces = NamespaceSet::from_spec(&spec.namespaces)?;
        let (host_end, init_end) = handshake::pair()?;
        let exe = std::env::current_exe().map_err(|e| ScredisError::io("/proc/self/exe", e))?;

        let mut cmd = Command::new(exe);
        let _ = cmd
            .arg(INIT_SUBCOMMAND)
            .arg("--")
            .args(command.argv())
            .env_clear()
            .envs(command.env_pairs())
            .env(ENV_CONSOLE, command.stdout().as_str())
            .env(ENV_HANDSHAKE_FD, HANDSHAKE_FD.to_string())
            .env(ENV_ROOTFS, &spec.rootfs)
            .stdin(command.stdin().to_stdio())
            .stdout(command.stdout().to_stdio())
            .stderr(command.stderr().to_stdio());
        if let Ok(filter) = std::env::var("RUST_LOG") {
            let _ = cmd.env("RUST_LOG", filter);
        }

        let init_fd = init_end.as_raw_fd();
        let flags = namespaces.unshare_flags();
        // SAFETY: the hook only calls dup2/fcntl/unshare, which are
        // async-signal-safe, and touches no memory shared with the parent.
        unsafe {
            let _ = cmd.pre_exec(move || {
                handshake::install_in_child(init_fd)?;
                create_namespaces(flags).map_err(std::io::Error::from)
            });
        }

        let pid_ns = if namespaces.pid {
            Some(PidNamespaceGuard::enter_for_children()?)
        } else {
            None
        };
        let spawned = cmd.spawn();
        drop(pid_ns);
        drop(init_end);

        let child = spawned.map_err(|e| ScredisError::RuntimeCreateFailed {
            message: format!("spawning init stage: {e}"),
        })?;
        tracing::debug!(pid = child.id(), ?namespaces, "init stage spawned");

        Ok(NativeContainer {
            child,
            handshake: Some(host_end),
            sync: SyncMessage::default(),
            cgroup: None,
            veth: None,
            ip: self.ip.clone(),
            outcome: None,
        })
    }

    fn attach(&self, container: &mut NativeContainer, spec: &ContainerSpec) -> Result<()> {
        let pid = container.pid();

        let cgroup = CgroupManager::create_under(
            &self.cgroup_root,
            &spec.cgroups.parent,
            &format!("{}-{pid}", spec.cgroups.name),
        )?;
        container.cgroup = Some(cgroup.clone());
        cgroup.add_process(pid)?;

        if let Some(net) = spec.bridged_interface() {
            let (host_if, peer) = veth_names(net, pid);
            let failed = |step: &str, e: std::io::Error| ScredisError::RuntimeCreateFailed {
                message: format!("{step} {host_if}: {e}"),
            };
            self.ip
                .create_veth_pair(&host_if, &peer, net.mtu)
                .map_err(|e| failed("creating veth", e))?;
            container.veth = Some(host_if.clone());
            if let Some(bridge) = &net.bridge {
                self.ip
                    .attach_to_bridge(&host_if, bridge)
                    .map_err(|e| failed("attaching", e))?;
            }
            self.ip
                .set_link_up(&host_if)
                .map_err(|e| failed("bringing up", e))?;
            self.ip
                .move_to_netns(&peer, pid)
                .map_err(|e| failed("moving peer of", e))?;
            tracing::debug!(host = %host_if, peer = %peer, "veth pair plugged in");
            container.sync.peer_interface = Some(peer);
        }
        Ok(())
    }

    fn configure_network(&self, ctx: &InitContext) -> Result<()> {
        let spec = &ctx.spec;
        if !spec.wants_network_namespace() {
            return Ok(());
        }
        let failed = |step: &str, e: std::io::Error| ScredisError::InitFailure {
            message: format!("{step}: {e}"),
        };
        self.ip
            .set_link_up("lo")
            .map_err(|e| failed("bringing up loopback", e))?;

        let (Some(net), Some(peer)) = (spec.bridged_interface(), ctx.sync.peer_interface.as_deref())
        else {
            return Ok(());
        };
        let address = net.address.parse::<Ipv4Network>().map_err(|e| ScredisError::InitFailure {
            message: format!("container address {}: {e}", net.address),
        })?;
        self.ip
            .rename_link(peer, CONTAINER_IFACE)
            .map_err(|e| failed("renaming peer", e))?;
        self.ip
            .add_address(CONTAINER_IFACE, &address)
            .map_err(|e| failed("assigning address", e))?;
        self.ip
            .set_link_up(CONTAINER_IFACE)
            .map_err(|e| failed("bringing up eth0", e))?;
        self.ip
            .add_default_route(&net.gateway)
            .map_err(|e| failed("adding default route", e))?;
        tracing::debug!(address = %net.address, gateway = %net.gateway, "container network up");
        Ok(())
    }
}

impl ContainerRuntime for NativeRuntime {
    fn create(
        &self,
        spec: &ContainerSpec,
        command: &LaunchCommand,
    ) -> Result<Box<dyn RunningContainer>> {
        let mut container = self.spawn(spec, command)?;
        if let Err(e) = self.attach(&mut container, spec) {
            if let Err(cleanup) = Box::new(container).destroy() {
                tracing::warn!(error = %cleanup, "cleanup after failed create");
            }
            return Err(match e {
                e @ ScredisError::RuntimeCreateFailed { .. } => e,
                other => ScredisError::RuntimeCreateFailed {
                    message: other.to_string(),
                },
            });
        }
        Ok(Box::new(container))
    }

    fn init(&self, ctx: &InitContext, handshake: &mut InitHandshake) -> Result<Infallible> {
        let spec = &ctx.spec;
        let namespaces = NamespaceSet::from_spec(&spec.namespaces)?;
        tracing::debug!(console = %ctx.console, "finishing container");

        mount::make_mounts_private()?;
        if namespaces.uts {
            uts::set_hostname(&spec.hostname)?;
        }
        self.configure_network(ctx)?;

        mount::bind_rootfs(&spec.rootfs)?;
        mount::mount_proc(&spec.rootfs, spec.restrict_sys)?;
        mount::apply_mounts(&spec.rootfs, &spec.mount_config.mounts)?;
        mount::populate_dev(&spec.rootfs, &spec.mount_config.device_nodes)?;
        pivot_root::pivot_root(&spec.rootfs)?;

        drop_capabilities(&parse_capabilities(&spec.capabilities)?)?;
        exec_workload(&ctx.argv, &spec.environment, handshake)
    }
}

fn veth_names(net: &NetworkDescriptor, pid: u32) -> (String, String) {
    let prefix = net.veth_prefix.as_deref().unwrap_or(VETH_PREFIX);
    let host = format!("{prefix}{pid}");
    let peer = format!("{host}c");
    (host, peer)
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|s| {
            CString::new(s.as_str()).map_err(|_| ScredisError::InitFailure {
                message: format!("argument contains NUL: {s:?}"),
            })
        })
        .collect()
}

fn exec_workload(
    argv: &[String],
    env: &[String],
    handshake: &mut InitHandshake,
) -> Result<Infallible> {
    let args = to_cstrings(argv)?;
    let env = to_cstrings(env)?;
    let program = args.first().ok_or_else(|| ScredisError::InitFailure {
        message: "workload command is empty".into(),
    })?;
    tracing::info!(argv = ?argv, "executing workload");
    handshake.announce_exec()?;
    nix::unistd::execvpe(program, &args, &env).map_err(|e| ScredisError::InitFailure {
        message: format!("exec {}: {e}", argv.join(" ")),
    })
}

/// A container created by [`NativeRuntime`].
#[derive(Debug)]
struct NativeContainer {
    child: Child,
    handshake: Option<HostHandshake>,
    sync: SyncMessage,
    cgroup: Option<CgroupManager>,
    veth: Option<String>,
    ip: IpCommand,
    outcome: Option<ExitOutcome>,
}

impl RunningContainer for NativeContainer {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn start(&mut self) -> Result<()> {
        let mut handshake = self
            .handshake
            .take()
            .ok_or_else(|| ScredisError::RuntimeStartFailed {
                message: "container already started".into(),
            })?;
        handshake.send(&self.sync)?;
        match handshake.await_ready()? {
            None => {
                tracing::debug!(pid = self.pid(), "init stage handed over to workload");
                Ok(())
            }
            Some(report) => Err(ScredisError::RuntimeStartFailed {
                message: report.error,
            }),
        }
    }

    fn wait(&mut self) -> Result<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let status = self
            .child
            .wait()
            .map_err(|e| ScredisError::io(format!("/proc/{}", self.pid()), e))?;
        let outcome = ExitOutcome::from(status);
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    fn destroy(mut self: Box<Self>) -> Result<()> {
        let mut first_error = None;

        if self.outcome.is_none() {
            let alive = matches!(self.child.try_wait(), Ok(None));
            if alive {
                if let Err(e) = self.signal(Signal::SIGKILL) {
                    tracing::warn!(error = %e, "kill during destroy");
                }
            }
            if let Err(e) = self.wait() {
                first_error = Some(e);
            }
        }

        if let Some(veth) = self.veth.take() {
            // The pair disappears with the network namespace; NotFound is
            // the usual answer here.
            match self.ip.delete_link(&veth) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    let _ = first_error.get_or_insert(ScredisError::RuntimeCreateFailed {
                        message: format!("deleting {veth}: {e}"),
                    });
                }
                _ => {}
            }
        }

        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.destroy() {
                let _ = first_error.get_or_insert(e);
            }
        }

        tracing::debug!(pid = self.pid(), "container destroyed");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scredis_core::spec::NetworkKind;

    fn veth(prefix: Option<&str>) -> NetworkDescriptor {
        NetworkDescriptor {
            address: "10.0.5.2/24".into(),
            bridge: Some("scredis0".into()),
            veth_prefix: prefix.map(Into::into),
            gateway: "10.0.5.1".into(),
            mtu: 1500,
            kind: NetworkKind::Veth,
        }
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let (host, peer) = veth_names(&veth(Some("veth")), 4_194_304);
        assert_eq!(host, "veth4194304");
        assert_eq!(peer, "veth4194304c");
        assert!(peer.len() < 16);
    }

    #[test]
    fn veth_prefix_defaults() {
        let (host, _) = veth_names(&veth(None), 42);
        assert_eq!(host, "veth42");
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(to_cstrings(&["redis-server".into()]).is_ok());
        assert!(to_cstrings(&["bad\0arg".into()]).is_err());
    }

    #[test]
    fn exec_of_empty_argv_fails_without_announcing() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut host = HostHandshake::from_stream(a);
        let mut init = InitHandshake::from_stream(b);
        host.send(&SyncMessage::default()).unwrap();

        assert!(exec_workload(&[], &[], &mut init).is_err());
        drop(init);
        assert!(matches!(
            host.await_ready(),
            Err(ScredisError::RuntimeStartFailed { .. })
        ));
    }
}
