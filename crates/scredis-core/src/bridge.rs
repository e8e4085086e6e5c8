//! Host bridge provisioning.
//!
//! All network-isolated containers hang off one shared layer-2 bridge.
//! Provisioning is idempotent: an existing bridge or an already assigned
//! address counts as success, so any number of launches may race on it.

use std::io;
use std::path::PathBuf;
use std::process::Command;

use ipnetwork::Ipv4Network;
use scredis_common::error::{Result, ScredisError};

/// Kernel switch for IPv4 forwarding.
const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Searched when `ip` is not on `PATH`, which is the case in the init stage
/// where the environment is the container's.
const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host networking operations needed to bring the bridge up.
///
/// Implementations report an object that is already present with
/// [`io::ErrorKind::AlreadyExists`].
pub trait HostNetwork {
    /// Enables IPv4 forwarding in the host networking stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel setting cannot be written.
    fn enable_ipv4_forwarding(&self) -> io::Result<()>;

    /// Creates a bridge device named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if the device exists.
    fn create_bridge(&self, name: &str) -> io::Result<()>;

    /// Assigns `cidr` to the link `name`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if the address is assigned.
    fn add_address(&self, name: &str, cidr: &Ipv4Network) -> io::Result<()>;

    /// Sets the link `name` administratively up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or cannot be changed.
    fn set_link_up(&self, name: &str) -> io::Result<()>;
}

/// Ensures the shared bridge exists and is configured.
#[derive(Debug)]
pub struct BridgeProvisioner<N> {
    net: N,
}

impl<N: HostNetwork> BridgeProvisioner<N> {
    /// Creates a provisioner driving the given host network backend.
    pub const fn new(net: N) -> Self {
        Self { net }
    }

    /// Returns the host network backend.
    pub const fn network(&self) -> &N {
        &self.net
    }

    /// Enables forwarding, creates the bridge if absent, assigns `cidr`,
    /// and brings the link up.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::BridgeSetupFailed`] naming the step that
    /// failed for anything other than "already exists".
    pub fn ensure_bridge(&self, name: &str, cidr: &Ipv4Network) -> Result<()> {
        self.net
            .enable_ipv4_forwarding()
            .map_err(|e| setup_failed("enabling ipv4 forwarding", &e))?;

        tolerate_existing(self.net.create_bridge(name))
            .map_err(|e| setup_failed("creating bridge", &e))?;

        tolerate_existing(self.net.add_address(name, cidr))
            .map_err(|e| setup_failed("assigning bridge address", &e))?;

        self.net
            .set_link_up(name)
            .map_err(|e| setup_failed("bringing bridge up", &e))?;

        tracing::info!("{}", bridge_info(name, cidr));
        Ok(())
    }
}

/// Human-readable bridge summary, including how to remove it by hand.
#[must_use]
pub fn bridge_info(name: &str, cidr: &Ipv4Network) -> String {
    format!("bridge {name} up {cidr} (delete: `ip link delete {name} type bridge`)")
}

fn tolerate_existing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

fn setup_failed(step: &'static str, err: &io::Error) -> ScredisError {
    ScredisError::BridgeSetupFailed {
        step,
        message: err.to_string(),
    }
}

/// [`HostNetwork`] backed by the `ip(8)` utility.
///
/// Also provides the virtual ethernet plumbing used by the native runtime.
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: PathBuf,
}

impl IpCommand {
    /// Locates `ip` on `PATH`, falling back to the usual system directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be found.
    pub fn locate() -> Result<Self> {
        let binary = which::which("ip")
            .or_else(|_| which::which_in("ip", Some(SYSTEM_PATH), "/"))
            .map_err(|e| ScredisError::Config {
                message: format!("ip(8) not found: {e}"),
            })?;
        Ok(Self { binary })
    }

    /// Uses the `ip` binary at `binary`.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Creates a veth pair with `host` and `peer` ends.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails.
    pub fn create_veth_pair(&self, host: &str, peer: &str, mtu: u32) -> io::Result<()> {
        let mtu = mtu.to_string();
        self.run(&[
            "link", "add", "name", host, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu",
            &mtu,
        ])
    }

    /// Enslaves `iface` to `bridge`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails.
    pub fn attach_to_bridge(&self, iface: &str, bridge: &str) -> io::Result<()> {
        self.run(&["link", "set", iface, "master", bridge])
    }

    /// Moves `iface` into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails.
    pub fn move_to_netns(&self, iface: &str, pid: u32) -> io::Result<()> {
        self.run(&["link", "set", iface, "netns", &pid.to_string()])
    }

    /// Renames the link `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails.
    pub fn rename_link(&self, from: &str, to: &str) -> io::Result<()> {
        self.run(&["link", "set", from, "name", to])
    }

    /// Installs a default route via `gateway`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails.
    pub fn add_default_route(&self, gateway: &str) -> io::Result<()> {
        self.run(&["route", "add", "default", "via", gateway])
    }

    /// Deletes the link `name`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotFound`] if the link is already gone.
    pub fn delete_link(&self, name: &str) -> io::Result<()> {
        self.run(&["link", "delete", name])
    }

    fn run(&self, args: &[&str]) -> io::Result<()> {
        tracing::debug!(cmd = ?args, "ip");
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_ip_error(stderr))
    }
}

impl HostNetwork for IpCommand {
    fn enable_ipv4_forwarding(&self) -> io::Result<()> {
        std::fs::write(IP_FORWARD_PATH, b"1\n")
    }

    fn create_bridge(&self, name: &str) -> io::Result<()> {
        self.run(&["link", "add", "name", name, "type", "bridge"])
    }

    fn add_address(&self, name: &str, cidr: &Ipv4Network) -> io::Result<()> {
        self.run(&["addr", "add", &cidr.to_string(), "dev", name])
    }

    fn set_link_up(&self, name: &str) -> io::Result<()> {
        self.run(&["link", "set", name, "up"])
    }
}

/// Maps `ip` diagnostics onto error kinds callers can match on.
fn classify_ip_error(stderr: String) -> io::Error {
    let kind = if stderr.contains("File exists") || stderr.contains("already assigned") {
        io::ErrorKind::AlreadyExists
    } else if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
        io::ErrorKind::NotFound
    } else if stderr.contains("Operation not permitted") {
        io::ErrorKind::PermissionDenied
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, stderr)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct HostState {
        forwarding: bool,
        bridges: BTreeSet<String>,
        addresses: BTreeSet<(String, String)>,
        up: BTreeSet<String>,
    }

    #[derive(Debug, Default)]
    struct FakeHost {
        state: Mutex<HostState>,
        refuse_up: bool,
    }

    impl FakeHost {
        fn snapshot(&self) -> HostState {
            self.state.lock().unwrap().clone()
        }
    }

    impl HostNetwork for FakeHost {
        fn enable_ipv4_forwarding(&self) -> io::Result<()> {
            self.state.lock().unwrap().forwarding = true;
            Ok(())
        }

        fn create_bridge(&self, name: &str) -> io::Result<()> {
            if self.state.lock().unwrap().bridges.insert(name.into()) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::AlreadyExists, "File exists"))
            }
        }

        fn add_address(&self, name: &str, cidr: &Ipv4Network) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.bridges.contains(name) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "Cannot find device"));
            }
            if state.addresses.insert((name.into(), cidr.to_string())) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::AlreadyExists, "File exists"))
            }
        }

        fn set_link_up(&self, name: &str) -> io::Result<()> {
            if self.refuse_up {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
            }
            let _ = self.state.lock().unwrap().up.insert(name.into());
            Ok(())
        }
    }

    fn cidr() -> Ipv4Network {
        "10.0.5.1/24".parse().unwrap()
    }

    #[test]
    fn ensure_bridge_configures_everything() {
        let provisioner = BridgeProvisioner::new(FakeHost::default());
        provisioner.ensure_bridge("scredis0", &cidr()).unwrap();

        let state = provisioner.network().snapshot();
        assert!(state.forwarding);
        assert!(state.bridges.contains("scredis0"));
        assert!(state.addresses.contains(&("scredis0".into(), "10.0.5.1/24".into())));
        assert!(state.up.contains("scredis0"));
    }

    #[test]
    fn second_ensure_is_a_noop() {
        let provisioner = BridgeProvisioner::new(FakeHost::default());
        provisioner.ensure_bridge("scredis0", &cidr()).unwrap();
        let first = provisioner.network().snapshot();
        provisioner.ensure_bridge("scredis0", &cidr()).unwrap();
        assert_eq!(provisioner.network().snapshot(), first);
    }

    #[test]
    fn unexpected_failure_names_the_step() {
        let provisioner = BridgeProvisioner::new(FakeHost {
            refuse_up: true,
            ..FakeHost::default()
        });
        let err = provisioner.ensure_bridge("scredis0", &cidr()).unwrap_err();
        assert!(matches!(
            err,
            ScredisError::BridgeSetupFailed {
                step: "bringing bridge up",
                ..
            }
        ));
    }

    #[test]
    fn ip_errors_are_classified() {
        let exists = classify_ip_error("RTNETLINK answers: File exists".into());
        assert_eq!(exists.kind(), io::ErrorKind::AlreadyExists);
        let missing = classify_ip_error("Cannot find device \"veth9\"".into());
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
        let other = classify_ip_error("Error: argument is wrong".into());
        assert_eq!(other.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn bridge_info_mentions_delete_command() {
        let info = bridge_info("scredis0", &cidr());
        assert!(info.contains("10.0.5.1/24"));
        assert!(info.contains("ip link delete scredis0 type bridge"));
    }
}
