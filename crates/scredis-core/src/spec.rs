//! Declarative container specification.
//!
//! [`build`] assembles the document the container runtime consumes;
//! [`write_spec`] and [`load_spec`] move it through `container.json` in the
//! root filesystem, which is the only channel the host stage and the init
//! stage share besides the handshake.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use scredis_common::constants::{CONTAINER_USER, SPEC_FILE_NAME};
use scredis_common::error::{Result, ScredisError};
use scredis_common::types::LeaseId;
use serde::{Deserialize, Serialize};

/// Device type code of a character device (`'c'`).
pub const CHAR_DEVICE: u8 = b'c';

/// Device type code of a block device (`'b'`).
pub const BLOCK_DEVICE: u8 = b'b';

/// Wildcard major/minor number.
pub const ANY: i64 = -1;

/// Capabilities retained by the workload.
pub const CAPABILITIES: [&str; 12] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "MKNOD",
    "NET_RAW",
    "SETGID",
    "SETUID",
    "SETFCAP",
    "SETPCAP",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "KILL",
];

/// Namespace keys understood by the runtime.
pub mod ns {
    /// IPC namespace.
    pub const IPC: &str = "NEWIPC";
    /// Mount namespace.
    pub const MOUNT: &str = "NEWNS";
    /// PID namespace.
    pub const PID: &str = "NEWPID";
    /// UTS namespace.
    pub const UTS: &str = "NEWUTS";
    /// Network namespace.
    pub const NET: &str = "NEWNET";
}

/// Complete container specification, serialized as `container.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Capability names retained in the container.
    pub capabilities: Vec<String>,
    /// Cgroup placement and device allow-list.
    pub cgroups: CgroupSpec,
    /// Whether sensitive `/proc` entries are remounted read-only.
    pub restrict_sys: bool,
    /// Mounts and device nodes materialized inside the container.
    pub mount_config: MountConfig,
    /// Workload environment as `KEY=VALUE` strings.
    pub environment: Vec<String>,
    /// Container hostname.
    pub hostname: String,
    /// Namespaces to create.
    pub namespaces: BTreeMap<String, bool>,
    /// Network interfaces; absent when the host network is shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<NetworkDescriptor>>,
    /// Whether a terminal is allocated.
    pub tty: bool,
    /// User the workload runs as.
    pub user: String,
    /// Absolute path of the root filesystem.
    pub rootfs: PathBuf,
    /// Workload argument vector.
    pub args: Vec<String>,
}

impl ContainerSpec {
    /// Returns whether the spec asks for a private network namespace.
    #[must_use]
    pub fn wants_network_namespace(&self) -> bool {
        self.namespaces.get(ns::NET).copied().unwrap_or(false)
    }

    /// Returns the bridged interface, if any.
    #[must_use]
    pub fn bridged_interface(&self) -> Option<&NetworkDescriptor> {
        self.networks
            .as_deref()
            .and_then(|nets| nets.iter().find(|n| n.kind == NetworkKind::Veth))
    }
}

/// Cgroup section of the spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Cgroup name.
    pub name: String,
    /// Parent cgroup.
    pub parent: String,
    /// Devices the workload may access.
    pub allowed_devices: Vec<DeviceRule>,
}

/// A device permission, or a device node to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Cgroup access string (`r`, `w`, `m` combination).
    pub cgroup_permissions: String,
    /// Major number, `-1` for any.
    pub major_number: i64,
    /// Minor number, `-1` for any.
    #[serde(default)]
    pub minor_number: i64,
    /// [`CHAR_DEVICE`] or [`BLOCK_DEVICE`].
    #[serde(rename = "type")]
    pub kind: u8,
    /// Node path inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Node permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
}

impl DeviceRule {
    const fn wildcard(kind: u8) -> Self {
        Self {
            cgroup_permissions: String::new(),
            major_number: ANY,
            minor_number: ANY,
            kind,
            path: None,
            file_mode: None,
        }
    }

    fn char_dev(major: i64, minor: i64) -> Self {
        Self {
            cgroup_permissions: "rwm".into(),
            major_number: major,
            minor_number: minor,
            kind: CHAR_DEVICE,
            path: None,
            file_mode: None,
        }
    }

    fn at(mut self, path: &str) -> Self {
        self.path = Some(path.into());
        self
    }

    const fn mode(mut self, mode: u32) -> Self {
        self.file_mode = Some(mode);
        self
    }
}

/// Mount section of the spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Device nodes created under `/dev`.
    pub device_nodes: Vec<DeviceRule>,
    /// Additional mounts.
    pub mounts: Vec<MountSpec>,
}

/// A filesystem mount inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Filesystem type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Mount point inside the container.
    pub destination: String,
}

/// Network interface kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// The container's own loopback.
    Loopback,
    /// One end of a veth pair attached to the host bridge.
    Veth,
}

/// One interface of a network-isolated container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// Address in CIDR notation.
    pub address: String,
    /// Bridge the host end is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Prefix of the host-side device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veth_prefix: Option<String>,
    /// Gateway address.
    pub gateway: String,
    /// Interface MTU.
    pub mtu: u32,
    /// Interface kind.
    #[serde(rename = "type")]
    pub kind: NetworkKind,
}

/// Network settings for an isolated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Leased container address.
    pub address: Ipv4Addr,
    /// Prefix length of the managed subnet.
    pub prefix: u8,
    /// Host bridge name.
    pub bridge: String,
    /// Prefix of the host-side veth name.
    pub veth_prefix: String,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Interface MTU.
    pub mtu: u32,
}

/// Inputs of [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecOptions {
    /// Container hostname.
    pub hostname: String,
    /// Remount sensitive `/proc` entries read-only.
    pub restrict_sys: bool,
    /// Cgroup name.
    pub cgroup_name: String,
    /// Parent cgroup.
    pub cgroup_parent: String,
    /// Workload environment.
    pub environment: Vec<String>,
    /// Network isolation settings; `None` shares the host network.
    pub network: Option<NetworkOptions>,
    /// Absolute root filesystem path.
    pub rootfs: PathBuf,
    /// Workload argument vector.
    pub args: Vec<String>,
}

/// Default workload environment for a container named `hostname`.
#[must_use]
pub fn default_environment(hostname: &str) -> Vec<String> {
    vec![
        "HOME=/".into(),
        "PATH=/usr/local/bin".into(),
        format!("HOSTNAME={hostname}"),
        "TERM=xterm".into(),
    ]
}

/// Device nodes materialized inside every container.
#[must_use]
pub fn device_nodes() -> Vec<DeviceRule> {
    vec![
        DeviceRule::char_dev(1, 3).at("/dev/null").mode(0o666),
        DeviceRule::char_dev(1, 5).at("/dev/zero").mode(0o666),
        DeviceRule::char_dev(1, 7).at("/dev/full").mode(0o666),
        DeviceRule::char_dev(5, 0).at("/dev/tty").mode(0o666),
        DeviceRule::char_dev(1, 9).at("/dev/urandom").mode(0o666),
        DeviceRule::char_dev(1, 8).at("/dev/random").mode(0o666),
    ]
}

/// Cgroup device allow-list shared by every container.
#[must_use]
pub fn allowed_devices() -> Vec<DeviceRule> {
    let mut mknod_any_char = DeviceRule::wildcard(CHAR_DEVICE);
    mknod_any_char.cgroup_permissions = "m".into();
    let mut mknod_any_block = DeviceRule::wildcard(BLOCK_DEVICE);
    mknod_any_block.cgroup_permissions = "m".into();

    let mut rules = vec![
        mknod_any_char,
        mknod_any_block,
        DeviceRule::char_dev(5, 1).at("/dev/console"),
        DeviceRule::char_dev(4, 0).at("/dev/tty0"),
        DeviceRule::char_dev(4, 1).at("/dev/tty1"),
        DeviceRule::char_dev(136, ANY),
        DeviceRule::char_dev(5, 2),
        DeviceRule::char_dev(10, 200),
    ];
    rules.extend(device_nodes());
    rules
}

/// Assembles a container specification.
///
/// The network block and the `NEWNET` namespace are present if and only if
/// `options.network` is set.
#[must_use]
pub fn build(options: &SpecOptions) -> ContainerSpec {
    let mut namespaces = BTreeMap::new();
    for key in [ns::IPC, ns::MOUNT, ns::PID, ns::UTS] {
        let _ = namespaces.insert(key.to_string(), true);
    }

    let networks = options.network.as_ref().map(|net| {
        let _ = namespaces.insert(ns::NET.to_string(), true);
        vec![
            NetworkDescriptor {
                address: "127.0.0.1/0".into(),
                bridge: None,
                veth_prefix: None,
                gateway: "localhost".into(),
                mtu: net.mtu,
                kind: NetworkKind::Loopback,
            },
            NetworkDescriptor {
                address: format!("{}/{}", net.address, net.prefix),
                bridge: Some(net.bridge.clone()),
                veth_prefix: Some(net.veth_prefix.clone()),
                gateway: net.gateway.to_string(),
                mtu: net.mtu,
                kind: NetworkKind::Veth,
            },
        ]
    });

    ContainerSpec {
        capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
        cgroups: CgroupSpec {
            name: options.cgroup_name.clone(),
            parent: options.cgroup_parent.clone(),
            allowed_devices: allowed_devices(),
        },
        restrict_sys: options.restrict_sys,
        mount_config: MountConfig {
            device_nodes: device_nodes(),
            mounts: vec![MountSpec {
                kind: "tmpfs".into(),
                destination: "/tmp".into(),
            }],
        },
        environment: options.environment.clone(),
        hostname: options.hostname.clone(),
        namespaces,
        networks,
        tty: false,
        user: CONTAINER_USER.into(),
        rootfs: options.rootfs.clone(),
        args: options.args.clone(),
    }
}

/// Validates a user-supplied container address against `subnet`.
///
/// Accepts dotted-quad IPv4 addresses inside the subnet whose host part is
/// a leasable id.
///
/// # Errors
///
/// Returns [`ScredisError::InvalidAddress`] for malformed input, addresses
/// outside the subnet, and reserved host ids.
pub fn validate(address: &str, subnet: &Ipv4Network) -> Result<LeaseId> {
    let invalid = |reason: String| ScredisError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let ip: Ipv4Addr = address
        .trim()
        .parse()
        .map_err(|_| invalid("not an IPv4 address".into()))?;
    if !subnet.contains(ip) {
        return Err(invalid(format!("not inside {subnet}")));
    }
    let [.., host] = ip.octets();
    LeaseId::new(u32::from(host)).map_err(|_| invalid("reserved host id".into()))
}

/// Returns the path of the spec file inside `rootfs`.
#[must_use]
pub fn spec_path(rootfs: &Path) -> PathBuf {
    rootfs.join(SPEC_FILE_NAME)
}

/// Serializes `spec` into `rootfs/container.json`.
///
/// # Errors
///
/// Returns [`ScredisError::SpecWriteFailed`] if serialization or the write
/// fails.
pub fn write_spec(spec: &ContainerSpec, rootfs: &Path) -> Result<PathBuf> {
    let path = spec_path(rootfs);
    let failed = |message: String| ScredisError::SpecWriteFailed {
        path: path.clone(),
        message,
    };
    let raw = serde_json::to_vec_pretty(spec).map_err(|e| failed(e.to_string()))?;
    std::fs::write(&path, raw).map_err(|e| failed(e.to_string()))?;
    tracing::debug!(path = %path.display(), "container spec written");
    Ok(path)
}

/// Reads the spec back from `rootfs/container.json`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_spec(rootfs: &Path) -> Result<ContainerSpec> {
    let path = spec_path(rootfs);
    let raw = std::fs::read(&path).map_err(|e| ScredisError::io(&path, e))?;
    Ok(serde_json::from_slice(&raw)?)
}
