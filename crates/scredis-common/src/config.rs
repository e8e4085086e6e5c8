//! Launcher configuration model.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for a single launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Directory under which per-launch root filesystems are created.
    pub work_dir: PathBuf,
    /// Path to the host-wide IP pool record.
    pub pool_file: PathBuf,
    /// Root filesystem archive extracted for every launch.
    pub rootfs_archive: PathBuf,
    /// Bridge shared by network-isolated containers.
    pub bridge: BridgeSettings,
    /// Parent cgroup of the workload cgroup.
    pub cgroup_parent: String,
    /// Base name of the workload cgroup.
    pub cgroup_name: String,
    /// Hostname presented inside the container.
    pub hostname: String,
    /// Whether sensitive `/proc` entries are remounted read-only.
    pub restrict_sys: bool,
    /// Workload argument vector.
    pub workload: Vec<String>,
}

/// Host bridge and subnet settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Bridge device name.
    pub name: String,
    /// Address assigned to the bridge, in CIDR notation.
    pub cidr: String,
    /// Subnet container addresses are leased from.
    pub subnet: String,
    /// Default gateway inside the container.
    pub gateway: Ipv4Addr,
    /// Prefix of host-side virtual ethernet devices.
    pub veth_prefix: String,
    /// Interface MTU.
    pub mtu: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            name: constants::BRIDGE_NAME.into(),
            cidr: constants::BRIDGE_CIDR.into(),
            subnet: constants::BRIDGE_SUBNET.into(),
            gateway: Ipv4Addr::new(10, 0, 5, 1),
            veth_prefix: constants::VETH_PREFIX.into(),
            mtu: constants::DEFAULT_MTU,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(constants::DEFAULT_WORK_DIR),
            pool_file: PathBuf::from(constants::DEFAULT_POOL_FILE),
            rootfs_archive: PathBuf::from(constants::DEFAULT_ROOTFS_ARCHIVE),
            bridge: BridgeSettings::default(),
            cgroup_parent: constants::CGROUP_PARENT.into(),
            cgroup_name: constants::CGROUP_NAME.into(),
            hostname: constants::CONTAINER_HOSTNAME.into(),
            restrict_sys: true,
            workload: vec![
                constants::WORKLOAD_BINARY.into(),
                constants::WORKLOAD_CONFIG_PATH.into(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_matches_constant() {
        let cfg = BridgeSettings::default();
        assert_eq!(cfg.gateway.to_string(), constants::BRIDGE_GATEWAY);
    }

    #[test]
    fn default_workload_reads_config_file() {
        let cfg = LauncherConfig::default();
        assert_eq!(cfg.workload, vec!["redis-server", "/etc/redis.conf"]);
        assert!(cfg.restrict_sys);
    }

    #[test]
    fn config_survives_json() {
        let cfg = LauncherConfig::default();
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: LauncherConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, cfg);
    }
}
