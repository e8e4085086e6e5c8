//! System-wide constants and default paths.

/// Binary name for the CLI, also the prefix of its diagnostics.
pub const BIN_NAME: &str = "sc-redis";

/// Hidden subcommand the launcher re-executes itself with inside the
/// freshly created namespaces.
pub const INIT_SUBCOMMAND: &str = "init";

/// Default directory under which per-launch root filesystems are created.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/scredis";

/// Default location of the bundled root filesystem archive.
pub const DEFAULT_ROOTFS_ARCHIVE: &str = "/usr/share/scredis/redis_rootfs.tar";

/// Default location of the host-wide IP pool record.
pub const DEFAULT_POOL_FILE: &str = "/etc/scredis_ips.json";

/// Prefix of every per-launch root filesystem directory.
pub const ROOTFS_DIR_PREFIX: &str = "sc-redis-";

/// Name of the container specification file inside the root filesystem.
pub const SPEC_FILE_NAME: &str = "container.json";

/// Name of the host bridge shared by all containers.
pub const BRIDGE_NAME: &str = "scredis0";

/// Address and prefix assigned to the bridge. The host part is the gateway.
pub const BRIDGE_CIDR: &str = "10.0.5.1/24";

/// Managed private subnet that container addresses are leased from.
pub const BRIDGE_SUBNET: &str = "10.0.5.0/24";

/// Gateway address handed to containers.
pub const BRIDGE_GATEWAY: &str = "10.0.5.1";

/// Prefix used for the host side of each virtual ethernet pair.
pub const VETH_PREFIX: &str = "veth";

/// MTU of container interfaces.
pub const DEFAULT_MTU: u32 = 1500;

/// Lowest leasable host identifier (`.0` is the network, `.1` the gateway).
pub const LEASE_MIN: u8 = 2;

/// Highest leasable host identifier (`.255` is broadcast).
pub const LEASE_MAX: u8 = 254;

/// Number of slots in the IP pool.
pub const POOL_SLOTS: usize = (LEASE_MAX - LEASE_MIN) as usize + 1;

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent cgroup every workload cgroup is created under.
pub const CGROUP_PARENT: &str = "sc-redis";

/// Base name of the workload cgroup.
pub const CGROUP_NAME: &str = "redis";

/// Hostname presented inside the container.
pub const CONTAINER_HOSTNAME: &str = "redis";

/// User the workload runs as.
pub const CONTAINER_USER: &str = "root";

/// Workload binary started inside the container.
pub const WORKLOAD_BINARY: &str = "redis-server";

/// Workload configuration file, relative to the container root.
pub const WORKLOAD_CONFIG_PATH: &str = "/etc/redis.conf";

/// Environment variable carrying the console device path to stage 1.
pub const ENV_CONSOLE: &str = "SCREDIS_CONSOLE";

/// Environment variable carrying the handshake descriptor number to stage 1.
pub const ENV_HANDSHAKE_FD: &str = "SCREDIS_HANDSHAKE_FD";

/// Environment variable carrying the absolute root filesystem path to stage 1.
pub const ENV_ROOTFS: &str = "SCREDIS_ROOTFS";

/// Descriptor number the handshake socket is installed at in stage 1.
pub const HANDSHAKE_FD: i32 = 3;
