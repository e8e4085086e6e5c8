//! Ordered release of everything a launch acquired.
//!
//! Resources are pushed as they are acquired and released newest first by
//! a single [`Rollback::unwind`], which serves failure paths and normal
//! exit alike. Nothing is skipped because an earlier release failed.

use std::fmt;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use scredis_common::error::Result;
use scredis_common::types::IpLease;
use scredis_core::bridge::bridge_info;
use scredis_core::ippool::IpPool;
use scredis_core::rootfs::remove_rootfs;

use crate::runtime::RunningContainer;

/// A resource held by an in-flight launch.
pub enum Resource {
    /// Per-launch root filesystem directory.
    WorkDir(PathBuf),
    /// The shared bridge. Never deleted; release only logs how to.
    Bridge {
        /// Bridge device name.
        name: String,
        /// Address assigned to it.
        cidr: Ipv4Network,
    },
    /// An address lease.
    Lease {
        /// Pool the lease came from.
        pool: IpPool,
        /// The lease itself.
        lease: IpLease,
    },
    /// A created container.
    Container(Box<dyn RunningContainer>),
}

impl Resource {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkDir(_) => "work-dir",
            Self::Bridge { .. } => "bridge",
            Self::Lease { .. } => "lease",
            Self::Container(_) => "container",
        }
    }

    fn release(self) -> Result<()> {
        match self {
            Self::WorkDir(path) => remove_rootfs(&path),
            Self::Bridge { name, cidr } => {
                tracing::info!("leaving shared {}", bridge_info(&name, &cidr));
                Ok(())
            }
            Self::Lease { pool, lease } => pool.release(lease.id),
            Self::Container(container) => container.destroy(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkDir(path) => f.debug_tuple("WorkDir").field(path).finish(),
            Self::Bridge { name, cidr } => f
                .debug_struct("Bridge")
                .field("name", name)
                .field("cidr", cidr)
                .finish(),
            Self::Lease { lease, .. } => f.debug_struct("Lease").field("lease", lease).finish(),
            Self::Container(c) => f.debug_struct("Container").field("pid", &c.pid()).finish(),
        }
    }
}

/// Outcome of an unwind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Resources released without error.
    pub released: usize,
    /// Rendered failures, in release order.
    pub failures: Vec<String>,
}

impl TeardownReport {
    /// Whether every release succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stack of acquired resources.
#[derive(Debug, Default)]
pub struct Rollback {
    resources: Vec<Resource>,
}

impl Rollback {
    /// Creates an empty rollback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly acquired resource.
    pub fn push(&mut self, resource: Resource) {
        tracing::debug!(kind = resource.kind(), "resource acquired");
        self.resources.push(resource);
    }

    /// Number of resources still held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Kinds of the held resources, oldest first.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.resources.iter().map(Resource::kind).collect()
    }

    /// The most recently registered container.
    pub fn container_mut(&mut self) -> Option<&mut (dyn RunningContainer + 'static)> {
        self.resources.iter_mut().rev().find_map(|r| match r {
            Resource::Container(c) => Some(c.as_mut()),
            _ => None,
        })
    }

    /// Releases everything, newest first, continuing past failures.
    pub fn unwind(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(resource) = self.resources.pop() {
            let kind = resource.kind();
            match resource.release() {
                Ok(()) => {
                    tracing::debug!(kind, "resource released");
                    report.released += 1;
                }
                Err(e) => {
                    tracing::error!(kind, error = %e, "teardown step failed");
                    report.failures.push(format!("{kind}: {e}"));
                }
            }
        }
        report
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            tracing::warn!(held = self.resources.len(), "rollback dropped with live resources");
            let _ = self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use scredis_common::error::ScredisError;

    use super::*;
    use crate::runtime::ExitOutcome;

    #[derive(Debug)]
    struct Probe {
        log: Arc<Mutex<Vec<String>>>,
        fail_destroy: bool,
    }

    impl RunningContainer for Probe {
        fn pid(&self) -> u32 {
            1
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn wait(&mut self) -> Result<ExitOutcome> {
            Ok(ExitOutcome::Exited(0))
        }

        fn destroy(self: Box<Self>) -> Result<()> {
            self.log.lock().unwrap().push("destroy".into());
            if self.fail_destroy {
                return Err(ScredisError::Config {
                    message: "stuck".into(),
                });
            }
            Ok(())
        }
    }

    fn fixture(fail_destroy: bool) -> (tempfile::TempDir, Rollback, Arc<Mutex<Vec<String>>>, IpPool) {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("sc-redis-test");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        let pool = IpPool::open(dir.path().join("ips.json"));
        let lease = pool.allocate().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut rollback = Rollback::new();
        rollback.push(Resource::WorkDir(rootfs));
        rollback.push(Resource::Bridge {
            name: "scredis0".into(),
            cidr: "10.0.5.1/24".parse().unwrap(),
        });
        rollback.push(Resource::Lease {
            pool: pool.clone(),
            lease,
        });
        rollback.push(Resource::Container(Box::new(Probe {
            log: Arc::clone(&log),
            fail_destroy,
        })));
        (dir, rollback, log, pool)
    }

    #[test]
    fn unwind_releases_everything() {
        let (dir, mut rollback, log, pool) = fixture(false);
        assert_eq!(rollback.kinds(), ["work-dir", "bridge", "lease", "container"]);

        let report = rollback.unwind();
        assert!(report.is_clean());
        assert_eq!(report.released, 4);
        assert!(rollback.is_empty());
        assert_eq!(*log.lock().unwrap(), ["destroy"]);
        assert!(pool.outstanding().unwrap().is_empty());
        assert!(!dir.path().join("sc-redis-test").exists());
    }

    #[test]
    fn failures_do_not_stop_the_unwind() {
        let (dir, mut rollback, _log, pool) = fixture(true);
        let report = rollback.unwind();
        assert_eq!(report.released, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("container"));
        assert!(pool.outstanding().unwrap().is_empty());
        assert!(!dir.path().join("sc-redis-test").exists());
    }

    #[test]
    fn drop_unwinds_leftovers() {
        let (_dir, rollback, log, pool) = fixture(false);
        drop(rollback);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(pool.outstanding().unwrap().is_empty());
    }

    #[test]
    fn container_mut_finds_latest_container() {
        let (_dir, mut rollback, _log, _pool) = fixture(false);
        let container = rollback.container_mut().unwrap();
        assert_eq!(container.pid(), 1);
        assert_eq!(container.wait().unwrap(), ExitOutcome::Exited(0));
    }
}
