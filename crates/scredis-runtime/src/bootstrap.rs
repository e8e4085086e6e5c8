//! Host-stage launch orchestration.
//!
//! [`BootstrapOrchestrator::launch`] walks one launch through
//! `preparing → network-ready → spec-ready → runtime-created → running →
//! exited`, registering every acquired resource with a [`Rollback`] that is
//! unwound exactly once, whether the launch failed or the workload exited.

use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use scredis_common::config::LauncherConfig;
use scredis_common::error::{Result, ScredisError};
use scredis_common::types::{IpLease, LaunchStage, LeaseId};
use scredis_core::bridge::{BridgeProvisioner, HostNetwork};
use scredis_core::ippool::IpPool;
use scredis_core::rootfs::{self, RootfsExporter};
use scredis_core::spec::{self, NetworkOptions, SpecOptions};
use thiserror::Error;

use crate::relay::SignalRelay;
use crate::rollback::{Resource, Rollback, TeardownReport};
use crate::runtime::{ContainerRuntime, ExitOutcome, LaunchCommand};

/// Which network the container gets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AddressRequest {
    /// Share the host network namespace.
    #[default]
    HostNetwork,
    /// Isolate and lease exactly this address.
    Specific(String),
    /// Isolate and lease the lowest free address.
    Automatic,
}

/// Parameters of one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Network selection.
    pub address: AddressRequest,
    /// Workload configuration directives written into the rootfs.
    pub config_override: Option<String>,
}

/// Result of a launch whose workload ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// How the workload ended.
    pub outcome: ExitOutcome,
    /// Exit code for the launcher, forced to 1 if a clean exit was
    /// followed by a failed teardown.
    pub exit_code: i32,
    /// What the teardown released.
    pub teardown: TeardownReport,
    /// Address lease, when isolated.
    pub lease: Option<IpLease>,
    /// Root filesystem the container ran from (removed by now).
    pub rootfs: PathBuf,
}

/// A launch that never got its workload running to completion.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct LaunchFailure {
    /// Stage being worked on when the error occurred.
    pub stage: LaunchStage,
    /// Underlying cause.
    #[source]
    pub source: ScredisError,
    /// What the rollback released.
    pub teardown: TeardownReport,
}

impl LaunchFailure {
    /// Exit code for the launcher.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }
}

struct Finished {
    outcome: ExitOutcome,
    lease: Option<IpLease>,
    rootfs: PathBuf,
}

type StageResult<T> = std::result::Result<T, (LaunchStage, ScredisError)>;

fn at<T>(stage: LaunchStage, result: Result<T>) -> StageResult<T> {
    result.map_err(|e| (stage, e))
}

/// Drives the host stage of a launch.
#[derive(Debug)]
pub struct BootstrapOrchestrator<R, N> {
    config: LauncherConfig,
    runtime: R,
    bridge: BridgeProvisioner<N>,
    pool: IpPool,
    exporter: RootfsExporter,
    forward_signals: bool,
    stage: LaunchStage,
}

impl<R: ContainerRuntime, N: HostNetwork> BootstrapOrchestrator<R, N> {
    /// Creates an orchestrator using `runtime` for containers and `net`
    /// for bridge provisioning.
    pub fn new(config: LauncherConfig, runtime: R, net: N) -> Self {
        let pool = IpPool::open(&config.pool_file);
        let exporter = RootfsExporter::new(&config.rootfs_archive);
        Self {
            config,
            runtime,
            bridge: BridgeProvisioner::new(net),
            pool,
            exporter,
            forward_signals: true,
            stage: LaunchStage::Preparing,
        }
    }

    /// Enables or disables host signal forwarding (on by default).
    #[must_use]
    pub const fn forward_signals(mut self, enabled: bool) -> Self {
        self.forward_signals = enabled;
        self
    }

    /// Last stage reached.
    #[must_use]
    pub const fn stage(&self) -> LaunchStage {
        self.stage
    }

    /// Container runtime in use.
    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Address pool in use.
    pub const fn pool(&self) -> &IpPool {
        &self.pool
    }

    /// Runs one launch to completion.
    ///
    /// An explicitly requested address is validated before anything is
    /// acquired. Everything acquired afterwards is released before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns a [`LaunchFailure`] naming the stage if any step before the
    /// workload's exit fails.
    pub fn launch(
        &mut self,
        request: &LaunchRequest,
    ) -> std::result::Result<LaunchReport, LaunchFailure> {
        self.stage = LaunchStage::Preparing;
        tracing::info!(stage = %self.stage, "launch stage");

        let mut rollback = Rollback::new();
        let result = self.run(request, &mut rollback);
        let teardown = rollback.unwind();

        match result {
            Ok(finished) => {
                let mut exit_code = finished.outcome.exit_code();
                if !teardown.is_clean() && exit_code == 0 {
                    tracing::warn!(failures = teardown.failures.len(), "teardown incomplete");
                    exit_code = 1;
                }
                tracing::info!(exit_code, released = teardown.released, "launch finished");
                Ok(LaunchReport {
                    outcome: finished.outcome,
                    exit_code,
                    teardown,
                    lease: finished.lease,
                    rootfs: finished.rootfs,
                })
            }
            Err((stage, source)) => {
                self.transition(LaunchStage::Failed);
                tracing::error!(%stage, error = %source, "launch failed");
                Err(LaunchFailure {
                    stage,
                    source,
                    teardown,
                })
            }
        }
    }

    fn transition(&mut self, next: LaunchStage) {
        if self.stage.is_terminal() {
            return;
        }
        self.stage = next;
        tracing::info!(stage = %next, "launch stage");
    }

    fn run(&mut self, request: &LaunchRequest, rollback: &mut Rollback) -> StageResult<Finished> {
        use LaunchStage::{NetworkReady, Preparing, Running, RuntimeCreated, SpecReady};

        let bridge = &self.config.bridge;
        let subnet = at(Preparing, parse_network(&bridge.subnet))?;
        let cidr = at(Preparing, parse_network(&bridge.cidr))?;
        let requested = match &request.address {
            AddressRequest::Specific(address) => {
                Some(at(Preparing, spec::validate(address, &subnet))?)
            }
            AddressRequest::HostNetwork | AddressRequest::Automatic => None,
        };

        // Armed before the first acquisition; signals caught during setup
        // are held and reach the workload once it runs.
        let relay = if self.forward_signals {
            Some(at(Preparing, SignalRelay::new().arm())?)
        } else {
            None
        };

        let rootfs = at(Preparing, self.exporter.export(&self.config.work_dir))?;
        rollback.push(Resource::WorkDir(rootfs.clone()));
        let _ = at(
            Preparing,
            rootfs::write_workload_config(&rootfs, request.config_override.as_deref()),
        )?;

        let lease = if request.address == AddressRequest::HostNetwork {
            None
        } else {
            Some(at(NetworkReady, self.acquire_network(requested, &cidr, rollback))?)
        };
        if lease.is_some() {
            self.transition(NetworkReady);
        }

        let network = lease.as_ref().map(|lease| NetworkOptions {
            address: lease.id.address_in(subnet.network()),
            prefix: subnet.prefix(),
            bridge: self.config.bridge.name.clone(),
            veth_prefix: self.config.bridge.veth_prefix.clone(),
            gateway: self.config.bridge.gateway,
            mtu: self.config.bridge.mtu,
        });
        let spec = spec::build(&SpecOptions {
            hostname: self.config.hostname.clone(),
            restrict_sys: self.config.restrict_sys,
            cgroup_name: self.config.cgroup_name.clone(),
            cgroup_parent: self.config.cgroup_parent.clone(),
            environment: spec::default_environment(&self.config.hostname),
            network,
            rootfs: rootfs.clone(),
            args: self.config.workload.clone(),
        });
        let _ = at(SpecReady, spec::write_spec(&spec, &rootfs))?;
        self.transition(SpecReady);

        let command = at(
            RuntimeCreated,
            LaunchCommand::builder(spec.args.clone())
                .env(spec.environment.clone())
                .build(),
        )?;
        let container = at(RuntimeCreated, self.runtime.create(&spec, &command))?;
        let handle = container.handle();
        tracing::info!(pid = handle.pid(), "container created");
        rollback.push(Resource::Container(container));
        self.transition(RuntimeCreated);

        let container = rollback.container_mut().ok_or_else(|| {
            (
                Running,
                ScredisError::RuntimeStartFailed {
                    message: "container handle lost".into(),
                },
            )
        })?;
        at(Running, container.start())?;
        if let Some(relay) = relay {
            let _ = at(Running, relay.attach(handle))?;
        }
        self.transition(Running);

        let outcome = at(Running, container.wait())?;
        tracing::info!(?outcome, "workload exited");
        self.transition(LaunchStage::Exited);

        Ok(Finished {
            outcome,
            lease,
            rootfs,
        })
    }

    fn acquire_network(
        &self,
        requested: Option<LeaseId>,
        cidr: &Ipv4Network,
        rollback: &mut Rollback,
    ) -> Result<IpLease> {
        let name = &self.config.bridge.name;
        self.bridge.ensure_bridge(name, cidr)?;
        rollback.push(Resource::Bridge {
            name: name.clone(),
            cidr: *cidr,
        });

        let lease = match requested {
            Some(id) => self.pool.acquire(id)?,
            None => self.pool.allocate()?,
        };
        tracing::info!(id = %lease.id, "address leased");
        rollback.push(Resource::Lease {
            pool: self.pool.clone(),
            lease: lease.clone(),
        });
        Ok(lease)
    }
}

fn parse_network(raw: &str) -> Result<Ipv4Network> {
    raw.parse().map_err(|e| ScredisError::Config {
        message: format!("invalid network {raw}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_names_stage() {
        let failure = LaunchFailure {
            stage: LaunchStage::NetworkReady,
            source: ScredisError::PoolExhausted,
            teardown: TeardownReport::default(),
        };
        assert_eq!(
            failure.to_string(),
            "network-ready stage failed: no more ip addr available"
        );
        assert_eq!(failure.exit_code(), 1);
    }

    #[test]
    fn parse_network_rejects_garbage() {
        assert!(parse_network("10.0.5.0/24").is_ok());
        assert!(parse_network("10.0.5.0/99").is_err());
    }
}
