//! Default action: launch the containerised server and supervise it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use scredis_common::config::LauncherConfig;
use scredis_core::bridge::IpCommand;
use scredis_runtime::bootstrap::{AddressRequest, BootstrapOrchestrator, LaunchRequest};
use scredis_runtime::runtime::native::NativeRuntime;

use crate::output;

/// Launch options.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Redis configuration directives written to /etc/redis.conf.
    #[arg(short = 'c', long = "config", value_name = "DIRECTIVES")]
    pub config: Option<String>,

    /// Isolate the network and use this address on the bridge subnet.
    #[arg(short = 'i', long = "ip", value_name = "ADDR", conflicts_with = "bridge")]
    pub ip: Option<String>,

    /// Isolate the network and lease the lowest free address.
    #[arg(long)]
    pub bridge: bool,

    /// Directory holding per-launch root filesystems.
    #[arg(short = 'w', long, env = "SCREDIS_WORK_DIR", value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Root filesystem archive to extract.
    #[arg(long, env = "SCREDIS_ROOTFS_ARCHIVE", value_name = "PATH")]
    pub rootfs_archive: Option<PathBuf>,

    /// Host-wide address pool record.
    #[arg(long, env = "SCREDIS_POOL_FILE", value_name = "PATH")]
    pub pool_file: Option<PathBuf>,
}

impl RunArgs {
    /// Overlays the flags on the default configuration.
    pub fn launcher_config(&self) -> LauncherConfig {
        let mut config = LauncherConfig::default();
        if let Some(dir) = &self.work_dir {
            config.work_dir.clone_from(dir);
        }
        if let Some(archive) = &self.rootfs_archive {
            config.rootfs_archive.clone_from(archive);
        }
        if let Some(pool) = &self.pool_file {
            config.pool_file.clone_from(pool);
        }
        config
    }

    /// Translates the network flags into a launch request.
    pub fn launch_request(&self) -> LaunchRequest {
        let address = match (&self.ip, self.bridge) {
            (Some(ip), _) => AddressRequest::Specific(ip.clone()),
            (None, true) => AddressRequest::Automatic,
            (None, false) => AddressRequest::HostNetwork,
        };
        LaunchRequest {
            address,
            config_override: self.config.clone(),
        }
    }
}

/// Executes a launch.
///
/// # Errors
///
/// Returns an error if the runtime cannot be set up. Launch failures are
/// reported here and turned into exit code 1.
pub fn execute(args: &RunArgs) -> anyhow::Result<ExitCode> {
    let span = tracing::info_span!("launch");
    let _enter = span.enter();

    let config = args.launcher_config();
    let request = args.launch_request();
    tracing::debug!(?config, ?request, "launching");

    let runtime = NativeRuntime::new()?;
    let net = IpCommand::locate()?;
    let mut orchestrator = BootstrapOrchestrator::new(config, runtime, net);

    match orchestrator.launch(&request) {
        Ok(report) => {
            if !report.teardown.is_clean() {
                output::print_teardown(&report.teardown);
            }
            Ok(exit_code(report.exit_code))
        }
        Err(failure) => {
            output::print_failure(&failure);
            Ok(exit_code(failure.exit_code()))
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_status(code))
}

/// Process exit status for `code`; anything outside a byte becomes 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_network_flag_shares_host_network() {
        let args = RunArgs::default();
        assert_eq!(args.launch_request().address, AddressRequest::HostNetwork);
    }

    #[test]
    fn bridge_flag_requests_automatic_address() {
        let args = RunArgs {
            bridge: true,
            ..RunArgs::default()
        };
        assert_eq!(args.launch_request().address, AddressRequest::Automatic);
    }

    #[test]
    fn paths_overlay_defaults() {
        let args = RunArgs {
            work_dir: Some("/tmp/sc".into()),
            ..RunArgs::default()
        };
        let config = args.launcher_config();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/sc"));
        assert_eq!(config.pool_file, LauncherConfig::default().pool_file);
    }

    #[test]
    fn exit_codes_clamp_to_a_byte() {
        assert_eq!(exit_status(143), 143);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }
}
