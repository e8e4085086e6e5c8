//! `sc-redis init`: the in-container stage. Never invoked by hand.

use std::process::ExitCode;

use clap::Args;
use scredis_runtime::init::run_init;
use scredis_runtime::runtime::native::NativeRuntime;

/// Arguments for the `init` command.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Workload argument vector, after `--`.
    #[arg(last = true)]
    pub argv: Vec<String>,
}

/// Finishes the container and execs the workload.
///
/// # Errors
///
/// Returns the init failure; the host has already been told about it.
pub fn execute(args: InitArgs) -> anyhow::Result<ExitCode> {
    let span = tracing::info_span!("init");
    let _enter = span.enter();

    let Err(e) = run_init(NativeRuntime::new, args.argv);
    Err(e.into())
}
