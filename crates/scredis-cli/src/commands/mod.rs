//! CLI command definitions and dispatch.

pub mod init;
pub mod run;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use scredis_common::constants::BIN_NAME;

/// sc-redis: a containerised Redis server in one command.
#[derive(Parser, Debug)]
#[command(
    name = BIN_NAME,
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Internal subcommand; absent for a normal launch.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Launch options.
    #[command(flatten)]
    pub run: run::RunArgs,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Container init stage, run by the launcher inside the new namespaces.
    #[command(hide = true)]
    Init(init::InitArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the launcher cannot be set up at all.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Some(Command::Init(args)) => init::execute(args),
        None => run::execute(&cli.run),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
        assert_eq!(Cli::command().get_name(), BIN_NAME);
    }

    #[test]
    fn init_takes_trailing_argv() {
        let cli = Cli::try_parse_from(["sc-redis", "init", "--", "redis-server", "--port", "7000"])
            .unwrap();
        let Some(Command::Init(args)) = cli.command else {
            panic!("expected init");
        };
        assert_eq!(args.argv, ["redis-server", "--port", "7000"]);
    }

    #[test]
    fn plain_invocation_is_a_launch() {
        let cli = Cli::try_parse_from(["sc-redis", "-i", "10.0.5.22", "-c", "port 6381"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.ip.as_deref(), Some("10.0.5.22"));
        assert_eq!(cli.run.config.as_deref(), Some("port 6381"));
    }

    #[test]
    fn ip_and_bridge_are_exclusive() {
        assert!(Cli::try_parse_from(["sc-redis", "-i", "10.0.5.22", "--bridge"]).is_err());
    }
}
