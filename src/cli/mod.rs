mod oneshot;
mod serve;
mod watch;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub type CommandResult = anyhow::Result<ExitCode>;

pub const SUCCESS: CommandResult = Ok(ExitCode::SUCCESS);
// Indicates domain failures (e.g. a rejected event), not process errors.
pub const FAILURE: CommandResult = Ok(ExitCode::FAILURE);

#[allow(clippy::partial_pub_fields)] // To use global options from subcommands.
#[derive(Debug, Clone, Parser)]
#[command(version, about, args_override_self(true))]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the webhook receiver: normalizes events, resolves bindings,
    /// evaluates ACL and match rules, and submits PipelineRuns.
    Serve(serve::ServeArgs),
    /// Run the Tekton watch loop: reconciles PipelineRun state into
    /// provider statuses and promotes queued runs.
    Watch(watch::WatchArgs),
    /// Run a single event end-to-end without a webhook server, for local
    /// development.
    Oneshot(oneshot::OneshotArgs),
}

pub async fn run() -> CommandResult {
    let cli = Cli::parse();
    let cli_clone = cli.clone();
    match cli.command {
        Commands::Serve(args) => serve::serve(cli_clone, args).await,
        Commands::Watch(args) => watch::watch(cli_clone, args).await,
        Commands::Oneshot(args) => oneshot::oneshot(cli_clone, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
