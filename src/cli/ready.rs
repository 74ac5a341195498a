use super::common::{disconnect, resolve_target};
use super::error::CliError;
use super::parser::Cli;
use super::ui;
use crate::communicator::CommunicatorExt;
use clap::Args;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Args)]
pub struct Ready {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Seconds to keep trying before giving up
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

impl Ready {
    #[instrument(name = "ready", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let (name, profile) = resolve_target(cli_args, &self.target).await?;
        let comm = profile.communicator(&name).await?;

        let pb = ui::create_spinner(
            &format!("Waiting for {}...", ui::format_highlight(&self.target)),
            !cli_args.no_progress,
        );
        let result = comm.wait_for_ready(Duration::from_secs(self.timeout)).await;
        pb.finish_and_clear();
        result.map_err(|e| {
            CliError::OperationFailed(format!("{} is not ready: {}", self.target, e))
        })?;

        disconnect(comm.as_ref()).await;
        info!(
            "{}",
            ui::format_success(&format!("{} is ready.", self.target))
        );
        Ok(())
    }
}
