use super::common::{connect, disconnect};
use super::error::CliError;
use super::parser::Cli;
use super::ui;
use crate::communicator::Cmd;
use clap::Args;
use tracing::{info, instrument};

#[derive(Debug, Args)]
pub struct Exec {
    /// Profile name or SSH target in the format [user@]host[:port]
    #[arg(required = true)]
    target: String,

    /// Command line to run remotely
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Exec {
    #[instrument(name = "exec", skip(self, cli_args), fields(target = %self.target))]
    pub async fn run(&self, cli_args: &Cli) -> Result<(), CliError> {
        let comm = connect(cli_args, &self.target).await?;
        let command = self.command.join(" ");
        info!("Running {}", ui::format_highlight(&command));

        let mut cmd = Cmd::new(command);
        let started = cmd
            .start_with_ui(comm.as_ref(), &ui::TerminalUi::new(&self.target))
            .await;
        let outcome = match started {
            Ok(()) => cmd.wait().await.map_err(CliError::from),
            Err(e) => Err(e.into()),
        };
        disconnect(comm.as_ref()).await;
        outcome?;

        info!("{}", ui::format_success("Command completed successfully."));
        Ok(())
    }
}
