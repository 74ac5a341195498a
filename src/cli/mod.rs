mod common;
mod error;
mod exec;
pub mod parser;
mod profiles;
mod ready;
mod transfer;
mod ui;

use clap::Parser;
pub use error::CliError;
use parser::Cli;

// Helper function to parse args
pub fn parse_args() -> Cli {
    Cli::parse()
}

// Main CLI execution function, receives parsed args
pub async fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        parser::Commands::Exec(cmd) => cmd.run(&cli).await,
        parser::Commands::Upload(cmd) => cmd.run(&cli).await,
        parser::Commands::UploadDir(cmd) => cmd.run(&cli).await,
        parser::Commands::Download(cmd) => cmd.run(&cli).await,
        parser::Commands::DownloadDir(cmd) => cmd.run(&cli).await,
        parser::Commands::Ready(cmd) => cmd.run(&cli).await,
        parser::Commands::Profiles(cmd) => cmd.run(&cli).await,
    }
}
