use crate::communicator::{CommunicatorError, ExitError};
use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    #[error(transparent)]
    Command(#[from] ExitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
