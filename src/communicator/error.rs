use thiserror::Error;

use super::cmd::ExitError;
use super::dial::DialError;
use super::ssh::scp::ScpError;
use super::winrm::WinRmError;

#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("SCP error: {0}")]
    Scp(#[from] ScpError),

    #[error("WinRM error: {0}")]
    WinRm(#[from] WinRmError),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The SSH handshake did not complete within the configured window.
    #[error("Timeout during SSH handshake")]
    HandshakeTimeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("client not available")]
    ClientNotAvailable,

    #[error("No connection currently established to close")]
    NotConnected,

    #[error("remote command exited without exit status or exit signal")]
    ExitMissing,

    #[error("remote command killed by signal {signal}: {message}")]
    ExitSignal { signal: String, message: String },

    #[error("{0}")]
    Exit(#[from] ExitError),

    #[error("{0}")]
    Unsupported(String),

    #[error("Generic communicator error: {0}")]
    Other(String),
}

impl CommunicatorError {
    /// True for failures that retrying a connection cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommunicatorError::AuthenticationFailed(_)
                | CommunicatorError::WinRm(WinRmError::Unauthorized)
        )
    }
}

pub type Result<T, E = CommunicatorError> = std::result::Result<T, E>;
