//! Running commands on, and moving files to and from, remote guests.
//!
//! A [`Communicator`] owns one logical connection. Commands are described by
//! a [`Cmd`] and started without blocking; their outcome is collected with
//! [`Cmd::wait`] or relayed line by line with [`Cmd::start_with_ui`].

pub mod cmd;
pub mod dial;
pub mod error;
pub mod retry;
pub mod ssh;
pub mod traits;
pub mod types;
pub mod winrm;

pub use cmd::{Cmd, ExitError, SharedBuffer, Ui, CMD_DISCONNECT};
pub use dial::{BastionDialer, Dialer, ProxyCredentials, Socks5Dialer, TcpDialer};
pub use error::{CommunicatorError, Result};
pub use retry::{retry, retry_with, Backoff, Failure, RetryContext, RetryError};
pub use ssh::{AuthMethod, ClientConfig, HostKeyPolicy, KnownHosts, SshCommunicator, SshConfig};
pub use traits::{Communicator, CommunicatorExt};
pub use types::{CommandOutput, CommandResult, FileInfo};
pub use winrm::{WinRmCommunicator, WinRmConfig, WinRmError};
