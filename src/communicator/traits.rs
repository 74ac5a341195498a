use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::cmd::{Cmd, SharedBuffer};
use super::error::{CommunicatorError, Result};
use super::retry::{retry, Failure, RetryContext, RetryError};
use super::types::{CommandOutput, CommandResult, FileInfo};

/// A connection to a remote machine that can run commands and move files.
///
/// All operations take `&self`; implementations keep their connection state
/// behind interior mutability so one communicator can be shared between
/// tasks.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Establishes (or re-establishes) the underlying connection.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Idle timeout applied to the transport. Zero means none.
    fn timeout(&self) -> Duration;

    /// Starts `cmd` remotely and returns without waiting for it to finish.
    /// Completion is reported through the `Cmd`'s exit status.
    async fn start(&self, cmd: &mut Cmd) -> Result<()>;

    /// Writes the whole of `input` to the remote file `dst`. `info`, when
    /// present and describing a regular file, supplies the size and mode.
    async fn upload(
        &self,
        dst: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        info: Option<&FileInfo>,
    ) -> Result<()>;

    /// Copies the local directory `src` to `dst`. Without a trailing slash
    /// on `src` the directory itself is created under `dst`; with one, only
    /// its contents are copied.
    async fn upload_dir(&self, dst: &str, src: &Path, excludes: &[String]) -> Result<()>;

    async fn download(&self, path: &str, output: &mut (dyn AsyncWrite + Send + Unpin))
        -> Result<()>;

    async fn download_dir(&self, src: &str, dst: &Path, excludes: &[String]) -> Result<()>;
}

/// Conveniences built on top of any [`Communicator`].
#[async_trait]
pub trait CommunicatorExt: Communicator {
    /// Runs `command` to completion and captures its output.
    ///
    /// A non-zero exit status is reported in the result, not as an error.
    async fn execute(&self, command: &str) -> Result<CommandResult> {
        let stdout = SharedBuffer::new();
        let stderr = SharedBuffer::new();
        let mut cmd = Cmd::new(command)
            .with_stdout(stdout.clone())
            .with_stderr(stderr.clone());
        let mut output = CommandOutput::new();

        debug!(command, "executing remote command");
        self.start(&mut cmd).await?;
        // `Cmd` owns its boxed streams and is not `Sync`; only the exit
        // handle may be held across the wait.
        let exit = cmd.exit_handle();
        match exit.wait().await {
            Ok(()) => {}
            Err(e) if e.err.is_none() => {}
            Err(e) => return Err(CommunicatorError::Exit(e)),
        }

        output.stop_timing();
        output.exit_status = exit.exit_status().unwrap_or_default();
        output.stdout = stdout.contents();
        output.stderr = stderr.contents();
        debug!(
            status = output.exit_status,
            duration = ?output.duration,
            "command finished"
        );
        Ok(CommandResult {
            command: command.to_string(),
            output,
        })
    }

    /// True when `command` runs and exits 0.
    async fn test(&self, command: &str) -> bool {
        match self.execute(command).await {
            Ok(result) => result.is_success(),
            Err(e) => {
                debug!(error = %e, "test command failed to run");
                false
            }
        }
    }

    /// Keeps calling `connect` until it succeeds or `timeout` passes.
    /// Authentication failures end the loop at once.
    async fn wait_for_ready(
        &self,
        timeout: Duration,
    ) -> std::result::Result<(), RetryError<CommunicatorError>> {
        let ctx = RetryContext::with_timeout(timeout);
        let this = self;
        retry(&ctx, move || async move {
            this.connect().await.map_err(|e| {
                if e.is_fatal() {
                    Failure::Fatal(e)
                } else {
                    Failure::Retry(e)
                }
            })
        })
        .await
    }
}

impl<T: Communicator + ?Sized> CommunicatorExt for T {}
