use std::io;
use std::pin::Pin;

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use super::super::cmd::CMD_DISCONNECT;
use super::super::error::{CommunicatorError, Result};

const PIPE_CAPACITY: usize = 256 * 1024;

/// How a remote session ended.
#[derive(Debug, Default)]
pub(crate) struct SessionExit {
    pub status: Option<u32>,
    pub signal: Option<(String, String)>,
    /// First failure writing output locally. Draining continues after it.
    pub io_error: Option<io::Error>,
}

impl SessionExit {
    /// Exit status and error to report on the `Cmd`.
    pub(crate) fn into_exit_status(self) -> (i32, Option<CommunicatorError>) {
        match (self.status, self.signal, self.io_error) {
            (_, Some((signal, message)), _) => (
                128 + signal_number(&signal),
                Some(CommunicatorError::ExitSignal { signal, message }),
            ),
            (Some(0), None, Some(e)) => (0, Some(CommunicatorError::Io(e))),
            (Some(status), None, _) => (status as i32, None),
            (None, None, _) => (CMD_DISCONNECT, Some(CommunicatorError::ExitMissing)),
        }
    }
}

/// POSIX number for a signal name, or 0 when the guest sent one we don't know.
fn signal_number(name: &str) -> i32 {
    match name.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => 0,
    }
}

fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        known => format!("{known:?}"),
    }
}

/// Drains `channel` until the server closes it, routing data to `stdout` and
/// extended data to `stderr`.
pub(crate) async fn pump_session<O, E>(
    mut channel: Channel<Msg>,
    stdout: &mut O,
    stderr: &mut E,
) -> SessionExit
where
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut exit = SessionExit::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                if let Err(e) = stdout.write_all(data).await {
                    exit.io_error.get_or_insert(e);
                }
            }
            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                if let Err(e) = stderr.write_all(data).await {
                    exit.io_error.get_or_insert(e);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => exit.status = Some(exit_status),
            ChannelMsg::ExitSignal {
                signal_name: signal,
                error_message,
                ..
            } => exit.signal = Some((signal_name(&signal), error_message)),
            _ => {}
        }
    }
    if let Err(e) = stdout.flush().await {
        exit.io_error.get_or_insert(e);
    }
    if let Err(e) = stderr.flush().await {
        exit.io_error.get_or_insert(e);
    }
    exit
}

/// A remote command whose stdin and stdout are driven directly by the caller,
/// with stderr collected in the background.
pub(crate) struct RemoteProcess {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: BufReader<DuplexStream>,
    pump: JoinHandle<(SessionExit, Vec<u8>)>,
}

/// Remote process outcome with its captured stderr.
pub(crate) struct ProcessExit {
    pub exit: SessionExit,
    pub stderr: Vec<u8>,
}

impl RemoteProcess {
    pub(crate) async fn spawn(channel: Channel<Msg>, command: &str) -> Result<Self> {
        let stdin = Box::pin(channel.make_writer());
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        channel.exec(true, command).await?;

        let pump = tokio::spawn(async move {
            let mut stdout_w = stdout_w;
            let mut stderr = Vec::new();
            let exit = pump_session(channel, &mut stdout_w, &mut stderr).await;
            (exit, stderr)
        });

        Ok(Self {
            stdin,
            stdout: BufReader::new(stdout_r),
            pump,
        })
    }

    /// Closes stdin and waits for the remote side to exit, discarding any
    /// stdout the caller did not consume.
    pub(crate) async fn finish(mut self) -> Result<ProcessExit> {
        if let Err(e) = self.stdin.shutdown().await {
            tracing::debug!(error = %e, "closing remote stdin");
        }
        let mut rest = Vec::new();
        let (_, joined) = tokio::join!(self.stdout.read_to_end(&mut rest), self.pump);
        let (exit, stderr) =
            joined.map_err(|e| CommunicatorError::Other(format!("session task failed: {e}")))?;
        Ok(ProcessExit { exit, stderr })
    }

    /// Drops the session without waiting for the remote exit.
    pub(crate) fn abort(self) {
        self.pump.abort();
    }
}
