use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use super::error::{CommunicatorError, Result};
use super::traits::Communicator;

/// Exit status reported when the remote side went away without sending an
/// exit status or exit signal.
pub const CMD_DISCONNECT: i32 = 2300218;

const UI_PIPE_CAPACITY: usize = 64 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented output sink used while relaying remote output.
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);
}

/// Terminal failure report of a remote command.
#[derive(Debug, Clone)]
pub struct ExitError {
    pub command: String,
    pub exit_status: i32,
    pub err: Option<Arc<CommunicatorError>>,
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.err {
            Some(err) => write!(f, "error executing {:?}: {}", self.command, err),
            None => write!(f, "{:?} exit status: {}", self.command, self.exit_status),
        }
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.err
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Clone)]
struct ExitRecord {
    status: i32,
    err: Option<Arc<CommunicatorError>>,
}

/// Write side of a command's completion latch.
///
/// Communicators clone this into the background task that finishes the
/// remote exchange. The latch fires exactly once; any number of observers
/// may await it.
#[derive(Clone)]
pub struct ExitHandle {
    command: Arc<str>,
    tx: Arc<watch::Sender<Option<ExitRecord>>>,
}

impl fmt::Debug for ExitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHandle")
            .field("command", &self.command)
            .field("completed", &self.tx.borrow().is_some())
            .finish()
    }
}

impl ExitHandle {
    fn new(command: &str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            command: Arc::from(command),
            tx: Arc::new(tx),
        }
    }

    /// Records the exit status and communicator error, then releases every
    /// pending `wait`.
    ///
    /// # Panics
    ///
    /// Panics when called a second time for the same command. Only the
    /// communicator running the command may report its exit.
    pub fn set_exit_status(&self, status: i32, err: Option<CommunicatorError>) {
        let record = ExitRecord {
            status,
            err: err.map(Arc::new),
        };
        let fired = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(record);
            true
        });
        assert!(
            fired,
            "exit status reported twice for command {:?}",
            self.command
        );
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> std::result::Result<(), ExitError> {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as this handle; a closed channel is
        // reported as a disconnect rather than hanging.
        let record = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match record {
            Some(ExitRecord { status: 0, err: None }) => Ok(()),
            Some(ExitRecord { status, err }) => Err(ExitError {
                command: self.command.to_string(),
                exit_status: status,
                err,
            }),
            None => Err(ExitError {
                command: self.command.to_string(),
                exit_status: CMD_DISCONNECT,
                err: Some(Arc::new(CommunicatorError::ExitMissing)),
            }),
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.tx.borrow().as_ref().map(|r| r.status)
    }
}

/// One remote command invocation: the command line, its streams and its
/// completion state.
///
/// `Communicator::start` takes the streams out of the `Cmd`; the caller keeps
/// the `Cmd` to `wait` on it.
pub struct Cmd {
    command: String,
    stdin: Option<BoxedReader>,
    stdout: Option<BoxedWriter>,
    stderr: Option<BoxedWriter>,
    exit: ExitHandle,
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("command", &self.command)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("exit", &self.exit)
            .finish()
    }
}

impl Cmd {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        let exit = ExitHandle::new(&command);
        Self {
            command,
            stdin: None,
            stdout: None,
            stderr: None,
            exit,
        }
    }

    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Allocates a fresh completion latch. `new` already does this; call it
    /// again only to reuse a finished `Cmd` before starting it a second time.
    pub fn init(&mut self) {
        self.exit = ExitHandle::new(&self.command);
    }

    pub fn take_stdin(&mut self) -> Option<BoxedReader> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedWriter> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxedWriter> {
        self.stderr.take()
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    /// See [`ExitHandle::set_exit_status`]; panics on a second call.
    pub fn set_exit_status(&self, status: i32, err: Option<CommunicatorError>) {
        self.exit.set_exit_status(status, err);
    }

    /// Exit status once the command has completed.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit.exit_status()
    }

    /// Blocks until the command completes. Returns `Ok` only for exit status
    /// 0 with no communicator error.
    pub async fn wait(&self) -> std::result::Result<(), ExitError> {
        self.exit.wait().await
    }

    /// Starts the command on `comm` and relays every line of its stdout and
    /// stderr to `ui` until both streams close. Any writers already set on
    /// the `Cmd` still receive the raw output and are put back afterwards.
    ///
    /// Returns once the command has completed; use `wait` for its outcome.
    pub async fn start_with_ui<C>(&mut self, comm: &C, ui: &dyn Ui) -> Result<()>
    where
        C: Communicator + ?Sized,
    {
        let (stdout_w, stdout_r) = tokio::io::duplex(UI_PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(UI_PIPE_CAPACITY);

        let original_stdout = self.stdout.replace(Box::new(stdout_w));
        let original_stderr = self.stderr.replace(Box::new(stderr_w));

        if let Err(e) = comm.start(self).await {
            self.stdout = original_stdout;
            self.stderr = original_stderr;
            return Err(e);
        }

        // Pipe ends the communicator did not take would keep the relays open.
        drop(self.stdout.take());
        drop(self.stderr.take());

        let (stdout, stderr) = tokio::join!(
            relay_lines(stdout_r, original_stdout, ui),
            relay_lines(stderr_r, original_stderr, ui),
        );
        let _ = self.exit.wait().await;

        self.stdout = stdout;
        self.stderr = stderr;
        Ok(())
    }
}

async fn relay_lines(
    mut pipe: DuplexStream,
    mut tee: Option<BoxedWriter>,
    ui: &dyn Ui,
) -> Option<BoxedWriter> {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed reading command output");
                break;
            }
        };
        if let Some(writer) = tee.as_mut() {
            if let Err(e) = writer.write_all(&buf[..n]).await {
                tracing::warn!(error = %e, "failed writing command output");
            }
        }
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            ui.say(&clean_output_line(&String::from_utf8_lossy(&line)));
        }
    }
    if !pending.is_empty() {
        ui.say(&clean_output_line(&String::from_utf8_lossy(&pending)));
    }
    if let Some(writer) = tee.as_mut() {
        let _ = writer.flush().await;
    }
    tee
}

/// Trims trailing whitespace and drops everything up to the last carriage
/// return, since a terminal would have overwritten it.
pub fn clean_output_line(line: &str) -> String {
    let line = line.trim_end();
    match line.rfind('\r') {
        Some(idx) => line[idx + 1..].to_string(),
        None => line.to_string(),
    }
}

/// Cloneable in-memory writer; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.0.lock() {
            Ok(mut inner) => {
                inner.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(io::Error::other("output buffer poisoned"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::types::FileInfo;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingUi(Mutex<Vec<String>>);

    impl Ui for CollectingUi {
        fn say(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    /// Writes canned output in awkward chunks, then exits with `status`.
    struct ScriptedCommunicator {
        stdout_chunks: Vec<&'static str>,
        stderr_chunks: Vec<&'static str>,
        status: i32,
    }

    #[async_trait]
    impl Communicator for ScriptedCommunicator {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        async fn start(&self, cmd: &mut Cmd) -> Result<()> {
            let mut stdout = cmd.take_stdout();
            let mut stderr = cmd.take_stderr();
            let stdout_chunks = self.stdout_chunks.clone();
            let stderr_chunks = self.stderr_chunks.clone();
            let status = self.status;
            let exit = cmd.exit_handle();
            tokio::spawn(async move {
                if let Some(w) = stdout.as_mut() {
                    for chunk in stdout_chunks {
                        w.write_all(chunk.as_bytes()).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                }
                if let Some(w) = stderr.as_mut() {
                    for chunk in stderr_chunks {
                        w.write_all(chunk.as_bytes()).await.unwrap();
                    }
                }
                drop(stdout);
                drop(stderr);
                exit.set_exit_status(status, None);
            });
            Ok(())
        }

        async fn upload(
            &self,
            _dst: &str,
            _input: &mut (dyn AsyncRead + Send + Unpin),
            _info: Option<&FileInfo>,
        ) -> Result<()> {
            Ok(())
        }

        async fn upload_dir(&self, _dst: &str, _src: &Path, _excludes: &[String]) -> Result<()> {
            Ok(())
        }

        async fn download(
            &self,
            _path: &str,
            _output: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<()> {
            Ok(())
        }

        async fn download_dir(&self, _src: &str, _dst: &Path, _excludes: &[String]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_clean_output_line() {
        assert_eq!(clean_output_line("hello \n"), "hello");
        assert_eq!(clean_output_line("10%\r50%\r100%\r\n"), "100%");
        assert_eq!(clean_output_line("\n"), "");
        assert_eq!(clean_output_line("  indented\t"), "  indented");
    }

    #[tokio::test]
    async fn test_wait_success() {
        let cmd = Cmd::new("true");
        cmd.set_exit_status(0, None);
        assert!(cmd.wait().await.is_ok());
        assert_eq!(cmd.exit_status(), Some(0));
    }

    #[tokio::test]
    async fn test_wait_nonzero_status() {
        let cmd = Cmd::new("false");
        cmd.set_exit_status(1, None);
        let err = cmd.wait().await.unwrap_err();
        assert_eq!(err.command, "false");
        assert_eq!(err.exit_status, 1);
        assert!(err.err.is_none());
        assert_eq!(err.to_string(), "\"false\" exit status: 1");
    }

    #[tokio::test]
    async fn test_wait_reports_communicator_error() {
        let cmd = Cmd::new("uptime");
        cmd.set_exit_status(0, Some(CommunicatorError::ExitMissing));
        let err = cmd.wait().await.unwrap_err();
        assert_eq!(err.exit_status, 0);
        assert!(matches!(
            err.err.as_deref(),
            Some(CommunicatorError::ExitMissing)
        ));
        assert!(err.to_string().starts_with("error executing \"uptime\""));
    }

    #[tokio::test]
    async fn test_wait_with_many_observers() {
        let cmd = Cmd::new("sleep 1");
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let handle = cmd.exit_handle();
            waiters.push(tokio::spawn(async move { handle.wait().await }));
        }
        tokio::task::yield_now().await;
        cmd.set_exit_status(7, None);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap_err().exit_status, 7);
        }
        assert_eq!(cmd.wait().await.unwrap_err().exit_status, 7);
    }

    #[test]
    #[should_panic(expected = "exit status reported twice")]
    fn test_second_exit_status_panics() {
        let cmd = Cmd::new("ls");
        cmd.set_exit_status(0, None);
        cmd.set_exit_status(1, None);
    }

    #[tokio::test]
    async fn test_init_resets_completion() {
        let mut cmd = Cmd::new("ls");
        cmd.set_exit_status(3, None);
        cmd.init();
        assert_eq!(cmd.exit_status(), None);
        cmd.set_exit_status(0, None);
        assert!(cmd.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_with_ui_relays_lines_and_tees() {
        let comm = ScriptedCommunicator {
            stdout_chunks: vec!["hel", "lo\nwor", "ld  \n", "10%\r100%\n", "tail"],
            stderr_chunks: vec!["warning: x\n"],
            status: 0,
        };
        let tee = SharedBuffer::new();
        let ui = CollectingUi::default();
        let mut cmd = Cmd::new("build").with_stdout(tee.clone());

        cmd.start_with_ui(&comm, &ui).await.unwrap();

        let mut lines = ui.0.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, vec!["100%", "hello", "tail", "warning: x", "world"]);
        assert_eq!(tee.to_string_lossy(), "hello\nworld  \n10%\r100%\ntail");
        assert!(cmd.wait().await.is_ok());
        assert!(cmd.take_stdout().is_some(), "caller writer is restored");
    }

    #[tokio::test]
    async fn test_start_with_ui_then_wait_reports_failure() {
        let comm = ScriptedCommunicator {
            stdout_chunks: vec!["partial"],
            stderr_chunks: vec![],
            status: 2,
        };
        let ui = CollectingUi::default();
        let mut cmd = Cmd::new("make");
        cmd.start_with_ui(&comm, &ui).await.unwrap();
        assert_eq!(ui.0.lock().unwrap().as_slice(), ["partial"]);
        assert_eq!(cmd.wait().await.unwrap_err().exit_status, 2);
    }
}
