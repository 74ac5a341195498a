//! WinRM communicator: commands run in remote `cmd` shells over
//! WS-Management, uploads go through a chunked copy client.

mod client;
mod copy;
mod pipe;
pub mod soap;


use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub use client::{RemoteCommand, Shell, WinRmClient};
pub use copy::CopyClient;
pub use pipe::Base64Pipe;
pub use soap::Fault;

use super::cmd::{Cmd, SharedBuffer};
use super::error::{CommunicatorError, Result};
use super::ssh::scp::{has_trailing_separator, Excludes};
use super::traits::Communicator;
use super::types::FileInfo;

pub const DEFAULT_HTTP_PORT: u16 = 5985;
pub const DEFAULT_HTTPS_PORT: u16 = 5986;
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Download runs one PowerShell command that may have to read a large file.
const DOWNLOAD_OPERATION_TIMEOUT: Duration = Duration::from_secs(180);
/// Lowest common denominator across Windows versions.
pub const DEFAULT_MAX_OPERATIONS_PER_SHELL: usize = 15;

#[derive(Debug, Error)]
pub enum WinRmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WinRM authentication failed (HTTP 401)")]
    Unauthorized,

    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("WS-Management fault {}: {}", .0.code, .0.reason)]
    Fault(Fault),

    #[error("malformed WinRM response: {0}")]
    MalformedResponse(String),

    #[error("invalid base64 in response: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("remote command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Customizes the HTTP client, e.g. to add a proxy or client certificates.
pub type TransportDecorator =
    Arc<dyn Fn(reqwest::ClientBuilder) -> reqwest::ClientBuilder + Send + Sync>;

#[derive(Clone)]
pub struct WinRmConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// WS-Man operation timeout. Zero uses 60 seconds.
    pub timeout: Duration,
    pub https: bool,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub transport_decorator: Option<TransportDecorator>,
    pub max_operations_per_shell: usize,
}

impl fmt::Debug for WinRmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("https", &self.https)
            .field("insecure", &self.insecure)
            .field("transport_decorator", &self.transport_decorator.is_some())
            .field("max_operations_per_shell", &self.max_operations_per_shell)
            .finish()
    }
}

impl WinRmConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            timeout: Duration::ZERO,
            https: false,
            insecure: false,
            transport_decorator: None,
            max_operations_per_shell: DEFAULT_MAX_OPERATIONS_PER_SHELL,
        }
    }

    pub fn with_https(mut self, insecure: bool) -> Self {
        self.https = true;
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transport_decorator(mut self, decorator: TransportDecorator) -> Self {
        self.transport_decorator = Some(decorator);
        self
    }

    pub fn with_max_operations_per_shell(mut self, max: usize) -> Self {
        self.max_operations_per_shell = max;
        self
    }

    pub fn endpoint(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.port)
    }

    pub fn operation_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_OPERATION_TIMEOUT
        } else {
            self.timeout
        }
    }
}

pub struct WinRmCommunicator {
    config: WinRmConfig,
    client: WinRmClient,
    span: Span,
}

impl fmt::Debug for WinRmCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmCommunicator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WinRmCommunicator {
    pub fn new(config: WinRmConfig) -> Result<Self> {
        let client = WinRmClient::new(&config)?;
        let span = info_span!(
            "communicator.winrm",
            address = %format!("{}:{}", config.host, config.port)
        );
        Ok(Self {
            config,
            client,
            span,
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &WinRmConfig {
        &self.config
    }

    fn copy_client(&self) -> CopyClient {
        CopyClient::new(self.client.clone(), self.config.max_operations_per_shell)
    }

    async fn start_command(&self, cmd: &mut Cmd) -> Result<()> {
        let shell = self.client.create_shell().await?;
        let command = cmd.command().to_string();
        info!(%command, "starting remote command");
        let remote = match shell.execute(&command).await {
            Ok(remote) => remote,
            Err(e) => {
                if let Err(close) = shell.close().await {
                    debug!(error = %close, "failed to close shell");
                }
                return Err(e.into());
            }
        };

        let stdin = cmd.take_stdin();
        let stdout = cmd.take_stdout();
        let stderr = cmd.take_stderr();
        if stdout.is_none() {
            warn!(%command, "failed to read stdout");
        }
        if stderr.is_none() {
            warn!(%command, "failed to read stderr");
        }
        let mut stdout = stdout.unwrap_or_else(|| Box::new(tokio::io::sink()));
        let mut stderr = stderr.unwrap_or_else(|| Box::new(tokio::io::sink()));
        let exit = cmd.exit_handle();

        tokio::spawn(
            async move {
                if let Some(mut stdin) = stdin {
                    let mut input = Vec::new();
                    match stdin.read_to_end(&mut input).await {
                        Ok(_) => {
                            if let Err(e) = remote.send_input(&input, true).await {
                                warn!(error = %e, "failed to send stdin");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to read stdin"),
                    }
                }

                // Transport failures while waiting are logged only; the
                // command is then reported with exit code 0.
                let code = match remote.relay_output(&mut stdout, &mut stderr).await {
                    Ok(code) => code,
                    Err(e) => {
                        error!(%command, error = %e, "error waiting for remote command");
                        0
                    }
                };
                drop(stdout);
                drop(stderr);
                if let Err(e) = shell.close().await {
                    debug!(error = %e, "failed to close shell");
                }

                info!(exitcode = code, %command, "command complete");
                exit.set_exit_status(code, None);
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }

    async fn download_file(
        &self,
        path: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let client = WinRmClient::with_operation_timeout(&self.config, DOWNLOAD_OPERATION_TIMEOUT)?;
        let script = format!(
            r#"$file=[System.IO.File]::ReadAllBytes("{}"); Write-Output $([System.Convert]::ToBase64String($file))"#,
            path.replace('"', "`\"")
        );

        let shell = client.create_shell().await?;
        let outcome = async {
            let remote = shell.execute(&soap::powershell(&script)).await?;
            let mut pipe = Base64Pipe::new(&mut *output);
            let mut stderr = SharedBuffer::new();
            let status = remote.relay_output(&mut pipe, &mut stderr).await?;
            if status != 0 {
                return Err(WinRmError::CommandFailed {
                    status,
                    stderr: stderr.to_string_lossy(),
                });
            }
            pipe.finish()?;
            Ok::<(), WinRmError>(())
        }
        .await;
        if let Err(e) = shell.close().await {
            debug!(error = %e, "failed to close shell");
        }
        Ok(outcome?)
    }
}

#[async_trait]
impl Communicator for WinRmCommunicator {
    /// Opens and closes a shell to prove the endpoint accepts us.
    async fn connect(&self) -> Result<()> {
        async {
            debug!("connecting to remote shell");
            let shell = self.client.create_shell().await.map_err(|e| {
                error!(error = %e, "connection failure");
                e
            })?;
            if let Err(e) = shell.close().await {
                error!(error = %e, "connection close failure");
            }
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Nothing to tear down: every operation uses its own shell.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn start(&self, cmd: &mut Cmd) -> Result<()> {
        self.start_command(cmd).instrument(self.span.clone()).await
    }

    async fn upload(
        &self,
        dst: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        info: Option<&FileInfo>,
    ) -> Result<()> {
        async {
            let mut path = dst.to_string();
            if path.ends_with('\\') {
                let name = info.map(|i| i.name.as_str()).ok_or_else(|| {
                    CommunicatorError::Unsupported(format!(
                        "destination {dst} is a directory but the source has no file name"
                    ))
                })?;
                path.push_str(name);
            }
            info!(path = %path, "uploading file");
            self.copy_client().write(&path, input).await?;
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn upload_dir(&self, dst: &str, src: &Path, excludes: &[String]) -> Result<()> {
        async {
            let mut dst = dst.trim_end_matches('\\').to_string();
            if !has_trailing_separator(src) {
                if let Some(name) = src.file_name() {
                    dst = format!("{}\\{}", dst, name.to_string_lossy());
                }
            }
            info!(source = %src.display(), destination = %dst, "uploading directory");
            self.copy_client()
                .copy_dir(src, &dst, &Excludes::new(excludes))
                .await?;
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn download(
        &self,
        path: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        async {
            info!(path, "downloading file");
            self.download_file(path, output).await
        }
        .instrument(self.span.clone())
        .await
    }

    async fn download_dir(&self, _src: &str, _dst: &Path, _excludes: &[String]) -> Result<()> {
        Err(CommunicatorError::Unsupported(
            "WinRM doesn't support download dir.".to_string(),
        ))
    }
}
