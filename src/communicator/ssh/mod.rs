//! SSH communicator: command execution plus SCP and SFTP transfers.

pub(crate) mod auth;
pub mod config;
mod deadline;
pub(crate) mod handler;
pub mod known_hosts;
pub mod scp;
mod session;
mod sftp;


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, Disconnect, Pty};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub use config::{AuthMethod, ClientConfig, HostKeyPolicy, SshConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use known_hosts::KnownHosts;

use self::auth::handshake;
use self::deadline::DeadlineStream;
use self::handler::ClientHandler;
use self::session::pump_session;
use super::cmd::Cmd;
use super::dial::BoxedStream;
use super::error::{CommunicatorError, Result};
use super::traits::Communicator;
use super::types::FileInfo;

type Client = Arc<Handle<ClientHandler>>;

#[derive(Default)]
struct ConnectionState {
    client: Option<Client>,
    /// Set once a local agent was found; agent identities are then offered
    /// on every reconnect and each command session requests forwarding.
    agent_forwarding: bool,
}

/// Runs commands and moves files over one SSH connection.
///
/// The connection is established lazily and re-established once whenever a
/// session cannot be opened on it.
pub struct SshCommunicator {
    config: SshConfig,
    state: Mutex<ConnectionState>,
    span: Span,
}

impl std::fmt::Debug for SshCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCommunicator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SshCommunicator {
    pub fn new(config: SshConfig) -> Self {
        let span = info_span!("communicator.ssh", address = %config.dialer.address());
        Self {
            config,
            state: Mutex::new(ConnectionState::default()),
            span,
        }
    }

    /// Replaces the span every operation and background task runs in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn address(&self) -> String {
        self.config.dialer.address()
    }

    fn wants_agent(&self) -> bool {
        !self.config.disable_agent_forwarding
            && std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty())
    }

    async fn reconnect(&self, state: &mut ConnectionState) -> Result<()> {
        if let Some(client) = state.client.take() {
            let _ = client
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }

        debug!("reconnecting to TCP connection for SSH");
        let stream = self.config.dialer.dial().await.map_err(|e| {
            error!(error = %e, "reconnection error");
            e
        })?;
        let stream: BoxedStream = if self.config.timeout.is_zero() {
            stream
        } else {
            Box::new(DeadlineStream::new(stream, self.config.timeout))
        };

        let handler = ClientHandler::new(
            self.config.dialer.host(),
            self.config.dialer.port(),
            self.config.client.host_key_policy.clone(),
            self.wants_agent(),
        );

        debug!("handshaking with SSH");
        let limit = self.config.effective_handshake_timeout();
        let handle = match tokio::time::timeout(
            limit,
            handshake(stream, handler, &self.config.client, state.agent_forwarding),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                error!(error = %e, "handshake error");
                return Err(e);
            }
            Err(_) => {
                error!(timeout = ?limit, "timeout during SSH handshake");
                return Err(CommunicatorError::HandshakeTimeout);
            }
        };
        debug!("handshake complete");

        let client = Arc::new(handle);
        state.client = Some(client.clone());
        self.connect_to_agent(state, &client).await;
        Ok(())
    }

    /// Best effort; failures are logged and the connection stays usable.
    async fn connect_to_agent(&self, state: &mut ConnectionState, client: &Client) {
        if self.config.disable_agent_forwarding {
            info!("SSH agent forwarding is disabled");
            return;
        }
        let socket = std::env::var("SSH_AUTH_SOCK").unwrap_or_default();
        if socket.is_empty() {
            info!("no local agent socket, will not connect agent");
            return;
        }

        #[cfg(unix)]
        {
            if let Err(e) = tokio::net::UnixStream::connect(&socket).await {
                error!(error = %e, "could not connect to local agent socket");
                return;
            }
            state.agent_forwarding = true;

            let channel = match client.channel_open_session().await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(error = %e, "error creating session for agent forwarding");
                    return;
                }
            };
            match channel.agent_forward(true).await {
                Ok(()) => info!("agent forwarding enabled"),
                Err(e) => error!(error = %e, "request agent forwarding failed"),
            }
            let _ = channel.close().await;
        }

        #[cfg(not(unix))]
        {
            let _ = (state, client);
            info!("agent forwarding is not supported on this platform");
        }
    }

    /// Opens a session channel, reconnecting once if there is no usable
    /// connection.
    async fn new_session(&self) -> Result<(Channel<Msg>, Client)> {
        let mut state = self.state.lock().await;
        debug!("opening new ssh session");

        let first = match &state.client {
            Some(client) => client
                .channel_open_session()
                .await
                .map(|channel| (channel, client.clone()))
                .map_err(CommunicatorError::from),
            None => Err(CommunicatorError::ClientNotAvailable),
        };
        match first {
            Ok(opened) => Ok(opened),
            Err(e) => {
                error!(error = %e, "ssh session open error, attempting reconnect");
                self.reconnect(&mut state).await?;
                let client = state
                    .client
                    .clone()
                    .ok_or(CommunicatorError::ClientNotAvailable)?;
                let channel = client.channel_open_session().await?;
                Ok((channel, client))
            }
        }
    }

    async fn agent_forwarding(&self) -> bool {
        self.state.lock().await.agent_forwarding
    }

    fn spawn_keepalive(&self, client: Client) -> CancellationToken {
        let token = CancellationToken::new();
        let interval = self.config.keep_alive_interval;
        if interval.is_zero() {
            return token;
        }

        let stop = token.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            debug!("sending keepalive");
                            if let Err(e) = client.send_keepalive(true).await {
                                debug!(error = %e, "keepalive failed");
                            }
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        );
        token
    }

    async fn start_command(&self, cmd: &mut Cmd) -> Result<()> {
        let (channel, client) = self.new_session().await?;

        if self.config.pty {
            channel
                .request_pty(
                    true,
                    "xterm",
                    80,
                    40,
                    0,
                    0,
                    &[
                        (Pty::ECHO, 0),
                        (Pty::TTY_OP_ISPEED, 14400),
                        (Pty::TTY_OP_OSPEED, 14400),
                    ],
                )
                .await?;
        }
        if self.agent_forwarding().await {
            if let Err(e) = channel.agent_forward(false).await {
                warn!(error = %e, "agent forwarding request failed");
            }
        }

        let command = cmd.command().to_string();
        debug!(%command, "starting remote command");
        channel.exec(true, command.as_str()).await?;

        match cmd.take_stdin() {
            Some(mut stdin) => {
                let mut writer = channel.make_writer();
                tokio::spawn(
                    async move {
                        if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
                            debug!(error = %e, "stdin copy ended");
                        }
                        let _ = writer.shutdown().await;
                    }
                    .instrument(self.span.clone()),
                );
            }
            None => {
                // Fast commands may already have closed the channel.
                if let Err(e) = channel.eof().await {
                    debug!(error = %e, "closing remote stdin");
                }
            }
        }

        let mut stdout = cmd.take_stdout().unwrap_or_else(|| Box::new(tokio::io::sink()));
        let mut stderr = cmd.take_stderr().unwrap_or_else(|| Box::new(tokio::io::sink()));
        let keepalive = self.spawn_keepalive(client);
        let exit = cmd.exit_handle();

        tokio::spawn(
            async move {
                let outcome = pump_session(channel, &mut stdout, &mut stderr).await;
                keepalive.cancel();
                drop(stdout);
                drop(stderr);

                let (status, err) = outcome.into_exit_status();
                match &err {
                    Some(CommunicatorError::ExitMissing) => {
                        error!(%command, "remote command exited without exit status or exit signal")
                    }
                    Some(e) => error!(%command, error = %e, "remote command failed"),
                    None if status != 0 => {
                        error!(%command, status, "remote command exited with non-zero exit status")
                    }
                    None => debug!(%command, "remote command exited"),
                }
                exit.set_exit_status(status, err);
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }
}

#[async_trait]
impl Communicator for SshCommunicator {
    async fn connect(&self) -> Result<()> {
        async {
            let mut state = self.state.lock().await;
            self.reconnect(&mut state).await
        }
        .instrument(self.span.clone())
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        async {
            let client = self.state.lock().await.client.take();
            match client {
                Some(client) => {
                    info!("closing SSH connection");
                    client
                        .disconnect(Disconnect::ByApplication, "", "English")
                        .await?;
                    Ok(())
                }
                None => Err(CommunicatorError::NotConnected),
            }
        }
        .instrument(self.span.clone())
        .await
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
            debug!(dst, "uploading");
            if self.config.use_sftp {
                self.sftp_upload(dst, input, info).await
            } else {
                self.scp_upload(dst, input, info).await
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn upload_dir(&self, dst: &str, src: &Path, excludes: &[String]) -> Result<()> {
        async {
            debug!(src = %src.display(), dst, "uploading directory");
            if self.config.use_sftp {
                self.sftp_upload_dir(dst, src, excludes).await
            } else {
                self.scp_upload_dir(dst, src, excludes).await
            }
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
            debug!(path, "downloading");
            if self.config.use_sftp {
                self.sftp_download(path, output).await
            } else {
                self.scp_download(path, output).await
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Always uses SCP, whatever `use_sftp` says.
    async fn download_dir(&self, src: &str, dst: &Path, excludes: &[String]) -> Result<()> {
        async {
            debug!(src, dst = %dst.display(), "downloading directory");
            self.scp_download_dir(src, dst, excludes).await
        }
        .instrument(self.span.clone())
        .await
    }
}
