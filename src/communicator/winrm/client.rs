//! HTTP transport for WS-Management plus the shell and command handles
//! built on it.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::soap::{self, Envelope};
use super::{WinRmConfig, WinRmError};

/// Extra time the HTTP request gets on top of the WS-Man operation timeout,
/// so the service's own `TimedOut` fault arrives before reqwest gives up.
const HTTP_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct WinRmClient {
    http: reqwest::Client,
    url: Arc<str>,
    username: Arc<str>,
    password: Arc<str>,
    envelope: Envelope,
}

impl std::fmt::Debug for WinRmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmClient")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl WinRmClient {
    pub fn new(config: &WinRmConfig) -> Result<Self, WinRmError> {
        Self::with_operation_timeout(config, config.operation_timeout())
    }

    pub fn with_operation_timeout(
        config: &WinRmConfig,
        operation_timeout: Duration,
    ) -> Result<Self, WinRmError> {
        let mut builder = reqwest::Client::builder().timeout(operation_timeout + HTTP_GRACE);
        if config.https && config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(decorate) = &config.transport_decorator {
            builder = decorate(builder);
        }

        let url = config.endpoint();
        Ok(Self {
            http: builder.build()?,
            envelope: Envelope::new(url.clone(), operation_timeout),
            url: url.into(),
            username: config.username.as_str().into(),
            password: config.password.as_str().into(),
        })
    }

    pub(crate) async fn post(&self, body: String) -> Result<String, WinRmError> {
        trace!(request = %body, "sending WS-Man request");
        let response = self
            .http
            .post(&*self.url)
            .basic_auth(&*self.username, Some(&*self.password))
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        trace!(%status, response = %text, "received WS-Man response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(WinRmError::Unauthorized);
        }
        if let Some(fault) = soap::parse_fault(&text) {
            if !status.is_success() {
                return Err(WinRmError::Fault(fault));
            }
        }
        if !status.is_success() {
            return Err(WinRmError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    pub async fn create_shell(&self) -> Result<Shell, WinRmError> {
        let response = self.post(self.envelope.create_shell()).await?;
        let id = soap::parse_shell_id(&response)?;
        debug!(shell = %id, "created remote shell");
        Ok(Shell {
            client: self.clone(),
            id,
        })
    }
}

/// An open remote `cmd` shell. Close it when done; the service limits how
/// many a user may hold.
#[derive(Debug)]
pub struct Shell {
    client: WinRmClient,
    id: String,
}

impl Shell {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn execute(&self, command: &str) -> Result<RemoteCommand, WinRmError> {
        let envelope = self.client.envelope.execute(&self.id, command);
        let response = self.client.post(envelope).await?;
        let id = soap::parse_command_id(&response)?;
        debug!(shell = %self.id, command = %id, "started remote command");
        Ok(RemoteCommand {
            client: self.client.clone(),
            shell_id: self.id.clone(),
            id,
        })
    }

    pub async fn close(self) -> Result<(), WinRmError> {
        let envelope = self.client.envelope.delete_shell(&self.id);
        self.client.post(envelope).await?;
        debug!(shell = %self.id, "closed remote shell");
        Ok(())
    }
}

#[derive(Debug)]
pub struct RemoteCommand {
    client: WinRmClient,
    shell_id: String,
    id: String,
}

impl RemoteCommand {
    pub async fn send_input(&self, input: &[u8], end: bool) -> Result<(), WinRmError> {
        let envelope = self.client.envelope.send(&self.shell_id, &self.id, input, end);
        self.client.post(envelope).await?;
        Ok(())
    }

    /// Polls until the command finishes, writing its output as it arrives.
    /// Returns the exit code.
    pub async fn relay_output<O, E>(&self, stdout: &mut O, stderr: &mut E) -> Result<i32, WinRmError>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            let envelope = self.client.envelope.receive(&self.shell_id, &self.id);
            let response = match self.client.post(envelope).await {
                Ok(response) => response,
                Err(WinRmError::Fault(fault)) if fault.is_timed_out() => {
                    trace!(command = %self.id, "receive timed out, polling again");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let output = soap::parse_receive(&response)?;
            if !output.stdout.is_empty() {
                stdout.write_all(&output.stdout).await?;
            }
            if !output.stderr.is_empty() {
                stderr.write_all(&output.stderr).await?;
            }
            if let Some(code) = output.exit_code {
                stdout.flush().await?;
                stderr.flush().await?;
                self.cleanup().await;
                return Ok(code);
            }
        }
    }

    async fn cleanup(&self) {
        let envelope = self.client.envelope.terminate(&self.shell_id, &self.id);
        if let Err(e) = self.client.post(envelope).await {
            warn!(command = %self.id, error = %e, "failed to clean up remote command");
        }
    }
}
