use colored::*;
use russh::client::{self, Msg};
use russh::keys::{self, PublicKeyBase64};
use russh::Channel;

use super::config::HostKeyPolicy;
use super::known_hosts::{host_pattern, HostKeyStatus};

/// Prints a formatted error message for a host key mismatch to stderr.
fn print_host_key_mismatch_error(host: &str, fingerprint: &str) {
    eprintln!(
        "{}\n{}\nHost: {}\nPresented Key Fingerprint (SHA256): {}\n{}\n{}\n{}",
        "!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!".red().bold(),
        "ERROR: HOST KEY VERIFICATION FAILED!".red().bold(),
        host.cyan(),
        fingerprint.yellow(),
        "The presented key does NOT MATCH any known key for this host.".red(),
        "Connection rejected. Check your known_hosts file and the server's configuration.".red(),
        "!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!".red().bold()
    );
}

/// Prints a formatted warning message for an unknown host key to stderr.
fn print_unknown_host_key_warning(host: &str, fingerprint: &str, key_base64: &str, rejected: bool) {
    let verdict = if rejected {
        "Strict host key checking is enabled. Connection rejected."
    } else {
        "Connecting anyway, but be aware of potential Man-in-the-Middle attacks."
    };
    eprintln!(
        "{}\nHost: {}\nKey Fingerprint (SHA256): {}\n{}\n{}",
        "WARNING: UNKNOWN HOST KEY DETECTED!".yellow().bold(),
        host.cyan(),
        fingerprint.yellow(),
        verdict.yellow(),
        format!(
            "Add the key to your known_hosts file ('{} {}') to trust it.",
            host.cyan(),
            key_base64.green()
        )
        .yellow(),
    );
}

/// russh client callbacks: host key verification and agent channels.
#[derive(Debug)]
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    forward_agent: bool,
}

impl ClientHandler {
    pub(crate) fn new(host: &str, port: u16, policy: HostKeyPolicy, forward_agent: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            policy,
            forward_agent,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(Default::default()).to_string();

        let (hosts, strict) = match &self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::debug!(host = %self.host, %fingerprint, "accepting host key without verification");
                return Ok(true);
            }
            HostKeyPolicy::KnownHosts { hosts, strict } => (hosts, *strict),
        };

        let pattern = host_pattern(&self.host, self.port);
        match hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyStatus::Trusted => {
                tracing::debug!("Host key for {} verified (fingerprint: {}).", pattern, fingerprint);
                Ok(true)
            }
            HostKeyStatus::Mismatch => {
                print_host_key_mismatch_error(&pattern, &fingerprint);
                Ok(false)
            }
            HostKeyStatus::Unknown => {
                print_unknown_host_key_warning(
                    &pattern,
                    &fingerprint,
                    &server_public_key.public_key_base64(),
                    strict,
                );
                Ok(!strict)
            }
        }
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if !self.forward_agent {
            tracing::debug!("ignoring agent channel, forwarding was not requested");
            return Ok(());
        }
        #[cfg(unix)]
        tokio::spawn(relay_agent_channel(channel));
        #[cfg(not(unix))]
        drop(channel);
        Ok(())
    }
}

/// Shuttles one forwarded agent channel to the local agent socket.
#[cfg(unix)]
async fn relay_agent_channel(channel: Channel<Msg>) {
    let Some(socket) = std::env::var_os("SSH_AUTH_SOCK") else {
        tracing::info!("SSH_AUTH_SOCK not set, dropping agent channel");
        return;
    };
    let mut agent = match tokio::net::UnixStream::connect(&socket).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to local ssh agent");
            return;
        }
    };
    let mut stream = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut agent).await {
        tracing::debug!(error = %e, "agent channel closed");
    }
}
