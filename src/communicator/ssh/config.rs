use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PrivateKey;

use super::known_hosts::KnownHosts;
use crate::communicator::dial::{Dialer, TcpDialer};

/// How long a handshake (key exchange plus authentication) may take when
/// `SshConfig::handshake_timeout` is zero.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// One way of proving identity to the server. Methods are tried in order.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PrivateKeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    PrivateKey(Arc<PrivateKey>),
    /// Every identity offered by the agent at `SSH_AUTH_SOCK`.
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => write!(f, "Password(..)"),
            AuthMethod::PrivateKeyFile { path, .. } => f
                .debug_struct("PrivateKeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
            AuthMethod::PrivateKey(_) => write!(f, "PrivateKey(..)"),
            AuthMethod::Agent => write!(f, "Agent"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    /// Check against known hosts. Unknown hosts are accepted with a warning
    /// unless `strict` is set; mismatches are always rejected.
    KnownHosts { hosts: KnownHosts, strict: bool },
}

/// What is needed to bring up and authenticate an SSH transport over an
/// already dialed stream.
#[derive(Clone)]
pub struct ClientConfig {
    pub user: String,
    pub auth: Vec<AuthMethod>,
    pub host_key_policy: HostKeyPolicy,
    pub transport: Arc<client::Config>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("host_key_policy", &self.host_key_policy)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            auth: Vec::new(),
            host_key_policy: HostKeyPolicy::default(),
            transport: Arc::new(client::Config::default()),
        }
    }

    pub fn with_auth(mut self, method: AuthMethod) -> Self {
        self.auth.push(method);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }
}

/// Settings for [`SshCommunicator`](super::SshCommunicator).
#[derive(Clone)]
pub struct SshConfig {
    pub client: ClientConfig,
    pub dialer: Arc<dyn Dialer>,
    /// Request a pseudo-terminal for commands.
    pub pty: bool,
    pub disable_agent_forwarding: bool,
    /// Zero means [`DEFAULT_HANDSHAKE_TIMEOUT`].
    pub handshake_timeout: Duration,
    /// Transfer files over SFTP instead of SCP.
    pub use_sftp: bool,
    /// Zero disables keepalives.
    pub keep_alive_interval: Duration,
    /// Read/write idle deadline on the transport. Zero means none.
    pub timeout: Duration,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("client", &self.client)
            .field("address", &self.dialer.address())
            .field("pty", &self.pty)
            .field("disable_agent_forwarding", &self.disable_agent_forwarding)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("use_sftp", &self.use_sftp)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SshConfig {
    pub fn new(dialer: Arc<dyn Dialer>, client: ClientConfig) -> Self {
        Self {
            client,
            dialer,
            pty: false,
            disable_agent_forwarding: false,
            handshake_timeout: Duration::ZERO,
            use_sftp: false,
            keep_alive_interval: Duration::from_secs(5),
            timeout: Duration::ZERO,
        }
    }

    /// Plain TCP to `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16, client: ClientConfig) -> Self {
        Self::new(Arc::new(TcpDialer::new(host, port)), client)
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_sftp(mut self, use_sftp: bool) -> Self {
        self.use_sftp = use_sftp;
        self
    }

    pub fn with_agent_forwarding(mut self, enabled: bool) -> Self {
        self.disable_agent_forwarding = !enabled;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn effective_handshake_timeout(&self) -> Duration {
        if self.handshake_timeout.is_zero() {
            DEFAULT_HANDSHAKE_TIMEOUT
        } else {
            self.handshake_timeout
        }
    }
}
