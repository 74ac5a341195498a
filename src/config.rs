//! Named connection profiles loaded from YAML.
//!
//! ```yaml
//! web:
//!   host: 10.0.0.5
//!   user: deploy
//!   identity_file: ~/.ssh/id_ed25519
//!   bastion:
//!     host: jump.example.com
//! win:
//!   kind: winrm
//!   host: 10.0.0.9
//!   user: Administrator
//!   password: secret
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::communicator::dial::{BastionDialer, Dialer, ProxyCredentials, Socks5Dialer, TcpDialer};
use crate::communicator::ssh::{AuthMethod, ClientConfig, HostKeyPolicy, KnownHosts, SshConfig};
use crate::communicator::winrm::{WinRmConfig, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use crate::communicator::{Communicator, CommunicatorError, SshCommunicator, WinRmCommunicator};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid profiles file {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("Profile '{profile}': {message}")]
    Invalid { profile: String, message: String },

    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    Ssh,
    Winrm,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::Ssh => write!(f, "ssh"),
            ProfileKind::Winrm => write!(f, "winrm"),
        }
    }
}

/// A SOCKS5 proxy in front of the target.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyProfile {
    /// `host:port` of the proxy.
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// An SSH jump host the target is reached through.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BastionProfile {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub kind: ProfileKind,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub use_sftp: bool,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub disable_agent_forwarding: bool,
    /// Check host keys against this known_hosts file.
    pub known_hosts: Option<PathBuf>,
    /// Reject hosts missing from `known_hosts` instead of warning.
    #[serde(default)]
    pub strict_host_key_checking: bool,
    pub keep_alive_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub proxy: Option<ProxyProfile>,
    pub bastion: Option<BastionProfile>,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub insecure: bool,
}

impl Profile {
    /// An SSH profile for an ad-hoc `[user@]host[:port]` target.
    pub fn ssh(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ProfileKind::Ssh,
            host: host.into(),
            port: Some(port),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn port(&self) -> u16 {
        match (self.port, self.kind) {
            (Some(port), _) => port,
            (None, ProfileKind::Ssh) => DEFAULT_SSH_PORT,
            (None, ProfileKind::Winrm) if self.https => DEFAULT_HTTPS_PORT,
            (None, ProfileKind::Winrm) => DEFAULT_HTTP_PORT,
        }
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_SSH_USER)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(0))
    }

    /// Resolves the settings for an SSH communicator, loading the known
    /// hosts file if one is configured.
    pub async fn ssh_config(&self, name: &str) -> Result<SshConfig, ConfigError> {
        if self.kind != ProfileKind::Ssh {
            return Err(invalid(name, "not an SSH profile"));
        }
        if self.proxy.is_some() && self.bastion.is_some() {
            return Err(invalid(name, "proxy and bastion cannot be combined"));
        }

        let host_key_policy = match &self.known_hosts {
            Some(path) => {
                let hosts = KnownHosts::load(&expand_home(path)).await?;
                HostKeyPolicy::KnownHosts {
                    hosts,
                    strict: self.strict_host_key_checking,
                }
            }
            None => HostKeyPolicy::AcceptAny,
        };
        let client = client_config(
            self.user(),
            self.password.as_deref(),
            self.identity_file.as_deref(),
            host_key_policy.clone(),
        );

        let dialer: Arc<dyn Dialer> = if let Some(bastion) = &self.bastion {
            let bastion_dialer = Arc::new(TcpDialer::new(
                bastion.host.clone(),
                bastion.port.unwrap_or(DEFAULT_SSH_PORT),
            ));
            let bastion_client = client_config(
                bastion.user.as_deref().unwrap_or(self.user()),
                bastion.password.as_deref(),
                bastion.identity_file.as_deref(),
                host_key_policy,
            );
            Arc::new(BastionDialer::new(
                bastion_dialer,
                bastion_client,
                self.host.clone(),
                self.port(),
            ))
        } else if let Some(proxy) = &self.proxy {
            let mut dialer = Socks5Dialer::new(proxy.address.clone(), self.host.clone(), self.port());
            if let Some(username) = &proxy.username {
                dialer = dialer.with_credentials(ProxyCredentials {
                    username: username.clone(),
                    password: proxy.password.clone().unwrap_or_default(),
                });
            }
            Arc::new(dialer)
        } else {
            Arc::new(TcpDialer::new(self.host.clone(), self.port()))
        };

        let mut config = SshConfig::new(dialer, client)
            .with_pty(self.pty)
            .with_sftp(self.use_sftp)
            .with_agent_forwarding(!self.disable_agent_forwarding)
            .with_timeout(self.timeout());
        if let Some(secs) = self.keep_alive_secs {
            config = config.with_keep_alive_interval(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn winrm_config(&self, name: &str) -> Result<WinRmConfig, ConfigError> {
        if self.kind != ProfileKind::Winrm {
            return Err(invalid(name, "not a WinRM profile"));
        }
        let user = self
            .user
            .as_deref()
            .ok_or_else(|| invalid(name, "WinRM needs a user"))?;
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| invalid(name, "WinRM needs a password"))?;

        let mut config =
            WinRmConfig::new(self.host.clone(), self.port(), user, password).with_timeout(self.timeout());
        if self.https {
            config = config.with_https(self.insecure);
        }
        Ok(config)
    }

    /// Builds the communicator this profile describes.
    pub async fn communicator(&self, name: &str) -> Result<Box<dyn Communicator>, ConfigError> {
        debug!(profile = name, kind = %self.kind, host = %self.host, "building communicator");
        match self.kind {
            ProfileKind::Ssh => Ok(Box::new(SshCommunicator::new(self.ssh_config(name).await?))),
            ProfileKind::Winrm => Ok(Box::new(WinRmCommunicator::new(self.winrm_config(name)?)?)),
        }
    }
}

fn invalid(profile: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        profile: profile.to_string(),
        message: message.to_string(),
    }
}

fn client_config(
    user: &str,
    password: Option<&str>,
    identity_file: Option<&Path>,
    host_key_policy: HostKeyPolicy,
) -> ClientConfig {
    let mut client = ClientConfig::new(user).with_host_key_policy(host_key_policy);
    let keys: Vec<PathBuf> = match identity_file {
        Some(path) => vec![expand_home(path)],
        None => default_identity_files(),
    };
    for path in keys {
        client = client.with_auth(AuthMethod::PrivateKeyFile {
            path,
            passphrase: None,
        });
    }
    if let Some(password) = password {
        client = client.with_auth(AuthMethod::Password(password.to_string()));
    }
    client.with_auth(AuthMethod::Agent)
}

/// `~/.ssh/id_ed25519` and `~/.ssh/id_rsa`, whichever exist.
pub fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// All profiles in one file, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Profiles {
    profiles: BTreeMap<String, Profile>,
}

impl Profiles {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        match Self::parse(&content) {
            Err(ConfigError::YamlError(source)) => Err(ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            }),
            other => other,
        }
    }

    /// Loads the default profiles file; a missing file means no profiles.
    pub async fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).await,
            Some(path) => {
                debug!(path = %path.display(), "no profiles file");
                Ok(Self::default())
            }
            None => {
                warn!("could not determine config directory, no profiles loaded");
                Ok(Self::default())
            }
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("guestcomm").join("profiles.yaml"))
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Profile)> {
        self.profiles.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
