use std::collections::HashMap;
use std::path::{Path, PathBuf};

use russh::keys::{self, PublicKey};
use tokio::fs;

use crate::communicator::error::{CommunicatorError, Result};

/// Outcome of looking up a presented host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    Mismatch,
}

/// Public keys per host pattern, as read from an OpenSSH `known_hosts` file.
///
/// Hashed host entries (`|1|...`) and marker lines (`@revoked`,
/// `@cert-authority`) are skipped.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: HashMap<String, Vec<PublicKey>>,
}

impl KnownHosts {
    pub fn parse(content: &str) -> Self {
        let mut entries: HashMap<String, Vec<PublicKey>> = HashMap::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
                continue;
            }
            if let Some((hosts, key)) = parse_known_host_line(trimmed) {
                for host in hosts {
                    entries.entry(host).or_default().push(key.clone());
                }
            }
        }
        Self { entries }
    }

    /// Loads `path`. A missing file yields an empty set.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(
                "Known hosts file not found at '{}'. No host keys will be pre-trusted.",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            CommunicatorError::Other(format!(
                "Failed to read known_hosts file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::parse(&content))
    }

    /// `~/.ssh/known_hosts`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        match self.entries.get(&host_pattern(host, port)) {
            Some(known) if known.iter().any(|k| k == key) => HostKeyStatus::Trusted,
            Some(_) => HostKeyStatus::Mismatch,
            None => HostKeyStatus::Unknown,
        }
    }
}

/// The key OpenSSH files a host under: the bare host for port 22,
/// `[host]:port` otherwise.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn parse_known_host_line(line: &str) -> Option<(Vec<String>, PublicKey)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    let hosts_part = parts[0];
    if hosts_part.starts_with('|') {
        return None;
    }
    let key_data = parts[2];

    let hosts = hosts_part.split(',').map(String::from).collect();

    match keys::parse_public_key_base64(key_data) {
        Ok(key) => Some((hosts, key)),
        Err(_) => {
            tracing::warn!(
                "Failed to parse public key from known_hosts line '{}'",
                line
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::PublicKeyBase64;

    const HOST_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAII+m1sPfd7e1Sf33eWweBBP98Jy3I42yln4pv/lGlBZh";
    const OTHER_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIL//bN8BBbVybSsxmxEWqHv3i1veKcW7oINFW4bqWLUg";

    fn known_hosts() -> KnownHosts {
        KnownHosts::parse(&format!(
            "# comment\n\
             example.com,10.0.0.5 ssh-ed25519 {HOST_KEY}\n\
             [bastion.internal]:2222 ssh-ed25519 {OTHER_KEY}\n\
             |1|c2FsdA==|aGFzaA== ssh-ed25519 {OTHER_KEY}\n\
             @revoked * ssh-ed25519 {OTHER_KEY}\n\
             broken-line\n"
        ))
    }

    #[test]
    fn test_trusted_and_mismatch() {
        let hosts = known_hosts();
        let key = keys::parse_public_key_base64(HOST_KEY).unwrap();
        let other = keys::parse_public_key_base64(OTHER_KEY).unwrap();

        assert_eq!(hosts.verify("example.com", 22, &key), HostKeyStatus::Trusted);
        assert_eq!(hosts.verify("10.0.0.5", 22, &key), HostKeyStatus::Trusted);
        assert_eq!(hosts.verify("example.com", 22, &other), HostKeyStatus::Mismatch);
        assert_eq!(hosts.verify("unknown.org", 22, &key), HostKeyStatus::Unknown);
        assert_eq!(key.public_key_base64(), HOST_KEY);
    }

    #[test]
    fn test_non_default_port_uses_bracket_pattern() {
        let hosts = known_hosts();
        let other = keys::parse_public_key_base64(OTHER_KEY).unwrap();
        assert_eq!(
            hosts.verify("bastion.internal", 2222, &other),
            HostKeyStatus::Trusted
        );
        assert_eq!(
            hosts.verify("bastion.internal", 22, &other),
            HostKeyStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let hosts = KnownHosts::load(&dir.path().join("known_hosts")).await.unwrap();
        assert!(hosts.is_empty());
    }
}
