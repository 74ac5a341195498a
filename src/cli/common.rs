use super::error::CliError;
use super::parser::Cli;
use super::ui;
use crate::communicator::{Communicator, CommunicatorExt};
use crate::config::{Profile, Profiles, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

// Helper struct to hold parsed SSH target details
#[derive(Debug, PartialEq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

// Parsing function using the url crate
pub fn parse_ssh_target(target_str: &str) -> Result<SshTarget, CliError> {
    // Prepend scheme if missing to satisfy Url::parse requirements
    let parse_input = if target_str.contains("://") {
        target_str.to_string()
    } else {
        format!("ssh://{}", target_str)
    };

    let url = Url::parse(&parse_input).map_err(|e| {
        CliError::ConfigError(format!("Invalid target format '{}': {}", target_str, e))
    })?;

    let user = if url.username().is_empty() {
        DEFAULT_SSH_USER.to_string()
    } else {
        url.username().to_string()
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CliError::ConfigError(format!("Missing host in target '{}'", target_str)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = url.port().unwrap_or(DEFAULT_SSH_PORT);

    Ok(SshTarget { user, host, port })
}

async fn load_profiles(cli: &Cli) -> Result<Profiles, CliError> {
    Ok(match &cli.config {
        Some(path) => Profiles::load(path).await?,
        None => Profiles::load_default().await?,
    })
}

/// A profile name from the profiles file, or an ad-hoc `[user@]host[:port]`
/// SSH target. Command-line flags override what the profile says.
pub async fn resolve_target(cli: &Cli, target: &str) -> Result<(String, Profile), CliError> {
    let profiles = load_profiles(cli).await?;
    let mut profile = match profiles.get(target) {
        Some(profile) => {
            debug!(profile = target, "using configured profile");
            profile.clone()
        }
        None => {
            let parsed = parse_ssh_target(target)?;
            Profile::ssh(parsed.user, parsed.host, parsed.port)
        }
    };

    if let Some(identity) = &cli.identity_file {
        profile.identity_file = Some(identity.clone());
    }
    if let Some(password) = &cli.password {
        profile.password = Some(password.clone());
    }
    profile.use_sftp |= cli.sftp;
    profile.pty |= cli.pty;
    Ok((target.to_string(), profile))
}

/// Builds the communicator for `target` and waits until it is reachable.
pub async fn connect(cli: &Cli, target: &str) -> Result<Box<dyn Communicator>, CliError> {
    let (name, profile) = resolve_target(cli, target).await?;
    debug!(user = %profile.user(), host = %profile.host, port = profile.port(), kind = %profile.kind, "connection details");
    let comm = profile.communicator(&name).await?;

    let pb = ui::create_spinner(
        &format!("Connecting to {}...", ui::format_highlight(target)),
        !cli.no_progress,
    );
    let timeout = Duration::from_secs(cli.connect_timeout);
    if let Err(e) = comm.wait_for_ready(timeout).await {
        pb.finish_and_clear();
        return Err(CliError::OperationFailed(format!(
            "Connection to {} failed: {}",
            target, e
        )));
    }
    pb.finish_and_clear();
    info!("Connected to {}", ui::format_highlight(target));
    Ok(comm)
}

/// Closes the connection; a communicator that was never connected is fine.
pub async fn disconnect(comm: &dyn Communicator) {
    if let Err(e) = comm.disconnect().await {
        debug!(error = %e, "disconnect");
    }
}
