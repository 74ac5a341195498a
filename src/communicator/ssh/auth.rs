use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::{self, PrivateKey};

use super::config::{AuthMethod, ClientConfig};
use super::handler::ClientHandler;
use crate::communicator::dial::BoxedStream;
use crate::communicator::error::{CommunicatorError, Result};

/// Runs key exchange over `stream` and authenticates. `with_agent` adds agent
/// identities after the configured methods.
pub(crate) async fn handshake(
    stream: BoxedStream,
    handler: ClientHandler,
    config: &ClientConfig,
    with_agent: bool,
) -> Result<Handle<ClientHandler>> {
    let mut handle = client::connect_stream(config.transport.clone(), stream, handler).await?;

    let mut methods = config.auth.clone();
    if with_agent && !methods.iter().any(|m| matches!(m, AuthMethod::Agent)) {
        methods.push(AuthMethod::Agent);
    }
    authenticate(&mut handle, &config.user, &methods).await?;
    Ok(handle)
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    methods: &[AuthMethod],
) -> Result<()> {
    if methods.is_empty() {
        return Err(CommunicatorError::AuthenticationFailed(
            "no authentication methods configured".to_string(),
        ));
    }

    for method in methods {
        let accepted = match method {
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await?
                .success(),
            AuthMethod::PrivateKeyFile { path, passphrase } => {
                match keys::load_secret_key(path, passphrase.as_deref()) {
                    Ok(key) => authenticate_key(handle, user, Arc::new(key)).await?,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to load private key");
                        false
                    }
                }
            }
            AuthMethod::PrivateKey(key) => authenticate_key(handle, user, key.clone()).await?,
            AuthMethod::Agent => authenticate_agent(handle, user).await,
        };
        if accepted {
            tracing::debug!(?method, "authenticated");
            return Ok(());
        }
        tracing::debug!(?method, "authentication method rejected");
    }

    Err(CommunicatorError::AuthenticationFailed(format!(
        "unable to authenticate as {}: all methods rejected",
        user
    )))
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: Arc<PrivateKey>,
) -> Result<bool> {
    // Negotiated RSA hash, or None for non-RSA keys and servers without
    // the server-sig-algs extension.
    let best_hash = handle.best_supported_rsa_hash().await?.flatten();
    tracing::debug!("Using RSA hash algorithm: {:?}", best_hash);

    let result = handle
        .authenticate_publickey(user, keys::key::PrivateKeyWithHashAlg::new(key, best_hash))
        .await?;
    Ok(result.success())
}

#[cfg(unix)]
async fn authenticate_agent(handle: &mut Handle<ClientHandler>, user: &str) -> bool {
    let mut agent = match keys::agent::client::AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::debug!(error = %e, "ssh agent unavailable");
            return false;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list agent identities");
            return false;
        }
    };
    let best_hash = match handle.best_supported_rsa_hash().await {
        Ok(hash) => hash.flatten(),
        Err(_) => None,
    };

    for key in identities {
        match handle
            .authenticate_publickey_with(user, key, best_hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return true,
            Ok(_) => {}
            Err(e) => tracing::debug!(error = ?e, "agent signing failed"),
        }
    }
    false
}

#[cfg(not(unix))]
async fn authenticate_agent(_handle: &mut Handle<ClientHandler>, _user: &str) -> bool {
    tracing::debug!("ssh agent authentication is only supported on unix");
    false
}
