use std::borrow::Cow;
use std::time::Duration;

use guestcomm::communicator::ssh::{AuthMethod, ClientConfig, SshCommunicator, SshConfig};
use testcontainers::core::{Image, WaitFor};
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};

pub const ROOT_PASSWORD: &str = "password";

/// A helper SSH server container based on Debian Slim.
#[derive(Debug, Clone, Default)]
pub struct SshServer;

impl Image for SshServer {
    fn name(&self) -> &str {
        "debian"
    }

    fn tag(&self) -> &str {
        "12-slim"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        vec![WaitFor::message_on_stderr("Server listening on")]
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<Item = (impl Into<Cow<'_, str>>, impl Into<Cow<'_, str>>)> {
        vec![(
            Cow::Borrowed("DEBIAN_FRONTEND"),
            Cow::Borrowed("noninteractive"),
        )]
    }

    fn copy_to_sources(&self) -> impl IntoIterator<Item = &testcontainers::CopyToContainer> {
        std::iter::empty()
    }

    fn cmd(&self) -> impl IntoIterator<Item = impl Into<Cow<'_, str>>> {
        let script = format!(
            "apt-get update && apt-get install -y openssh-server && \
apt-get clean && rm -rf /var/lib/apt/lists/* && \
mkdir -p /var/run/sshd && \
echo 'root:{password}' | chpasswd && \
sed -i 's/#PermitRootLogin prohibit-password/PermitRootLogin yes/' /etc/ssh/sshd_config && \
sed -i 's/#PasswordAuthentication yes/PasswordAuthentication yes/' /etc/ssh/sshd_config && \
/usr/sbin/sshd -D -e",
            password = ROOT_PASSWORD
        );
        vec![Cow::Borrowed("sh"), Cow::Borrowed("-c"), Cow::Owned(script)]
    }
}

/// Start SSH server container and return container and mapped host port
pub async fn start_ssh_server() -> (ContainerAsync<SshServer>, u16) {
    let container = SshServer
        .with_mapped_port(0, 22.tcp())
        .start()
        .await
        .expect("failed to start SSH container");
    let port = container
        .get_host_port_ipv4(22)
        .await
        .expect("SSH port not mapped");
    (container, port)
}

/// A communicator logged in as root with password auth.
pub fn communicator(port: u16, use_sftp: bool) -> SshCommunicator {
    let client =
        ClientConfig::new("root").with_auth(AuthMethod::Password(ROOT_PASSWORD.to_string()));
    SshCommunicator::new(
        SshConfig::tcp("127.0.0.1", port, client)
            .with_sftp(use_sftp)
            .with_agent_forwarding(false)
            .with_timeout(Duration::from_secs(30)),
    )
}
