//! Ways of obtaining the byte stream an SSH transport runs over.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_socks::tcp::Socks5Stream;

use super::ssh::auth::handshake;
use super::ssh::config::{ClientConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use super::ssh::handler::ClientHandler;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("no addresses found for {0}")]
    NoAddresses(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("SOCKS5 proxy {proxy}: {source}")]
    Socks {
        proxy: String,
        source: tokio_socks::Error,
    },

    #[error("bastion {bastion}: {message}")]
    Bastion { bastion: String, message: String },
}

/// Produces a connected stream to one remote host.
///
/// Each `dial` yields a fresh connection; communicators call it again on
/// every reconnect.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream, DialError>;

    /// Host the stream ultimately reaches, for host key checks and logging.
    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn address(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

impl fmt::Debug for dyn Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dialer({})", self.address())
    }
}

/// Direct TCP with keepalive enabled.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect_one(addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn connect(&self) -> Result<TcpStream, DialError> {
        let addr = self.address();
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|source| DialError::Resolve {
                addr: addr.clone(),
                source,
            })?
            .collect();

        let mut last_error = None;
        for candidate in candidates {
            tracing::debug!(%candidate, "connecting");
            match Self::connect_one(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(source) => Err(DialError::Connect { addr, source }),
            None => Err(DialError::NoAddresses(addr)),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<BoxedStream, DialError> {
        match tokio::time::timeout(self.timeout, self.connect()).await {
            Ok(stream) => Ok(Box::new(stream?)),
            Err(_) => Err(DialError::Timeout {
                addr: self.address(),
                timeout: self.timeout,
            }),
        }
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Clone)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Connects through a SOCKS5 proxy; name resolution happens at the proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
    host: String,
    port: u16,
    credentials: Option<ProxyCredentials>,
    timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy: proxy.into(),
            host: host.into(),
            port,
            credentials: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream, DialError> {
        let target = (self.host.as_str(), self.port);
        let stream = match &self.credentials {
            Some(c) => {
                Socks5Stream::connect_with_password(
                    self.proxy.as_str(),
                    target,
                    &c.username,
                    &c.password,
                )
                .await
            }
            None => Socks5Stream::connect(self.proxy.as_str(), target).await,
        }
        .map_err(|source| DialError::Socks {
            proxy: self.proxy.clone(),
            source,
        })?;
        Ok(stream.into_inner())
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self) -> Result<BoxedStream, DialError> {
        tracing::debug!(proxy = %self.proxy, target = %self.address(), "connecting via SOCKS5");
        match tokio::time::timeout(self.timeout, self.connect()).await {
            Ok(stream) => Ok(Box::new(stream?)),
            Err(_) => Err(DialError::Timeout {
                addr: self.proxy.clone(),
                timeout: self.timeout,
            }),
        }
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Tunnels through an SSH jump host with a `direct-tcpip` channel.
///
/// Every dial opens a new connection to the bastion; it is torn down when
/// the returned stream is dropped.
pub struct BastionDialer {
    bastion: Arc<dyn Dialer>,
    client: ClientConfig,
    host: String,
    port: u16,
}

impl fmt::Debug for BastionDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BastionDialer")
            .field("bastion", &self.bastion.address())
            .field("client", &self.client)
            .field("target", &self.address())
            .finish()
    }
}

impl BastionDialer {
    pub fn new(
        bastion: Arc<dyn Dialer>,
        client: ClientConfig,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            bastion,
            client,
            host: host.into(),
            port,
        }
    }

    fn failure(&self, message: impl fmt::Display) -> DialError {
        DialError::Bastion {
            bastion: self.bastion.address(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for BastionDialer {
    async fn dial(&self) -> Result<BoxedStream, DialError> {
        tracing::debug!(bastion = %self.bastion.address(), target = %self.address(), "connecting via bastion");
        let stream = self.bastion.dial().await?;
        let handler = ClientHandler::new(
            self.bastion.host(),
            self.bastion.port(),
            self.client.host_key_policy.clone(),
            false,
        );
        let handle = tokio::time::timeout(
            DEFAULT_HANDSHAKE_TIMEOUT,
            handshake(stream, handler, &self.client, false),
        )
        .await
        .map_err(|_| self.failure("Timeout during SSH handshake"))?
        .map_err(|e| self.failure(e))?;

        let channel = handle
            .channel_open_direct_tcpip(self.host.as_str(), u32::from(self.port), "127.0.0.1", 0)
            .await
            .map_err(|e| self.failure(e))?;

        Ok(Box::new(BastionStream {
            inner: channel.into_stream(),
            bastion: Some(handle),
        }))
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// A tunnelled channel that keeps its bastion connection alive.
struct BastionStream<S> {
    inner: S,
    bastion: Option<Handle<ClientHandler>>,
}

impl<S> Drop for BastionStream<S> {
    fn drop(&mut self) {
        let Some(bastion) = self.bastion.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = bastion
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
            });
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BastionStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BastionStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        });

        let dialer = TcpDialer::new("127.0.0.1", port);
        assert_eq!(dialer.address(), format!("127.0.0.1:{port}"));
        let mut stream = dialer.dial().await.unwrap();
        let mut banner = String::new();
        stream.read_to_string(&mut banner).await.unwrap();
        assert_eq!(banner, "SSH-2.0-test\r\n");
    }

    #[tokio::test]
    async fn test_tcp_dialer_reports_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpDialer::new("127.0.0.1", port).dial().await.err().unwrap();
        assert!(matches!(err, DialError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_socks5_dialer_speaks_no_auth_handshake() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = proxy.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            socket.write_all(&[5, 0]).await.unwrap();

            // CONNECT request for a domain name target.
            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut name = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut name).await.unwrap();
            assert_eq!(&name[..name.len() - 2], b"guest.local");

            socket
                .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 22])
                .await
                .unwrap();
            socket.write_all(b"tunnelled").await.unwrap();
        });

        let dialer = Socks5Dialer::new(proxy_addr.to_string(), "guest.local", 22);
        let mut stream = dialer.dial().await.unwrap();
        let mut data = String::new();
        stream.read_to_string(&mut data).await.unwrap();
        assert_eq!(data, "tunnelled");
    }
}
