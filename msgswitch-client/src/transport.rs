//! How sessions reach a broker.
//!
//! Sessions never open sockets themselves: they ask a [`Transport`] for a
//! byte stream to an endpoint and run the wire protocol over it. The
//! transport is shared between sessions, which only borrow it.

use crate::stream::BrokerStream;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The byte stream produced by [`Transport::connect`].
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens a new connection. Dropping or shutting down the stream disconnects it.
    async fn connect(&self, endpoint: &str) -> io::Result<Self::Stream>;
}

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> io::Result<Self> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid_endpoint(endpoint));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(endpoint.to_string()))
            }
            _ => Err(invalid_endpoint(endpoint)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => f.write_str(addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

fn invalid_endpoint(endpoint: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("expected host:port or unix:/path, got '{endpoint}'"),
    )
}

/// Connects over TCP or a Unix domain socket depending on the endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerTransport;

impl BrokerTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    type Stream = BrokerStream;

    async fn connect(&self, endpoint: &str) -> io::Result<BrokerStream> {
        match Endpoint::parse(endpoint)? {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(&addr).await?;
                stream.set_nodelay(true).ok();
                tracing::debug!("Connected to broker at {}", addr);
                Ok(BrokerStream::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(&path).await?;
                tracing::debug!("Connected to broker at unix:{}", path.display());
                Ok(BrokerStream::Unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets are unavailable: {}", path.display()),
            )),
        }
    }
}
