//! A single broker connection.
//!
//! The broker answers requests strictly in order, one reply per request, so a
//! connection carries at most one exchange at a time. Callers that share a
//! connection serialize access to it themselves.

use crate::error::{ClientError, ExchangeError};
use crate::transport::Transport;
use msgswitch_protocol::{
    Cursor, Decoder, Diagnostics, Encoder, Message, MessageId, QueueFilter, Request, Response,
    TraceEvent,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Allowance for one exchange on top of any long-poll wait it asks for.
    pub io_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// One open connection speaking the request/reply protocol.
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    buf: Vec<u8>,
    io_timeout: Duration,
    endpoint: String,
    /// Set while an exchange is between writing its request and decoding its reply.
    in_flight: bool,
}

impl<S> Connection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    /// Opens a connection through `transport`.
    pub async fn open<T>(
        transport: &T,
        endpoint: &str,
        config: &ConnectionConfig,
    ) -> Result<Self, ClientError>
    where
        T: Transport<Stream = S>,
    {
        tracing::debug!("Connecting to {}...", endpoint);
        let stream = tokio::time::timeout(config.connect_timeout, transport.connect(endpoint))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::communication(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {endpoint} timed out"),
                ))
            })?
            .map_err(|e| {
                tracing::debug!("Connection failed: {}", e);
                ClientError::from(e)
            })?;
        Ok(Self::from_stream(stream, endpoint, config))
    }

    pub fn from_stream(stream: S, endpoint: &str, config: &ConnectionConfig) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            buf: vec![0u8; config.read_buffer_size],
            io_timeout: config.io_timeout,
            endpoint: endpoint.to_string(),
            in_flight: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns whether an exchange was abandoned midway.
    ///
    /// A broken connection can no longer tell which reply belongs to which
    /// request and must be replaced.
    pub fn is_broken(&self) -> bool {
        self.in_flight
    }

    /// Sends `request` and waits for its reply.
    pub async fn exchange(&mut self, request: &Request) -> Result<Response, ExchangeError> {
        if self.in_flight {
            return Err(ExchangeError::Broken);
        }
        self.in_flight = true;

        let encoded = Encoder::encode_request(request)?;
        tracing::trace!(
            "Sending {} request ({} bytes) to {}",
            request.name(),
            encoded.len(),
            self.endpoint
        );
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;

        let limit = self.io_timeout + request.long_poll_timeout().unwrap_or_default();
        let reply = tokio::time::timeout(limit, self.read_reply())
            .await
            .map_err(|_| {
                ExchangeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no reply to {} within {:?}", request.name(), limit),
                ))
            })??;

        self.in_flight = false;
        if !reply.is_ok() {
            return Err(match reply.error {
                Some(error) => ExchangeError::Unsuccessful(error),
                None => ExchangeError::Unexpected {
                    expected: request.name(),
                    got: "error without details",
                },
            });
        }
        reply.response.ok_or(ExchangeError::Unexpected {
            expected: request.name(),
            got: "empty body",
        })
    }

    async fn read_reply(&mut self) -> Result<msgswitch_protocol::Reply, ExchangeError> {
        loop {
            if let Some(reply) = self.decoder.decode_reply()? {
                return Ok(reply);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.decoder.is_mid_reply() {
                    ExchangeError::Unterminated
                } else {
                    ExchangeError::Empty
                });
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }

    pub async fn login(&mut self, token: &str) -> Result<(), ExchangeError> {
        let request = Request::Login {
            token: token.to_string(),
        };
        match self.exchange(&request).await? {
            Response::Login => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Creates a transient queue and returns the name the broker chose.
    pub async fn create_transient(&mut self, token: &str) -> Result<String, ExchangeError> {
        let request = Request::CreateTransient {
            token: token.to_string(),
        };
        match self.exchange(&request).await? {
            Response::Create { name } => Ok(name),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn create_persistent(&mut self, name: &str) -> Result<String, ExchangeError> {
        let request = Request::CreatePersistent {
            name: name.to_string(),
        };
        match self.exchange(&request).await? {
            Response::Create { name } => Ok(name),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Enqueues `message`. Returns `None` when the queue does not exist.
    pub async fn send(
        &mut self,
        queue: &str,
        message: Message,
    ) -> Result<Option<MessageId>, ExchangeError> {
        let request = Request::Send {
            queue: queue.to_string(),
            message,
        };
        match self.exchange(&request).await? {
            Response::Send { id } => Ok(id),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn transfer(
        &mut self,
        from: Cursor,
        timeout: Duration,
        queues: Vec<String>,
    ) -> Result<(Vec<(MessageId, Message)>, Cursor), ExchangeError> {
        let request = Request::transfer(from, timeout, queues);
        match self.exchange(&request).await? {
            Response::Transfer { messages, next } => Ok((messages, next)),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn ack(&mut self, id: &MessageId) -> Result<(), ExchangeError> {
        let request = Request::Ack { id: id.clone() };
        match self.exchange(&request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn list(
        &mut self,
        prefix: &str,
        filter: QueueFilter,
    ) -> Result<Vec<String>, ExchangeError> {
        let request = Request::List {
            prefix: prefix.to_string(),
            filter,
        };
        match self.exchange(&request).await? {
            Response::List { queues } => Ok(queues),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn diagnostics(&mut self) -> Result<Diagnostics, ExchangeError> {
        let request = Request::Diagnostics;
        match self.exchange(&request).await? {
            Response::Diagnostics(diagnostics) => Ok(diagnostics),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn trace(
        &mut self,
        from: Option<u64>,
        timeout: Duration,
    ) -> Result<Vec<TraceEvent>, ExchangeError> {
        let request = Request::trace(from, timeout);
        match self.exchange(&request).await? {
            Response::Trace { events } => Ok(events),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn destroy(&mut self, queue: &str) -> Result<(), ExchangeError> {
        let request = Request::Destroy {
            queue: queue.to_string(),
        };
        match self.exchange(&request).await? {
            Response::Destroy => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), ExchangeError> {
        let request = Request::Shutdown;
        match self.exchange(&request).await? {
            Response::Shutdown => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) {
        tracing::debug!("Closing connection to {}", self.endpoint);
        let _ = self.stream.shutdown().await;
    }
}

fn unexpected(request: &Request, response: &Response) -> ExchangeError {
    ExchangeError::Unexpected {
        expected: request.name(),
        got: response.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use msgswitch_protocol::{ErrorCode, Reply, ReplyError};
    use tokio::io::DuplexStream;

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig::new().with_io_timeout(Duration::from_secs(5));
        (Connection::from_stream(client, "test", &config), server)
    }

    /// Reads one request from `server` and answers it with `reply` split into `chunk`-byte chunks.
    async fn answer(server: &mut DuplexStream, reply: Reply, chunk: usize) -> Request {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 1024];
        let request = loop {
            if let Some(request) = decoder.decode_request().unwrap() {
                break request;
            }
            let n = server.read(&mut buf).await.unwrap();
            decoder.extend(&buf[..n]);
        };
        let encoded = Encoder::encode_reply(&reply, chunk).unwrap();
        server.write_all(&encoded).await.unwrap();
        request
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new().with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new().with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_chunked_reply_is_reassembled() {
        let (mut conn, mut server) = pair();
        let broker = tokio::spawn(async move {
            let reply = Reply::ok(Response::List {
                queues: (0..50).map(|i| format!("org.example.queue-{i}")).collect(),
            });
            answer(&mut server, reply, 7).await
        });

        let queues = conn.list("org.example", QueueFilter::All).await.unwrap();
        assert_eq!(queues.len(), 50);
        assert_eq!(queues[49], "org.example.queue-49");
        assert!(!conn.is_broken());

        let request = broker.await.unwrap();
        assert_eq!(request.name(), "LIST");
    }

    #[tokio::test]
    async fn test_error_status_is_unsuccessful() {
        let (mut conn, mut server) = pair();
        tokio::spawn(async move {
            let reply = Reply::error(ReplyError::new(ErrorCode::NotLoggedIn, "login first"));
            answer(&mut server, reply, 64).await;
        });

        let err = conn.create_transient("t").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unsuccessful(ref e) if e.code == ErrorCode::NotLoggedIn));
        // The reply was consumed, so the connection is still in step.
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_mismatched_response_kind() {
        let (mut conn, mut server) = pair();
        tokio::spawn(async move {
            answer(&mut server, Reply::ok(Response::Ack), 64).await;
        });

        let err = conn.login("t").await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Unexpected {
                expected: "LOGIN",
                got: "ACK"
            }
        ));
    }

    #[tokio::test]
    async fn test_close_before_reply_is_empty() {
        let (mut conn, server) = pair();
        drop(server);

        let err = conn.ack(&MessageId::new("q", 1)).await.unwrap_err();
        // Either the write or the read notices the peer is gone.
        assert!(matches!(err, ExchangeError::Empty | ExchangeError::Io(_)));
        assert!(conn.is_broken());
        assert!(matches!(
            conn.ack(&MessageId::new("q", 1)).await,
            Err(ExchangeError::Broken)
        ));
    }

    #[tokio::test]
    async fn test_close_mid_reply_is_unterminated() {
        let (mut conn, mut server) = pair();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            let encoded =
                Encoder::encode_reply(&Reply::ok(Response::List { queues: vec!["a".repeat(100)] }), 16)
                    .unwrap();
            let partial = BytesMut::from(&encoded[..encoded.len() / 2]);
            server.write_all(&partial).await.unwrap();
        });

        let err = conn.list("", QueueFilter::All).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unterminated));
        assert!(ClientError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn test_garbage_reply_is_invalid() {
        let (mut conn, mut server) = pair();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
        });

        let err = conn.diagnostics().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_send_to_missing_queue() {
        let (mut conn, mut server) = pair();
        tokio::spawn(async move {
            answer(&mut server, Reply::ok(Response::Send { id: None }), 64).await;
        });

        let id = conn
            .send("gone", Message::request("x", "reply"))
            .await
            .unwrap();
        assert_eq!(id, None);
    }
}
