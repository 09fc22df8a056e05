//! Server session.
//!
//! A server serves one persistent queue: it long-polls the queue, runs the
//! handler on every request and sends the handler's result to the queue the
//! request names as its reply queue. A request is acked only after its
//! response has been sent.

use crate::error::ServerError;
use crate::handler::Handler;
use msgswitch_client::{
    BrokerTransport, ClientError, Connection, ConnectionConfig, ExchangeError, Transport,
};
use msgswitch_protocol::{Cursor, Message, MessageId, MessageKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Server session configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Broker address, interpreted by the transport.
    pub endpoint: String,
    /// Identity token presented at login.
    pub token: String,
    pub connection: ConnectionConfig,
    /// Long-poll timeout of each transfer.
    pub poll_timeout: Duration,
    /// Pause before reconnecting after a transport failure.
    pub reconnect_delay: Duration,
}

impl ServerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: format!("msgswitch-server-{}", uuid::Uuid::new_v4()),
            connection: ConnectionConfig::default(),
            poll_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Lifecycle of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    ShutdownRequested,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Idle => "idle",
            ServerState::Listening => "listening",
            ServerState::ShutdownRequested => "shutdown requested",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Requests whose response was sent and which were acked.
    pub handled: AtomicU64,
    /// Messages that could not be answered or acked.
    pub failed: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Serves requests arriving on a broker queue.
pub struct Server<T: Transport = BrokerTransport> {
    transport: Arc<T>,
    config: ServerConfig,
    state: parking_lot::Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    stats: ServerStats,
}

impl<T: Transport> Server<T> {
    /// Creates a server. Nothing is connected until [`Server::listen`] or
    /// [`Server::listen_p`] is called.
    pub fn new(transport: Arc<T>, config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);
        Self {
            transport,
            config,
            state: parking_lot::Mutex::new(ServerState::Idle),
            shutdown,
            stopped,
            stats: ServerStats::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Serves `queue`, handling one request at a time in arrival order.
    ///
    /// Returns once [`Server::shutdown`] has been called, or with an error if
    /// the first connection to the broker cannot be established. Later
    /// transport failures are recovered by reconnecting.
    pub async fn listen<H: Handler>(&self, handler: H, queue: &str) -> Result<(), ServerError> {
        self.start()?;
        let result = self.serve(&handler, queue).await;
        self.finish();
        result
    }

    /// Serves `queue` like [`Server::listen`], but handles all requests
    /// received by one poll concurrently.
    ///
    /// Responses and acks go through a second connection, which is reopened
    /// whenever a failed exchange leaves it unusable. A failure to answer one
    /// request is logged and does not affect the others. Every request of
    /// a batch is finished before the queue is polled again.
    pub async fn listen_p<H: Handler>(&self, handler: H, queue: &str) -> Result<(), ServerError> {
        self.start()?;
        let result = self.serve_parallel(Arc::new(handler), queue).await;
        self.finish();
        result
    }

    /// Stops a listening server and waits until its loop has exited.
    ///
    /// Returns immediately if the server never started or has already
    /// stopped. A server that has been shut down cannot listen again.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Idle => {
                    *state = ServerState::Stopped;
                    self.stopped.send_replace(true);
                    return;
                }
                ServerState::Stopped => return,
                ServerState::Listening => *state = ServerState::ShutdownRequested,
                ServerState::ShutdownRequested => {}
            }
        }
        tracing::info!("Server shutdown requested");
        self.shutdown.send_replace(true);
        raised(&mut self.stopped.subscribe()).await;
    }

    fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        match *state {
            ServerState::Idle => {
                *state = ServerState::Listening;
                Ok(())
            }
            ServerState::Listening => Err(ServerError::AlreadyListening),
            ServerState::ShutdownRequested | ServerState::Stopped => Err(ServerError::ShuttingDown),
        }
    }

    fn finish(&self) {
        *self.state.lock() = ServerState::Stopped;
        self.stopped.send_replace(true);
        tracing::info!("Server stopped");
    }

    /// Opens a connection, logs in and makes sure `queue` exists.
    async fn open(&self, queue: &str) -> Result<Connection<T::Stream>, ClientError> {
        let mut conn =
            Connection::open(&*self.transport, &self.config.endpoint, &self.config.connection)
                .await?;
        let prepared = match conn.login(&self.config.token).await {
            Ok(()) => conn.create_persistent(queue).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            conn.close().await;
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Replaces a failed connection, retrying until it succeeds. Returns
    /// `None` if shutdown is requested first.
    async fn reconnect(
        &self,
        queue: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Connection<T::Stream>> {
        loop {
            tokio::select! {
                biased;
                _ = raised(shutdown) => return None,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            let opened = tokio::select! {
                biased;
                _ = raised(shutdown) => return None,
                opened = self.open(queue) => opened,
            };
            match opened {
                Ok(conn) => {
                    tracing::info!("Reconnected to {}", self.config.endpoint);
                    return Some(conn);
                }
                Err(e) => tracing::warn!("Reconnecting to {} failed: {}", self.config.endpoint, e),
            }
        }
    }

    async fn serve<H: Handler>(&self, handler: &H, queue: &str) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut conn = self.open(queue).await?;
        tracing::info!("Listening on {} at {}", queue, self.config.endpoint);

        let mut from = Cursor::beginning();
        loop {
            let polled = tokio::select! {
                biased;
                _ = raised(&mut shutdown) => break,
                polled = conn.transfer(from.clone(), self.config.poll_timeout, vec![queue.to_string()]) => polled,
            };
            let outcome = match polled {
                Ok((messages, next)) => self
                    .dispatch(&mut conn, handler, messages)
                    .await
                    .map(|()| next),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(next) => from = next,
                Err(e) => {
                    // The cursor stays put: unacked messages are delivered again.
                    tracing::warn!("Connection to {} failed: {}", self.config.endpoint, e);
                    let Some(fresh) = self.reconnect(queue, &mut shutdown).await else {
                        break;
                    };
                    std::mem::replace(&mut conn, fresh).close().await;
                }
            }
        }

        conn.close().await;
        Ok(())
    }

    async fn dispatch<H: Handler>(
        &self,
        conn: &mut Connection<T::Stream>,
        handler: &H,
        messages: Vec<(MessageId, Message)>,
    ) -> Result<(), ExchangeError> {
        for (id, message) in messages {
            let response = respond(handler, &id, message).await;
            match deliver(conn, &id, response).await {
                Ok(answered) => self.count(answered),
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn serve_parallel<H: Handler>(
        &self,
        handler: Arc<H>,
        queue: &str,
    ) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut events = self.open(queue).await?;
        let mut replies = match self.open(queue).await {
            Ok(conn) => conn,
            Err(e) => {
                events.close().await;
                return Err(e.into());
            }
        };
        tracing::info!(
            "Listening on {} at {} (parallel)",
            queue,
            self.config.endpoint
        );

        let mut from = Cursor::beginning();
        loop {
            let polled = tokio::select! {
                biased;
                _ = raised(&mut shutdown) => break,
                polled = events.transfer(from.clone(), self.config.poll_timeout, vec![queue.to_string()]) => polled,
            };
            match polled {
                Ok((messages, next)) => {
                    from = next;
                    self.dispatch_parallel(&handler, &mut replies, queue, messages)
                        .await;
                }
                Err(e) => {
                    tracing::warn!("Connection to {} failed: {}", self.config.endpoint, e);
                    let Some(fresh) = self.reconnect(queue, &mut shutdown).await else {
                        break;
                    };
                    std::mem::replace(&mut events, fresh).close().await;
                }
            }
        }

        events.close().await;
        replies.close().await;
        Ok(())
    }

    /// Runs the handler on every request of a batch at once and answers
    /// each one as soon as its handler returns.
    async fn dispatch_parallel<H: Handler>(
        &self,
        handler: &Arc<H>,
        replies: &mut Connection<T::Stream>,
        queue: &str,
        messages: Vec<(MessageId, Message)>,
    ) {
        let mut tasks = JoinSet::new();
        for (id, message) in messages {
            let handler = handler.clone();
            tasks.spawn(async move {
                let response = respond(&*handler, &id, message).await;
                (id, response)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, response) = match joined {
                Ok(handled) => handled,
                Err(e) => {
                    tracing::error!("Request task failed: {}", e);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            self.repair(replies, queue).await;
            match deliver(replies, &id, response).await {
                Ok(answered) => self.count(answered),
                Err(e) => {
                    tracing::warn!("Failed to answer {}: {}", id, e);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn count(&self, answered: bool) {
        if answered {
            self.stats.handled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reopens the replies connection if a failed exchange left it out of step.
    async fn repair(&self, conn: &mut Connection<T::Stream>, queue: &str) {
        if !conn.is_broken() {
            return;
        }
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        match self.open(queue).await {
            Ok(fresh) => {
                tracing::info!("Reopened reply connection to {}", self.config.endpoint);
                std::mem::replace(conn, fresh).close().await;
            }
            Err(e) => tracing::warn!("Reopening reply connection failed: {}", e),
        }
    }
}

/// A response waiting to be sent, and the queue it goes to.
struct Outgoing {
    reply_to: String,
    message: Message,
}

/// Runs `handler` on a request. Response-kind messages get no response.
async fn respond<H: Handler + ?Sized>(
    handler: &H,
    id: &MessageId,
    message: Message,
) -> Option<Outgoing> {
    match message.kind {
        MessageKind::Request { reply_to } => {
            tracing::debug!("Handling {} (reply to {})", id, reply_to);
            let payload = handler.handle(message.payload).await;
            Some(Outgoing {
                reply_to,
                message: Message::response(payload, id.clone()),
            })
        }
        MessageKind::Response { origin } => {
            tracing::warn!("Dropping response {} to {} found on a service queue", id, origin);
            None
        }
    }
}

/// Sends `response`, if any, then acks the message it answers. Returns
/// whether a response was sent.
async fn deliver<S>(
    conn: &mut Connection<S>,
    id: &MessageId,
    response: Option<Outgoing>,
) -> Result<bool, ExchangeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let answered = match response {
        Some(Outgoing { reply_to, message }) => {
            if conn.send(&reply_to, message).await?.is_none() {
                tracing::warn!("Reply queue {} for {} no longer exists", reply_to, id);
            }
            true
        }
        None => false,
    };
    conn.ack(id).await?;
    Ok(answered)
}

/// Resolves once the flag behind `flag` is set.
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}
