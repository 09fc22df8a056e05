//! Client session.
//!
//! A session holds two connections to the broker. The requests connection
//! carries everything the caller asks for (queue creation, sends, admin
//! requests). The events connection belongs to a background correlation loop
//! that long-polls the session's reply queue and hands each response to the
//! caller waiting for it.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{ClientError, ExchangeError};
use crate::ivar::Ivar;
use crate::timer;
use crate::transport::{BrokerTransport, Transport};
use msgswitch_protocol::{
    Cursor, Diagnostics, Message, MessageId, MessageKind, QueueFilter, TraceEvent,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address, interpreted by the transport.
    pub endpoint: String,
    /// Identity token presented at login. The reply queue is derived from it.
    pub token: String,
    pub connection: ConnectionConfig,
    /// How long one long-poll on the reply queue may wait.
    pub poll_timeout: Duration,
    /// Pause before an `rpc` resubmits after a transport failure.
    pub retry_delay: Duration,
    /// Pause between failed reconnect attempts.
    pub reconnect_delay: Duration,
    /// Create the destination queue before every send.
    pub ensure_queue: bool,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: format!("msgswitch-{}", uuid::Uuid::new_v4()),
            connection: ConnectionConfig::default(),
            poll_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            ensure_queue: true,
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

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_ensure_queue(mut self, ensure: bool) -> Self {
        self.ensure_queue = ensure;
        self
    }
}

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    LoggingIn,
    Ready,
    Reconnecting,
    ShuttingDown,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::LoggingIn => "logging in",
            ClientState::Ready => "ready",
            ClientState::Reconnecting => "reconnecting",
            ClientState::ShuttingDown => "shutting down",
        };
        f.write_str(state)
    }
}

/// What a waiting caller is woken with.
#[derive(Debug, Clone)]
enum Delivery {
    Response(Message),
    TimedOut,
    Disconnected,
}

/// Mutable session state, guarded by the session mutex.
struct Session<S> {
    requests: Option<Connection<S>>,
    reply_queue: String,
    /// Callers waiting for a response, keyed by the id of the request they sent.
    wakeners: HashMap<MessageId, Ivar<Delivery>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn requests(&mut self) -> Result<&mut Connection<S>, ClientError> {
        self.requests.as_mut().ok_or_else(ClientError::not_connected)
    }
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    session: Mutex<Session<T::Stream>>,
    state: parking_lot::Mutex<ClientState>,
    /// Wakes the correlation loop when the requests connection has failed.
    reconnect: Notify,
}

impl<T: Transport> Shared<T> {
    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ClientState::ShuttingDown | ClientState::Disconnected
        )
    }

    /// Converts the outcome of an exchange on the requests connection,
    /// retiring the connection if the exchange left it out of step.
    fn settle<R>(
        &self,
        session: &mut Session<T::Stream>,
        result: Result<R, ExchangeError>,
    ) -> Result<R, ClientError> {
        result.map_err(|e| {
            if session.requests.as_ref().is_some_and(Connection::is_broken) {
                tracing::warn!("Request connection to {} failed: {}", self.config.endpoint, e);
                session.requests = None;
                self.reconnect.notify_one();
            }
            ClientError::from(e)
        })
    }

    /// Creates the destination queue if asked to, sends the request and
    /// registers `waiter` under its id, all under the session mutex.
    async fn try_submit(
        &self,
        queue: &str,
        payload: &str,
        waiter: &Ivar<Delivery>,
    ) -> Result<MessageId, ClientError> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        if self.config.ensure_queue {
            let result = session.requests()?.create_persistent(queue).await;
            self.settle(session, result)?;
        }

        let message = Message::request(payload, session.reply_queue.clone());
        let result = session.requests()?.send(queue, message).await;
        let id = self
            .settle(session, result)?
            .ok_or_else(|| ClientError::QueueDeleted(queue.to_string()))?;

        if !waiter.is_filled() {
            session.wakeners.insert(id.clone(), waiter.clone());
        }
        Ok(id)
    }
}

/// Opens and logs in both connections and creates the reply queue.
///
/// Any connection already opened is closed again on failure.
async fn establish<T: Transport>(
    transport: &T,
    config: &ClientConfig,
) -> Result<(Connection<T::Stream>, Connection<T::Stream>, String), ClientError> {
    let mut requests = Connection::open(transport, &config.endpoint, &config.connection).await?;
    let created = match requests.login(&config.token).await {
        Ok(()) => requests.create_transient(&config.token).await,
        Err(e) => Err(e),
    };
    let reply_queue = match created {
        Ok(name) => name,
        Err(e) => {
            requests.close().await;
            return Err(ClientError::communication(e));
        }
    };

    let mut events = match Connection::open(transport, &config.endpoint, &config.connection).await
    {
        Ok(events) => events,
        Err(e) => {
            requests.close().await;
            return Err(e);
        }
    };
    if let Err(e) = events.login(&format!("{}-events", config.token)).await {
        events.close().await;
        requests.close().await;
        return Err(ClientError::communication(e));
    }

    Ok((requests, events, reply_queue))
}

/// Re-establishes the session, retrying until it succeeds.
///
/// Returns the new events connection; the new requests connection and reply
/// queue are installed in the session.
async fn reconnect<T: Transport>(shared: &Shared<T>) -> Connection<T::Stream> {
    loop {
        shared.set_state(ClientState::Reconnecting);
        let mut session = shared.session.lock().await;
        match establish(&*shared.transport, &shared.config).await {
            Ok((requests, events, reply_queue)) => {
                let stale = session.requests.replace(requests);
                if session.reply_queue != reply_queue {
                    tracing::info!(
                        "Reply queue changed from {} to {}",
                        session.reply_queue,
                        reply_queue
                    );
                    session.reply_queue = reply_queue;
                }
                drop(session);

                if let Some(stale) = stale {
                    stale.close().await;
                }
                shared.set_state(ClientState::Ready);
                tracing::info!("Reconnected to {}", shared.config.endpoint);
                return events;
            }
            Err(e) => {
                drop(session);
                tracing::warn!(
                    "Reconnect to {} failed, retrying in {:?}: {}",
                    shared.config.endpoint,
                    shared.config.reconnect_delay,
                    e
                );
                tokio::time::sleep(shared.config.reconnect_delay).await;
            }
        }
    }
}

/// Long-polls the reply queue and wakes the caller of each response.
///
/// Runs until the session is disconnected or dropped.
async fn correlation_loop<T: Transport>(shared: Arc<Shared<T>>, mut events: Connection<T::Stream>) {
    let mut from = Cursor::beginning();
    loop {
        let reply_queue = shared.session.lock().await.reply_queue.clone();
        let polled = tokio::select! {
            result = events.transfer(from.clone(), shared.config.poll_timeout, vec![reply_queue]) => Some(result),
            _ = requests_lost(&shared) => None,
        };

        let (messages, next) = match polled {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => {
                tracing::warn!("Polling for responses failed: {}", e);
                events = reconnect(&shared).await;
                continue;
            }
            None => {
                events = reconnect(&shared).await;
                continue;
            }
        };

        let mut acked = true;
        for (id, message) in messages {
            let origin = match &message.kind {
                MessageKind::Response { origin } => origin.clone(),
                MessageKind::Request { .. } => {
                    tracing::warn!("Ignoring request {} delivered to reply queue", id);
                    continue;
                }
            };

            let wakener = shared.session.lock().await.wakeners.remove(&origin);
            match wakener {
                Some(wakener) => {
                    if wakener.fill(Delivery::Response(message)).is_err() {
                        tracing::debug!("Caller for {} already resolved", origin);
                    }
                }
                None => tracing::warn!("No caller waiting for {}; dropping response {}", origin, id),
            }

            if let Err(e) = events.ack(&id).await {
                tracing::warn!("Acknowledging {} failed: {}", id, e);
                acked = false;
                break;
            }
        }

        if acked {
            from = next;
        } else {
            events = reconnect(&shared).await;
        }
    }
}

/// Resolves once the requests connection has been retired.
///
/// A notification raised while the loop was already reconnecting finds a
/// fresh connection installed and is skipped.
async fn requests_lost<T: Transport>(shared: &Shared<T>) {
    loop {
        shared.reconnect.notified().await;
        if shared.session.lock().await.requests.is_none() {
            return;
        }
        tracing::debug!("Request connection already replaced");
    }
}

/// Waits out transient failures until the request is on the broker.
async fn submit<T: Transport>(
    shared: Arc<Shared<T>>,
    queue: String,
    payload: String,
    waiter: Ivar<Delivery>,
) -> Result<MessageId, ClientError> {
    loop {
        if waiter.is_filled() {
            return Err(ClientError::Timeout);
        }
        if shared.is_closing() {
            return Err(ClientError::not_connected());
        }
        match shared.try_submit(&queue, &payload, &waiter).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    "Sending to {} failed, retrying in {:?}: {}",
                    queue,
                    shared.config.retry_delay,
                    e
                );
                tokio::time::sleep(shared.config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A client session.
pub struct Client<T: Transport = BrokerTransport> {
    shared: Arc<Shared<T>>,
    correlation: AbortHandle,
}

impl<T: Transport> Client<T> {
    /// Opens a session: both connections are logged in, the reply queue is
    /// created and the correlation loop is running when this returns.
    pub async fn connect(transport: Arc<T>, config: ClientConfig) -> Result<Self, ClientError> {
        tracing::debug!("Logging in to {} as {}", config.endpoint, config.token);
        let (requests, events, reply_queue) = establish(&*transport, &config).await?;
        tracing::info!(
            "Connected to {} with reply queue {}",
            config.endpoint,
            reply_queue
        );

        let shared = Arc::new(Shared {
            transport,
            config,
            session: Mutex::new(Session {
                requests: Some(requests),
                reply_queue,
                wakeners: HashMap::new(),
            }),
            state: parking_lot::Mutex::new(ClientState::Ready),
            reconnect: Notify::new(),
        });
        let correlation = tokio::spawn(correlation_loop(shared.clone(), events)).abort_handle();

        Ok(Self {
            shared,
            correlation,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Name of the queue responses are currently addressed to.
    pub async fn reply_queue(&self) -> String {
        self.shared.session.lock().await.reply_queue.clone()
    }

    /// Sends `payload` to `queue` and waits for the response.
    ///
    /// Transport failures while submitting are retried until the request is
    /// accepted or `timeout` elapses. Without a timeout the call waits as long
    /// as it takes.
    pub async fn rpc(
        &self,
        queue: &str,
        payload: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<String, ClientError> {
        let waiter = Ivar::new();
        let timer = timeout.map(|delay| {
            let waiter = waiter.clone();
            timer::run_after(delay, async move {
                let _ = waiter.fill(Delivery::TimedOut);
            })
        });

        let mut submission = tokio::spawn(submit(
            self.shared.clone(),
            queue.to_string(),
            payload.into(),
            waiter.clone(),
        ));

        let (delivery, id) = tokio::select! {
            biased;
            submitted = &mut submission => {
                let id = match submitted {
                    Ok(Ok(id)) => id,
                    Ok(Err(e)) => {
                        cancel(timer);
                        return Err(e);
                    }
                    Err(e) => {
                        cancel(timer);
                        return Err(ClientError::communication(e));
                    }
                };
                tracing::debug!("Sent {} to {}, awaiting response", id, queue);
                (waiter.read().await, Some(id))
            }
            delivery = waiter.read() => (delivery, None),
        };
        cancel(timer);

        match delivery {
            Delivery::Response(message) => Ok(message.payload),
            Delivery::TimedOut => {
                match id {
                    Some(id) => {
                        self.shared.session.lock().await.wakeners.remove(&id);
                    }
                    None => {
                        // The request may still reach the broker; forget its
                        // wakener once it does.
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            if let Ok(Ok(id)) = submission.await {
                                shared.session.lock().await.wakeners.remove(&id);
                            }
                        });
                    }
                }
                tracing::debug!("Call to {} timed out", queue);
                Err(ClientError::Timeout)
            }
            Delivery::Disconnected => Err(ClientError::not_connected()),
        }
    }

    pub async fn list(&self, prefix: &str, filter: QueueFilter) -> Result<Vec<String>, ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.list(prefix, filter).await;
        self.shared.settle(&mut session, result)
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.diagnostics().await;
        self.shared.settle(&mut session, result)
    }

    /// Long-polls for broker events after `from`.
    ///
    /// Holds the requests connection for the length of the poll.
    pub async fn trace(
        &self,
        from: Option<u64>,
        timeout: Duration,
    ) -> Result<Vec<TraceEvent>, ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.trace(from, timeout).await;
        self.shared.settle(&mut session, result)
    }

    pub async fn ack(&self, id: &MessageId) -> Result<(), ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.ack(id).await;
        self.shared.settle(&mut session, result)
    }

    pub async fn destroy(&self, queue: &str) -> Result<(), ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.destroy(queue).await;
        self.shared.settle(&mut session, result)
    }

    /// Asks the broker itself to shut down.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let mut session = self.shared.session.lock().await;
        let result = session.requests()?.shutdown().await;
        self.shared.settle(&mut session, result)
    }

    /// Closes both connections without logging out.
    ///
    /// Callers still waiting for a response fail with a communication error.
    pub async fn disconnect(&self) {
        self.shared.set_state(ClientState::ShuttingDown);
        self.correlation.abort();

        let requests = {
            let mut session = self.shared.session.lock().await;
            for (_, wakener) in session.wakeners.drain() {
                let _ = wakener.fill(Delivery::Disconnected);
            }
            session.requests.take()
        };
        if let Some(requests) = requests {
            requests.close().await;
        }

        self.shared.set_state(ClientState::Disconnected);
        tracing::info!("Disconnected from {}", self.shared.config.endpoint);
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.correlation.abort();
    }
}

fn cancel(timer: Option<timer::TimerHandle>) {
    if let Some(timer) = timer {
        timer.cancel();
    }
}
