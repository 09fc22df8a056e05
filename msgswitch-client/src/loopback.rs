//! In-process broker.
//!
//! Speaks the real wire protocol over `tokio::io::duplex` pipes, so sessions
//! under test run exactly the code they run against a remote broker. Replies
//! are cut into small chunks to exercise reassembly. Queues live in memory
//! and nothing survives the broker.
//!
//! Transient queues are named after the login token of the session that
//! creates them and disappear once every connection that created them has
//! closed.

use crate::transport::Transport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msgswitch_protocol::{
    Cursor, Decoder, Diagnostics, Encoder, ErrorCode, Message, MessageId, MessageKind,
    QueueEntry, QueueFilter, QueueSnapshot, Reply, ReplyError, Request, Response, TraceBody,
    TraceEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Reply chunk size used unless configured otherwise.
pub const LOOPBACK_CHUNK_SIZE: usize = 256;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Trace events kept for Trace requests.
const TRACE_CAPACITY: usize = 1024;

type BrokerResult = Result<Response, ReplyError>;

struct StoredQueue {
    transient: bool,
    /// Connections that created this transient queue.
    owners: HashSet<u64>,
    contents: BTreeMap<i64, QueueEntry>,
    next_transfer_expected: Option<DateTime<Utc>>,
}

impl StoredQueue {
    fn new(transient: bool) -> Self {
        Self {
            transient,
            owners: HashSet::new(),
            contents: BTreeMap::new(),
            next_transfer_expected: None,
        }
    }

    fn snapshot(&self, name: &str) -> QueueSnapshot {
        QueueSnapshot {
            name: name.to_string(),
            next_transfer_expected: self.next_transfer_expected,
            contents: self
                .contents
                .iter()
                .map(|(seq, entry)| (MessageId::new(name, *seq), entry.clone()))
                .collect(),
        }
    }
}

struct BrokerState {
    start_time: DateTime<Utc>,
    chunk_size: usize,
    next_seq: i64,
    next_connection: u64,
    next_trace: u64,
    queues: BTreeMap<String, StoredQueue>,
    trace: VecDeque<TraceEvent>,
    /// When each request-kind message was sent, for response processing times.
    sent_at: HashMap<MessageId, DateTime<Utc>>,
    acks: HashMap<MessageId, usize>,
    received: HashMap<&'static str, usize>,
    /// `(request kind, requests left until the connection is dropped)`
    drop_rules: Vec<(&'static str, usize)>,
    refuse: usize,
    shut_down: bool,
}

/// Per-connection state.
struct Peer {
    id: u64,
    token: Option<String>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            start_time: Utc::now(),
            chunk_size: LOOPBACK_CHUNK_SIZE,
            next_seq: 0,
            next_connection: 0,
            next_trace: 0,
            queues: BTreeMap::new(),
            trace: VecDeque::new(),
            sent_at: HashMap::new(),
            acks: HashMap::new(),
            received: HashMap::new(),
            drop_rules: Vec::new(),
            refuse: 0,
            shut_down: false,
        }
    }

    fn record(&mut self, input: Option<String>, queue: &str, body: TraceBody, processing_time_ms: Option<u64>) {
        self.next_trace += 1;
        let output = self
            .queues
            .get(queue)
            .filter(|q| q.transient)
            .map(|_| queue.to_string());
        self.trace.push_back(TraceEvent {
            id: self.next_trace,
            time: Utc::now(),
            input,
            queue: queue.to_string(),
            output,
            body,
            processing_time_ms,
        });
        if self.trace.len() > TRACE_CAPACITY {
            self.trace.pop_front();
        }
    }

    /// Counts `request` and returns whether its connection should be dropped instead of answered.
    fn intercept(&mut self, request: &Request) -> bool {
        let kind = request.name();
        *self.received.entry(kind).or_default() += 1;

        let Some(pos) = self.drop_rules.iter().position(|(k, _)| *k == kind) else {
            return false;
        };
        self.drop_rules[pos].1 -= 1;
        if self.drop_rules[pos].1 == 0 {
            self.drop_rules.remove(pos);
            return true;
        }
        false
    }

    fn enqueue(&mut self, origin: Option<String>, queue: &str, message: Message) -> Option<MessageId> {
        let now = Utc::now();
        let stored = self.queues.get_mut(queue)?;
        self.next_seq += 1;
        let id = MessageId::new(queue, self.next_seq);
        stored.contents.insert(
            id.seq,
            QueueEntry {
                origin: origin.clone(),
                time: now,
                message: message.clone(),
            },
        );

        let processing_time_ms = match &message.kind {
            MessageKind::Request { .. } => {
                self.sent_at.insert(id.clone(), now);
                None
            }
            MessageKind::Response { origin } => self
                .sent_at
                .remove(origin)
                .and_then(|sent| (now - sent).num_milliseconds().try_into().ok()),
        };
        self.record(
            origin,
            queue,
            TraceBody::Message {
                id: id.clone(),
                message,
            },
            processing_time_ms,
        );
        Some(id)
    }

    fn apply(&mut self, peer: &mut Peer, request: Request) -> BrokerResult {
        match request {
            Request::Login { token } => {
                peer.token = Some(token);
                Ok(Response::Login)
            }
            Request::CreateTransient { token } => {
                if peer.token.is_none() {
                    return Err(ReplyError::new(
                        ErrorCode::NotLoggedIn,
                        "log in before creating a transient queue",
                    ));
                }
                let name = format!("client-{token}");
                let queue = self
                    .queues
                    .entry(name.clone())
                    .or_insert_with(|| StoredQueue::new(true));
                if !queue.transient {
                    return Err(ReplyError::new(
                        ErrorCode::BadRequest,
                        format!("{name} is a persistent queue"),
                    ));
                }
                queue.owners.insert(peer.id);
                Ok(Response::Create { name })
            }
            Request::CreatePersistent { name } => {
                self.queues
                    .entry(name.clone())
                    .or_insert_with(|| StoredQueue::new(false));
                Ok(Response::Create { name })
            }
            Request::Send { queue, message } => Ok(Response::Send {
                id: self.enqueue(peer.token.clone(), &queue, message),
            }),
            Request::Ack { id } => {
                *self.acks.entry(id.clone()).or_default() += 1;
                if let Some(queue) = self.queues.get_mut(&id.queue) {
                    queue.contents.remove(&id.seq);
                }
                let queue = id.queue.clone();
                self.record(peer.token.clone(), &queue, TraceBody::Ack { id }, None);
                Ok(Response::Ack)
            }
            Request::List { prefix, filter } => Ok(Response::List {
                queues: self
                    .queues
                    .iter()
                    .filter(|(name, _)| name.starts_with(&prefix))
                    .filter(|(_, q)| match filter {
                        QueueFilter::All => true,
                        QueueFilter::Persistent => !q.transient,
                        QueueFilter::Transient => q.transient,
                    })
                    .map(|(name, _)| name.clone())
                    .collect(),
            }),
            Request::Diagnostics => {
                let (transient, permanent): (Vec<_>, Vec<_>) =
                    self.queues.iter().partition(|(_, q)| q.transient);
                Ok(Response::Diagnostics(Diagnostics {
                    start_time: self.start_time,
                    current_time: Utc::now(),
                    permanent_queues: permanent.into_iter().map(|(n, q)| q.snapshot(n)).collect(),
                    transient_queues: transient.into_iter().map(|(n, q)| q.snapshot(n)).collect(),
                }))
            }
            Request::Destroy { queue } => {
                self.queues.remove(&queue);
                Ok(Response::Destroy)
            }
            Request::Shutdown => {
                self.shut_down = true;
                Ok(Response::Shutdown)
            }
            Request::Transfer { .. } | Request::Trace { .. } => Err(ReplyError::new(
                ErrorCode::InternalError,
                "long-poll requests are not applied directly",
            )),
        }
    }

    fn collect(&self, after: i64, queues: &[String]) -> Vec<(MessageId, Message)> {
        let mut messages: Vec<_> = queues
            .iter()
            .filter_map(|name| self.queues.get(name).map(|q| (name, q)))
            .flat_map(|(name, q)| {
                q.contents
                    .range(after + 1..)
                    .map(move |(seq, entry)| (MessageId::new(name.as_str(), *seq), entry.message.clone()))
            })
            .collect();
        messages.sort_by_key(|(id, _)| id.seq);
        messages
    }

    fn disconnected(&mut self, peer: &Peer) {
        self.queues.retain(|name, queue| {
            if !queue.transient || !queue.owners.remove(&peer.id) {
                return true;
            }
            let keep = !queue.owners.is_empty();
            if !keep {
                tracing::debug!("Removing transient queue {}", name);
            }
            keep
        });
    }
}

struct Inner {
    state: parking_lot::Mutex<BrokerState>,
    changed: Notify,
}

impl Inner {
    async fn handle(&self, peer: &mut Peer, request: Request) -> BrokerResult {
        if self.state.lock().shut_down {
            return Err(ReplyError::new(ErrorCode::ShuttingDown, "broker is shutting down"));
        }
        match request {
            Request::Transfer {
                from,
                timeout,
                queues,
            } => self.transfer(from, timeout, queues).await,
            Request::Trace { from, timeout } => self.trace(from, timeout).await,
            request => {
                let response = self.state.lock().apply(peer, request);
                self.changed.notify_waiters();
                response
            }
        }
    }

    async fn transfer(&self, from: Cursor, timeout: f64, queues: Vec<String>) -> BrokerResult {
        let after = match from.as_str() {
            None => 0,
            Some(position) => position.parse::<i64>().map_err(|_| {
                ReplyError::new(ErrorCode::BadRequest, format!("invalid cursor '{position}'"))
            })?,
        };
        let wait = Duration::try_from_secs_f64(timeout).unwrap_or_default();
        let deadline = Instant::now() + wait;
        {
            let expected = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
            let mut state = self.state.lock();
            for name in &queues {
                if let Some(queue) = state.queues.get_mut(name) {
                    queue.next_transfer_expected = Some(expected);
                }
            }
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.state.lock().collect(after, &queues);
            if !messages.is_empty() || Instant::now() >= deadline {
                let next = match messages.last() {
                    Some((id, _)) => Cursor::new(id.seq.to_string()),
                    None => from,
                };
                return Ok(Response::Transfer { messages, next });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn trace(&self, from: Option<u64>, timeout: f64) -> BrokerResult {
        let after = from.unwrap_or(0);
        let deadline = Instant::now() + Duration::try_from_secs_f64(timeout).unwrap_or_default();

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events: Vec<_> = self
                .state
                .lock()
                .trace
                .iter()
                .filter(|e| e.id > after)
                .cloned()
                .collect();
            if !events.is_empty() || Instant::now() >= deadline {
                return Ok(Response::Trace { events });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

async fn serve(inner: Arc<Inner>, mut stream: DuplexStream, id: u64) {
    let mut peer = Peer { id, token: None };
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let request = match decoder.decode_request() {
            Ok(Some(request)) => request,
            Ok(None) => match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    decoder.extend(&buf[..n]);
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!("Loopback connection {} sent an invalid request: {}", id, e);
                break;
            }
        };

        if inner.state.lock().intercept(&request) {
            tracing::debug!("Dropping loopback connection {} on {}", id, request.name());
            break;
        }

        let reply = match inner.handle(&mut peer, request).await {
            Ok(response) => Reply::ok(response),
            Err(error) => Reply::error(error),
        };
        let chunk_size = inner.state.lock().chunk_size;
        let encoded = match Encoder::encode_reply(&reply, chunk_size) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Failed to encode loopback reply: {}", e);
                break;
            }
        };
        if stream.write_all(&encoded).await.is_err() {
            break;
        }
    }

    inner.state.lock().disconnected(&peer);
    inner.changed.notify_waiters();
}

/// An in-memory broker that is also the transport to reach it.
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: parking_lot::Mutex::new(BrokerState::new()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.inner.state.lock().chunk_size = chunk_size.max(1);
        self
    }

    /// Drops the connection that sends the `nth` next request of `kind`
    /// (a request name such as `"SEND"`) instead of answering it.
    pub fn drop_connection_on(&self, kind: &'static str, nth: usize) {
        if nth > 0 {
            self.inner.state.lock().drop_rules.push((kind, nth));
        }
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.inner.state.lock().refuse = n;
    }

    /// Enqueues `message` directly, creating `queue` as a persistent queue if needed.
    pub fn inject(&self, queue: &str, message: Message) -> MessageId {
        let mut state = self.inner.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| StoredQueue::new(false));
        let id = state
            .enqueue(None, queue, message)
            .unwrap_or_else(|| MessageId::new(queue, 0));
        drop(state);
        self.inner.changed.notify_waiters();
        id
    }

    /// Number of requests of `kind` received so far, including dropped ones.
    pub fn request_count(&self, kind: &str) -> usize {
        self.inner.state.lock().received.get(kind).copied().unwrap_or(0)
    }

    pub fn ack_count(&self, id: &MessageId) -> usize {
        self.inner.state.lock().acks.get(id).copied().unwrap_or(0)
    }

    /// Acknowledged messages of `queue` with how often each was acked.
    pub fn acks_on(&self, queue: &str) -> Vec<(MessageId, usize)> {
        let mut acks: Vec<_> = self
            .inner
            .state
            .lock()
            .acks
            .iter()
            .filter(|(id, _)| id.queue == queue)
            .map(|(id, n)| (id.clone(), *n))
            .collect();
        acks.sort();
        acks
    }

    /// Number of unacknowledged messages in `name`, or `None` if there is no such queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.contents.len())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    type Stream = DuplexStream;

    async fn connect(&self, _endpoint: &str) -> io::Result<DuplexStream> {
        let id = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "loopback broker has shut down",
                ));
            }
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "loopback broker refused the connection",
                ));
            }
            state.next_connection += 1;
            state.next_connection
        };

        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        tokio::spawn(serve(self.inner.clone(), server, id));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::error::ExchangeError;

    async fn open(broker: &LoopbackBroker) -> Connection<DuplexStream> {
        Connection::open(broker, "loopback", &ConnectionConfig::default())
            .await
            .unwrap()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_transient_queue_requires_login() {
        let broker = LoopbackBroker::new();
        let mut conn = open(&broker).await;

        let err = conn.create_transient("t").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unsuccessful(ref e) if e.code == ErrorCode::NotLoggedIn));

        conn.login("t").await.unwrap();
        assert_eq!(conn.create_transient("t").await.unwrap(), "client-t");
    }

    #[tokio::test]
    async fn test_transient_queue_removed_with_last_owner() {
        let broker = LoopbackBroker::new();
        let mut first = open(&broker).await;
        let mut second = open(&broker).await;
        for conn in [&mut first, &mut second] {
            conn.login("t").await.unwrap();
            conn.create_transient("t").await.unwrap();
        }
        assert_eq!(
            first.list("", QueueFilter::Transient).await.unwrap(),
            vec!["client-t".to_string()]
        );

        first.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_depth("client-t"), Some(0));

        second.close().await;
        eventually(|| broker.queue_depth("client-t").is_none()).await;
    }

    #[tokio::test]
    async fn test_send_to_missing_queue_has_no_id() {
        let broker = LoopbackBroker::new();
        let mut conn = open(&broker).await;
        let id = conn
            .send("nowhere", Message::request("x", "r"))
            .await
            .unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn test_transfer_wakes_on_send() {
        let broker = LoopbackBroker::new();
        let mut poller = open(&broker).await;
        let mut sender = open(&broker).await;
        sender.create_persistent("svc").await.unwrap();

        let poll = tokio::spawn(async move {
            poller
                .transfer(Cursor::beginning(), Duration::from_secs(30), vec!["svc".into()])
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = sender
            .send("svc", Message::request("ping", "r"))
            .await
            .unwrap()
            .unwrap();

        let (messages, next) = tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, id);
        assert_eq!(next, Cursor::new(id.seq.to_string()));
    }

    #[tokio::test]
    async fn test_transfer_timeout_keeps_cursor() {
        let broker = LoopbackBroker::new();
        let mut conn = open(&broker).await;
        conn.create_persistent("svc").await.unwrap();
        let id = conn
            .send("svc", Message::request("a", "r"))
            .await
            .unwrap()
            .unwrap();

        let from = Cursor::new(id.seq.to_string());
        let (messages, next) = conn
            .transfer(from.clone(), Duration::from_millis(30), vec!["svc".into()])
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert_eq!(next, from);

        let err = conn
            .transfer(Cursor::new("bogus"), Duration::ZERO, vec!["svc".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Unsuccessful(ref e) if e.code == ErrorCode::BadRequest));
    }

    #[tokio::test]
    async fn test_large_reply_spans_many_chunks() {
        let broker = LoopbackBroker::new().with_chunk_size(32);
        for i in 0..40 {
            broker.inject("svc", Message::request(format!("message {i}"), "r"));
        }
        let mut conn = open(&broker).await;
        let (messages, _) = conn
            .transfer(Cursor::beginning(), Duration::ZERO, vec!["svc".into()])
            .await
            .unwrap();
        assert_eq!(messages.len(), 40);
        assert_eq!(messages[39].1.payload, "message 39");
    }

    #[tokio::test]
    async fn test_trace_records_sends_and_acks() {
        let broker = LoopbackBroker::new();
        let mut conn = open(&broker).await;
        conn.login("svc-client").await.unwrap();
        conn.create_persistent("svc").await.unwrap();
        let request = conn
            .send("svc", Message::request("ping", "r"))
            .await
            .unwrap()
            .unwrap();
        conn.create_persistent("r").await.unwrap();
        conn.send("r", Message::response("pong", request.clone()))
            .await
            .unwrap();
        conn.ack(&request).await.unwrap();

        let events = conn.trace(None, Duration::ZERO).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].input.as_deref(), Some("svc-client"));
        assert!(events[1].processing_time_ms.is_some());
        assert!(matches!(events[2].body, TraceBody::Ack { ref id } if *id == request));
        assert_eq!(broker.ack_count(&request), 1);

        let later = conn.trace(Some(events[2].id), Duration::ZERO).await.unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_connection_and_refusals() {
        let broker = LoopbackBroker::new();
        broker.drop_connection_on("ACK", 2);
        let mut conn = open(&broker).await;
        let id = MessageId::new("q", 1);
        conn.ack(&id).await.unwrap();
        assert!(matches!(conn.ack(&id).await, Err(ExchangeError::Empty)));
        assert_eq!(broker.request_count("ACK"), 2);

        broker.refuse_connections(1);
        assert!(broker.connect("loopback").await.is_err());
        assert!(broker.connect("loopback").await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_work() {
        let broker = LoopbackBroker::new();
        let mut conn = open(&broker).await;
        conn.shutdown().await.unwrap();
        assert!(broker.is_shut_down());

        let err = conn.list("", QueueFilter::All).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unsuccessful(ref e) if e.code == ErrorCode::ShuttingDown));
        assert!(broker.connect("loopback").await.is_err());
    }
}
