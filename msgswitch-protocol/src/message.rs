//! Broker request kinds, reply shapes, and the queue/message model.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies a message within a queue: `(queue_name, sequence_number)`.
///
/// Doubles as the acknowledgment token and, for responses, as the key
/// correlating a reply with the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub queue: String,
    pub seq: i64,
}

impl MessageId {
    pub fn new(queue: impl Into<String>, seq: i64) -> Self {
        Self {
            queue: queue.into(),
            seq,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.queue, self.seq)
    }
}

/// Whether a message asks for work or answers a previous request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// A request whose answer must be sent to `reply_to`.
    Request { reply_to: String },
    /// The answer to the request identified by `origin`.
    Response { origin: MessageId },
}

/// A message as stored in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub payload: String,
    pub kind: MessageKind,
}

impl Message {
    pub fn request(payload: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            kind: MessageKind::Request {
                reply_to: reply_to.into(),
            },
        }
    }

    pub fn response(payload: impl Into<String>, origin: MessageId) -> Self {
        Self {
            payload: payload.into(),
            kind: MessageKind::Response { origin },
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::Response { .. })
    }
}

/// Opaque position in a set of queues, returned by every Transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Option<String>);

impl Cursor {
    /// The position before any message.
    pub fn beginning() -> Self {
        Self(None)
    }

    pub fn new(position: impl Into<String>) -> Self {
        Self(Some(position.into()))
    }

    pub fn is_beginning(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("<beginning>"))
    }
}

/// Which queues a List request returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFilter {
    #[default]
    All,
    Persistent,
    Transient,
}

/// Requests a client may send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Login {
        token: String,
    },
    /// Creates a reply queue owned by the current connection.
    CreateTransient {
        token: String,
    },
    /// Creates a named queue; a no-op when it already exists.
    CreatePersistent {
        name: String,
    },
    Send {
        queue: String,
        message: Message,
    },
    /// Long-poll for messages after `from`, waiting up to `timeout` seconds.
    Transfer {
        from: Cursor,
        timeout: f64,
        queues: Vec<String>,
    },
    Ack {
        id: MessageId,
    },
    List {
        prefix: String,
        #[serde(default)]
        filter: QueueFilter,
    },
    Diagnostics,
    /// Long-poll for trace events with an id greater than `from`.
    Trace {
        from: Option<u64>,
        timeout: f64,
    },
    Destroy {
        queue: String,
    },
    Shutdown,
}

impl Request {
    pub fn transfer(from: Cursor, timeout: Duration, queues: Vec<String>) -> Self {
        Request::Transfer {
            from,
            timeout: timeout.as_secs_f64(),
            queues,
        }
    }

    pub fn trace(from: Option<u64>, timeout: Duration) -> Self {
        Request::Trace {
            from,
            timeout: timeout.as_secs_f64(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Login { .. } => "LOGIN",
            Request::CreateTransient { .. } => "CREATE_TRANSIENT",
            Request::CreatePersistent { .. } => "CREATE_PERSISTENT",
            Request::Send { .. } => "SEND",
            Request::Transfer { .. } => "TRANSFER",
            Request::Ack { .. } => "ACK",
            Request::List { .. } => "LIST",
            Request::Diagnostics => "DIAGNOSTICS",
            Request::Trace { .. } => "TRACE",
            Request::Destroy { .. } => "DESTROY",
            Request::Shutdown => "SHUTDOWN",
        }
    }

    /// Server-side wait a long-poll request may spend before replying.
    pub fn long_poll_timeout(&self) -> Option<Duration> {
        match self {
            Request::Transfer { timeout, .. } | Request::Trace { timeout, .. } => {
                Some(Duration::from_secs_f64(timeout.max(0.0)))
            }
            _ => None,
        }
    }
}

/// Successful reply bodies, one per request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Login,
    Create {
        name: String,
    },
    /// `id` is absent when the destination queue does not exist.
    Send {
        id: Option<MessageId>,
    },
    Transfer {
        messages: Vec<(MessageId, Message)>,
        next: Cursor,
    },
    Ack,
    List {
        queues: Vec<String>,
    },
    Diagnostics(Diagnostics),
    Trace {
        events: Vec<TraceEvent>,
    },
    Destroy,
    Shutdown,
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Login => "LOGIN",
            Response::Create { .. } => "CREATE",
            Response::Send { .. } => "SEND",
            Response::Transfer { .. } => "TRANSFER",
            Response::Ack => "ACK",
            Response::List { .. } => "LIST",
            Response::Diagnostics(_) => "DIAGNOSTICS",
            Response::Trace { .. } => "TRACE",
            Response::Destroy => "DESTROY",
            Response::Shutdown => "SHUTDOWN",
        }
    }
}

/// Snapshot of broker state returned by a Diagnostics request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub start_time: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
    pub permanent_queues: Vec<QueueSnapshot>,
    pub transient_queues: Vec<QueueSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    /// Deadline of the oldest long-poll currently waiting on this queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_transfer_expected: Option<DateTime<Utc>>,
    pub contents: Vec<(MessageId, QueueEntry)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Token of the session that enqueued the message, if logged in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub time: DateTime<Utc>,
    pub message: Message,
}

/// One broker event reported by a Trace request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: u64,
    pub time: DateTime<Utc>,
    /// Session that caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub queue: String,
    /// Session the message was delivered to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub body: TraceBody,
    /// For responses, time elapsed since the matching request was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceBody {
    Message { id: MessageId, message: Message },
    Ack { id: MessageId },
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Details of an unsuccessful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub message: String,
}

impl ReplyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Envelope around every broker reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn ok(response: Response) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(error: ReplyError) -> Self {
        Self {
            status: ReplyStatus::Error,
            response: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}
