//! # msgswitch-protocol
//!
//! Wire protocol spoken between msgswitch clients and the message broker.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Chunked reply bodies (`STREAM` / `END_STREAM` frames) and their reassembly
//! - Broker request kinds (`Login`, `Send`, `Transfer`, `Ack`, ...) and reply shapes
//! - Queue, message and cursor types shared by the client and server sessions

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    Cursor, Diagnostics, Message, MessageId, MessageKind, QueueEntry, QueueFilter, QueueSnapshot,
    Reply, ReplyError, ReplyStatus, Request, Response, TraceBody, TraceEvent,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default TCP port of the broker.
pub const DEFAULT_PORT: u16 = 7491;

/// Default Unix socket path of a host-local broker.
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/message-switch/sock";

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum size of a reassembled reply body (256 MiB).
pub const MAX_REPLY_SIZE: usize = 256 * 1024 * 1024;

/// Default size of one reply chunk (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
