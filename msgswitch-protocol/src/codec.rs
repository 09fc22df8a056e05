//! Encoder and decoder for requests and chunked replies.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Reply, Request};
use crate::{MAX_PAYLOAD_SIZE, MAX_REPLY_SIZE};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;

/// Encodes requests and replies into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a single frame.
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(request)?.encode()
    }

    /// Encodes a reply as a sequence of chunks of at most `chunk_size` bytes.
    ///
    /// The last chunk carries `END_STREAM`.
    pub fn encode_reply(reply: &Reply, chunk_size: usize) -> Result<BytesMut, ProtocolError> {
        let body = Bytes::from(serde_json::to_vec(reply)?);
        let chunk_size = chunk_size.clamp(1, MAX_PAYLOAD_SIZE as usize);

        let mut buf = BytesMut::with_capacity(body.len() + crate::FRAME_HEADER_SIZE);
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(body.len());
            let last = end == body.len();
            Frame::chunk(body.slice(offset..end), last).encode_into(&mut buf)?;
            if last {
                return Ok(buf);
            }
            offset = end;
        }
    }
}

/// Incremental decoder over a byte stream.
///
/// Reply chunks are accumulated in arrival order and only decoded once the
/// terminal chunk has been seen. A body growing past the reply limit is
/// discarded with [`ProtocolError::ReplyTooLarge`].
pub struct Decoder {
    buffer: BytesMut,
    body: BytesMut,
    chunks: usize,
    max_reply: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            body: BytesMut::new(),
            chunks: 0,
            max_reply: MAX_REPLY_SIZE,
        }
    }

    /// Sets the largest reassembled reply body accepted.
    pub fn with_max_reply(mut self, max: usize) -> Self {
        self.max_reply = max;
        self
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next request.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) if frame.flags.is_stream() => Err(ProtocolError::UnexpectedChunk),
            Some(frame) => parse_json(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next complete reply.
    pub fn decode_reply(&mut self) -> Result<Option<Reply>, ProtocolError> {
        while let Some(frame) = self.decode_frame()? {
            if !frame.flags.is_stream() {
                if self.chunks > 0 {
                    return Err(ProtocolError::InterleavedFrame);
                }
                return parse_json(&frame.payload).map(Some);
            }

            if self.body.len() + frame.payload.len() > self.max_reply {
                self.body.clear();
                self.chunks = 0;
                return Err(ProtocolError::ReplyTooLarge {
                    max: self.max_reply,
                });
            }
            self.body.extend_from_slice(&frame.payload);
            self.chunks += 1;

            if frame.flags.is_end_stream() {
                let body = self.body.split().freeze();
                self.chunks = 0;
                return parse_json(&body).map(Some);
            }
        }
        Ok(None)
    }

    /// Returns whether part of a reply has been received but not yet completed.
    pub fn is_mid_reply(&self) -> bool {
        self.chunks > 0 || !self.buffer.is_empty()
    }

    /// Number of chunks accumulated for the reply in progress.
    pub fn pending_chunks(&self) -> usize {
        self.chunks
    }

    /// Number of undecoded bytes buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.body.clear();
        self.chunks = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}
