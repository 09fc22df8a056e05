//! Binary frame format.
//!
//! Every request is carried by one frame. A reply body may be split over
//! several `STREAM` frames, the last of which also carries `END_STREAM`.
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | header_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | [header_ext] | payload                                        |
//! | header_len   | payload_len bytes                              |
//! +--------------+------------------------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "MSWX"
pub const MAGIC: [u8; 4] = *b"MSWX";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// The CRC32C field covers the payload.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Reserved.
    pub const COMPRESSED: u16 = 1 << 1;
    /// The payload is one chunk of a larger body.
    pub const STREAM: u16 = 1 << 2;
    /// The payload is the terminal chunk of a body.
    pub const END_STREAM: u16 = 1 << 3;

    const VALID_V1_MASK: u16 = 0x000F;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_stream(mut self) -> Self {
        self.0 |= Self::STREAM;
        self
    }

    pub fn with_end_stream(mut self) -> Self {
        self.0 |= Self::END_STREAM;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_stream(&self) -> bool {
        self.0 & Self::STREAM != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & Self::END_STREAM != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// Reserved for future use; carried through untouched.
    pub header_extension: Bytes,
    pub payload: Bytes,
}

impl Frame {
    /// A self-contained frame with a CRC-protected payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            header_extension: Bytes::new(),
            payload,
        }
    }

    /// One chunk of a multi-frame body. `last` marks the terminal chunk.
    pub fn chunk(payload: Bytes, last: bool) -> Self {
        let mut flags = FrameFlags::new().with_crc().with_stream();
        if last {
            flags = flags.with_end_stream();
        }
        Self {
            flags,
            ..Self::new(payload)
        }
    }

    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Returns whether this frame completes a body (either unchunked or terminal chunk).
    pub fn completes_body(&self) -> bool {
        !self.flags.is_stream() || self.flags.is_end_stream()
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(ProtocolError::FrameTooLarge {
                size: self.payload.len().min(u32::MAX as usize) as u32,
                max: MAX_PAYLOAD_SIZE,
            })?;
        let header_len = self.header_extension.len() as u16;

        buf.reserve(FRAME_HEADER_SIZE + self.header_extension.len() + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(header_len);
        buf.put_u32(payload_len);
        buf.put_u32(if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        });
        buf.put_slice(&self.header_extension);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame is incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = header.get_u16();
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(header.get_u16())?;
        let header_len = header.get_u16() as usize;
        let payload_len = header.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = header.get_u32();

        let payload_len = payload_len as usize;
        if buf.len() < FRAME_HEADER_SIZE + header_len + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header_extension = buf.split_to(header_len).freeze();
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            header_extension,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(r#"{"type":"login","token":"xapi"}"#);
        let mut buf = Frame::new(payload.clone()).encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.version, crate::PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert!(decoded.completes_body());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_chunk_flags() {
        let mid = Frame::chunk(Bytes::from_static(b"ab"), false);
        assert!(mid.flags.is_stream());
        assert!(!mid.flags.is_end_stream());
        assert!(!mid.completes_body());

        let last = Frame::chunk(Bytes::from_static(b"cd"), true);
        assert!(last.flags.is_stream());
        assert!(last.flags.is_end_stream());
        assert!(last.completes_body());
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = Frame::new(Bytes::from(r#"{"type":"diagnostics"}"#))
            .encode()
            .unwrap();
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf =
            BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(m)) if &m == b"BADX"));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf =
            BytesMut::from(&b"MSWX\x00\x09\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(9))));
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        let encoded = Frame::new(Bytes::from_static(b"0123456789"))
            .encode()
            .unwrap();

        let mut partial = BytesMut::from(&encoded[..8]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 8);

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 1);
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let result = Frame::new(Bytes::from(huge)).encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_header_extension_is_preserved() {
        let mut frame = Frame::new(Bytes::from_static(b"{}"));
        frame.header_extension = Bytes::from_static(b"ext");
        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header_extension.as_ref(), b"ext");
        assert_eq!(decoded.payload.as_ref(), b"{}");
    }

    #[test]
    fn test_frame_without_crc_skips_validation() {
        let mut frame = Frame::new(Bytes::from_static(b"{}"));
        frame.flags = FrameFlags::new();
        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    proptest! {
        #[test]
        fn prop_back_to_back_frames_split_anywhere(
            first in proptest::collection::vec(any::<u8>(), 0..256),
            second in proptest::collection::vec(any::<u8>(), 0..256),
            split in 0usize..600,
        ) {
            let mut wire = BytesMut::new();
            Frame::new(Bytes::from(first.clone())).encode_into(&mut wire).unwrap();
            Frame::chunk(Bytes::from(second.clone()), true).encode_into(&mut wire).unwrap();

            let split = split.min(wire.len());
            let mut buf = BytesMut::from(&wire[..split]);
            let mut decoded = Vec::new();
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
            buf.extend_from_slice(&wire[split..]);
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                decoded.push(frame);
            }

            prop_assert_eq!(decoded.len(), 2);
            prop_assert_eq!(decoded[0].payload.as_ref(), &first[..]);
            prop_assert_eq!(decoded[1].payload.as_ref(), &second[..]);
            prop_assert!(decoded[1].flags.is_end_stream());
        }
    }
}
