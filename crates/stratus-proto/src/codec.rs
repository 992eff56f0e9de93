//! Frame encoding and decoding utilities.

use bytes::{Buf, BufMut, BytesMut};
use rkyv::rancor::Error as RkyvError;
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default maximum message size (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Largest payload length a frame header can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Current protocol version.
pub const CURRENT_VERSION: u16 = crate::version::CURRENT;

/// Frame kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameKind {
    /// Frame carrying one serialised [`Envelope`].
    Envelope = 0x01,
}

impl FrameKind {
    /// Creates a frame kind from a numeric value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::Envelope),
            _ => None,
        }
    }

    /// Returns the numeric value of this frame kind.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Frame header for protocol messages.
///
/// Wire format (8 bytes, big-endian):
/// - Bytes 0-1: Protocol version (u16)
/// - Bytes 2-3: Frame kind (u16)
/// - Bytes 4-7: Payload length (u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u16,
    /// Frame kind discriminant.
    pub kind: FrameKind,
    /// Length of the payload in bytes.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Creates a new frame header.
    #[must_use]
    pub const fn new(kind: FrameKind, payload_len: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            kind,
            payload_len,
        }
    }

    /// Encodes the frame header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decodes a frame header from bytes.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        let kind_raw = u16::from_be_bytes([bytes[2], bytes[3]]);
        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let kind = FrameKind::from_u16(kind_raw).ok_or(ProtocolError::UnknownFrameKind(kind_raw))?;

        Ok(Self {
            version,
            kind,
            payload_len,
        })
    }

    /// Checks if this header's version is supported.
    #[must_use]
    pub fn is_version_supported(&self) -> bool {
        self.version >= crate::version::MIN_SUPPORTED && self.version <= crate::version::CURRENT
    }

    /// Validates the payload length against a limit.
    pub fn validate_payload_len(&self, max: usize) -> Result<(), ProtocolError> {
        let len = self.payload_len as usize;
        if len > max {
            return Err(ProtocolError::MessageTooLarge { size: len, max });
        }
        Ok(())
    }
}

fn envelope_header(len: usize) -> Result<FrameHeader, ProtocolError> {
    let payload_len = u32::try_from(len).map_err(|_| ProtocolError::MessageTooLarge {
        size: len,
        max: MAX_FRAME_PAYLOAD,
    })?;
    Ok(FrameHeader::new(FrameKind::Envelope, payload_len))
}

/// Codec for encoding and decoding envelopes to complete frames.
#[derive(Debug)]
pub struct Codec {
    /// Reusable buffer for encoding.
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Creates a new codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Creates a codec with a custom size limit.
    ///
    /// The limit is capped at the largest length a frame header can carry.
    #[must_use]
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size: max_message_size.min(MAX_FRAME_PAYLOAD),
        }
    }

    /// Returns the configured size limit.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Serialises an envelope without framing.
    pub fn serialise(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        let payload = rkyv::to_bytes::<RkyvError>(envelope)
            .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;

        if payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        Ok(payload.to_vec())
    }

    /// Encodes an envelope to bytes (frame header + payload).
    ///
    /// Returns the complete frame including the 8-byte header.
    pub fn encode(&mut self, envelope: &Envelope) -> Result<&[u8], ProtocolError> {
        let payload = self.serialise(envelope)?;

        let header = envelope_header(payload.len())?;
        self.buffer.clear();
        self.buffer.extend_from_slice(&header.encode());
        self.buffer.extend_from_slice(&payload);

        Ok(&self.buffer)
    }

    /// Decodes an envelope from bytes.
    ///
    /// The bytes should NOT include the frame header - just the payload.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        // rkyv requires aligned input; frames sliced from a stream buffer are not.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Envelope, RkyvError>(&aligned)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
    }
}

/// Streaming codec framing [`Envelope`]s for `tokio_util::codec`.
#[derive(Debug)]
pub struct EnvelopeCodec {
    inner: Codec,
    pending: Option<FrameHeader>,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Creates a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a codec with a custom size limit.
    #[must_use]
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            inner: Codec::with_max_message_size(max_message_size),
            pending: None,
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }

                let mut raw = [0u8; FRAME_HEADER_SIZE];
                raw.copy_from_slice(&src[..FRAME_HEADER_SIZE]);
                let header = FrameHeader::decode(&raw)?;
                if !header.is_version_supported() {
                    return Err(ProtocolError::UnsupportedVersion(header.version));
                }
                header.validate_payload_len(self.inner.max_message_size())?;

                src.advance(FRAME_HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len);
        Codec::decode(&payload).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.inner.serialise(&item)?;
        let header = envelope_header(payload.len())?;

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_slice(&header.encode());
        dst.put_slice(&payload);
        Ok(())
    }
}
