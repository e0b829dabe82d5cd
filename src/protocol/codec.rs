use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio_util::codec::Decoder;

use super::header::{flags, Compression, Header, Serialization, HEADER_SIZE};
use super::message::{AudioFrame, MessageBody, MessageType, ProtocolMessage};
use super::sequence::SequenceAllocator;
use crate::core::{Error, Result, DEFAULT_MAX_FRAME_PAYLOAD};

/// Upper bound on inflated size relative to the frame limit
const MAX_INFLATE_RATIO: u64 = 16;

/// CRC-32 (IEEE) over a payload
pub fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// One frame ready for the wire
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// Header as written
    pub header: Header,
    /// Header followed by payload
    pub bytes: Bytes,
}

/// A serialized and compressed payload still waiting for its sequence number.
///
/// Stamping draws the sequence, so stamping under the transport's write lock
/// keeps wire order and sequence order identical.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedFrame {
    message_type: MessageType,
    flags: u8,
    sequence: Option<u32>,
    serialization: Serialization,
    compression: Compression,
    checksum: u32,
    payload: Bytes,
}

impl PreparedFrame {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Payload length as it will travel
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Frame codec for one connection.
///
/// Cloning shares the sequence allocator, so every clone draws from the
/// same per-connection counter.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    sequence: Arc<SequenceAllocator>,
    max_payload: u32,
}

impl FrameCodec {
    /// Creates a codec with a fresh sequence counter
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_PAYLOAD)
    }

    /// Creates a codec with a custom frame payload limit
    pub fn with_max_payload(max_payload: u32) -> Self {
        FrameCodec {
            sequence: Arc::new(SequenceAllocator::new()),
            max_payload,
        }
    }

    /// The allocator shared by every clone of this codec
    pub fn sequence(&self) -> &Arc<SequenceAllocator> {
        &self.sequence
    }

    /// Encodes one message, drawing its sequence number immediately.
    ///
    /// The serialization must be the one the catalog assigns to the body's
    /// type; anything else is a configuration error.
    pub fn encode_message(
        &self,
        body: &MessageBody,
        compression: Compression,
        serialization: Serialization,
    ) -> Result<EncodedFrame> {
        let prepared = self.prepare(body, compression, serialization)?;
        Ok(self.stamp(&prepared))
    }

    /// Serializes and compresses a body without assigning a sequence number
    pub fn prepare(
        &self,
        body: &MessageBody,
        compression: Compression,
        serialization: Serialization,
    ) -> Result<PreparedFrame> {
        let message_type = body.message_type();
        let required = message_type.serialization();
        if serialization != required {
            return Err(Error::config(format!(
                "{} frames travel as {:?}, not {:?}",
                message_type.name(),
                required,
                serialization
            )));
        }

        let raw = body.to_payload()?;
        let payload = match compression {
            Compression::None => raw,
            Compression::Gzip => gzip(&raw)?,
        };
        if u32::try_from(payload.len()).map_or(true, |len| len > self.max_payload) {
            return Err(Error::validation(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                self.max_payload
            )));
        }

        let mut frame_flags = 0u8;
        let sequence = match body {
            MessageBody::ClientAudioOnly(AudioFrame {
                sequence: Some(sequence),
                ..
            }) => {
                frame_flags |= flags::SEQUENCE_OVERRIDE;
                Some(*sequence)
            }
            _ => None,
        };
        if matches!(body, MessageBody::ServerErrorResponse(_)) {
            frame_flags |= flags::ERROR;
        }

        Ok(PreparedFrame {
            message_type,
            flags: frame_flags,
            sequence,
            serialization,
            compression,
            checksum: checksum(&payload),
            payload: Bytes::from(payload),
        })
    }

    /// Prepares with the catalog's serialization, compressing off the async
    /// runtime when compression is requested.
    pub async fn prepare_offloaded(&self, body: MessageBody, compression: Compression) -> Result<PreparedFrame> {
        let serialization = body.message_type().serialization();
        if compression == Compression::None {
            return self.prepare(&body, compression, serialization);
        }

        let codec = self.clone();
        tokio::task::spawn_blocking(move || codec.prepare(&body, compression, serialization))
            .await
            .map_err(|e| Error::Encoder(e.to_string()))?
    }

    /// Assigns the next sequence number (unless the caller fixed one) and
    /// lays out header and payload.
    pub fn stamp(&self, prepared: &PreparedFrame) -> EncodedFrame {
        let header = Header {
            message_type: prepared.message_type,
            flags: prepared.flags,
            sequence: prepared.sequence.unwrap_or_else(|| self.sequence.allocate()),
            payload_length: prepared.payload.len() as u32,
            serialization: prepared.serialization,
            compression: prepared.compression,
            checksum: prepared.checksum,
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + prepared.payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&prepared.payload);

        EncodedFrame {
            header,
            bytes: buf.freeze(),
        }
    }

    /// Decodes exactly one frame from the front of `bytes`.
    ///
    /// Trailing bytes beyond the frame are ignored.
    pub fn decode_message(&self, bytes: &[u8]) -> Result<ProtocolMessage> {
        let header = Header::decode(bytes)?;
        self.check_length(&header)?;

        let total = header.frame_len();
        if bytes.len() < total {
            return Err(Error::Incomplete {
                needed: total,
                available: bytes.len(),
            });
        }

        let payload = &bytes[HEADER_SIZE..total];
        let actual = checksum(payload);
        if actual != header.checksum {
            return Err(Error::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        if header.serialization != header.message_type.serialization() {
            return Err(Error::unsupported(format!(
                "{} frame with {:?} serialization",
                header.message_type.name(),
                header.serialization
            )));
        }

        let payload = match header.compression {
            Compression::None => Cow::Borrowed(payload),
            Compression::Gzip => Cow::Owned(self.gunzip(payload)?),
        };
        let body = MessageBody::from_payload(&header, &payload)?;

        Ok(ProtocolMessage { header, body })
    }

    /// Checks header, length and checksum without deserializing
    pub fn validate_integrity(&self, bytes: &[u8]) -> bool {
        let header = match Header::decode(bytes) {
            Ok(header) => header,
            Err(_) => return false,
        };
        if self.check_length(&header).is_err() || bytes.len() < header.frame_len() {
            return false;
        }
        checksum(&bytes[HEADER_SIZE..header.frame_len()]) == header.checksum
    }

    /// Reads the header if one is present and well formed
    pub fn peek_header(bytes: &[u8]) -> Option<Header> {
        Header::decode(bytes).ok()
    }

    fn check_length(&self, header: &Header) -> Result<()> {
        if header.payload_length > self.max_payload {
            return Err(Error::unsupported(format!(
                "payload length {} exceeds maximum {}",
                header.payload_length, self.max_payload
            )));
        }
        Ok(())
    }

    fn gunzip(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let limit = self.max_payload as u64 * MAX_INFLATE_RATIO;
        let mut inflated = Vec::new();
        GzDecoder::new(payload)
            .take(limit + 1)
            .read_to_end(&mut inflated)
            .map_err(|e| Error::malformed(format!("gzip payload: {}", e)))?;
        if inflated.len() as u64 > limit {
            return Err(Error::malformed(format!(
                "gzip payload inflates past {} bytes",
                limit
            )));
        }
        Ok(inflated)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn gzip(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), flate2::Compression::fast());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

/// Demultiplexes frames from an un-delimited byte stream.
///
/// A frame that fails verification after its length is known is consumed,
/// so the next call starts at the following frame. An untrustworthy header
/// discards everything buffered.
impl Decoder for FrameCodec {
    type Item = ProtocolMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = match Header::decode(&src[..HEADER_SIZE]).and_then(|header| {
            self.check_length(&header)?;
            Ok(header)
        }) {
            Ok(header) => header,
            Err(e) => {
                src.clear();
                return Err(e);
            }
        };

        let total = header.frame_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        self.decode_message(&frame).map(Some)
    }

    /// Like `decode`, but the buffer ends at a message boundary: a partial
    /// frame left over is reported as incomplete and dropped.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let needed = Header::decode(&src[..]).map_or(HEADER_SIZE, |header| header.frame_len());
        let available = src.len();
        src.clear();
        Err(Error::Incomplete { needed, available })
    }
}
