//! Frame codec for the wake-word event protocol
//!
//! Every frame is a single UTF-8 JSON header line terminated by `\n`,
//! optionally followed by exactly `payload-length` raw bytes. Only
//! `audio-chunk` carries a payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Upper bound for one header line, newline excluded
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound for one audio-chunk payload (256 KiB)
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 256 * 1024;

/// Header field that declares the binary payload length
pub const PAYLOAD_LENGTH_FIELD: &str = "payload-length";

/// Every message type the codec accepts
pub const KNOWN_TYPES: &[&str] = &[
    "describe-request",
    "describe-response",
    "detect",
    "audio-start",
    "audio-chunk",
    "audio-stop",
    "detection",
    "not-detected",
    "error",
];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Header line too long: {len} bytes exceeds limit of {max}")]
    HeaderTooLong { len: usize, max: usize },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Header has no message type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Negative payload length: {0}")]
    NegativePayloadLength(i64),

    #[error("Invalid payload length: {0}")]
    InvalidPayloadLength(String),

    #[error("Payload too large: {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("Message type {0} requires a payload")]
    MissingPayload(&'static str),

    #[error("Message type {0} does not carry a payload")]
    UnexpectedPayload(&'static str),

    #[error("Failed to serialize header: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol message, discriminated by the `type` header field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Message {
    DescribeRequest,

    DescribeResponse {
        sample_rate: u32,
        format: String,
        channels: u16,
        detector_name: String,
        detector_version: String,
        #[serde(default)]
        keywords: Vec<String>,
    },

    /// Restricts which keywords are reported for following audio streams
    Detect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        names: Option<Vec<String>>,
    },

    AudioStart {
        sample_rate: u32,
        format: String,
        #[serde(default = "default_channels")]
        channels: u16,
    },

    AudioChunk,

    AudioStop,

    Detection {
        keyword_name: String,
        score: f32,
        /// Milliseconds from the start of the audio stream
        timestamp: u64,
    },

    NotDetected,

    Error { message: String, code: String },
}

fn default_channels() -> u16 {
    1
}

impl Message {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            Message::DescribeRequest => "describe-request",
            Message::DescribeResponse { .. } => "describe-response",
            Message::Detect { .. } => "detect",
            Message::AudioStart { .. } => "audio-start",
            Message::AudioChunk => "audio-chunk",
            Message::AudioStop => "audio-stop",
            Message::Detection { .. } => "detection",
            Message::NotDetected => "not-detected",
            Message::Error { .. } => "error",
        }
    }

    pub fn carries_payload(&self) -> bool {
        matches!(self, Message::AudioChunk)
    }
}

/// One protocol message plus its optional binary payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            payload: None,
        }
    }

    pub fn audio_chunk(audio: impl Into<Bytes>) -> Self {
        Self {
            message: Message::AudioChunk,
            payload: Some(audio.into()),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Message::Error {
            message: message.into(),
            code: code.to_string(),
        })
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

/// Length-prefixed JSON-line codec
///
/// Decoding is resumable: `Ok(None)` leaves the source buffer untouched, and
/// bytes are only split off once the header line and the whole declared
/// payload are available. A header is parsed once; while its payload is
/// still arriving the parsed form is kept in the codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_header_bytes: usize,
    max_chunk_bytes: usize,
    pending: Option<PendingHeader>,
}

/// Parsed header whose payload has not fully arrived
#[derive(Debug, Clone)]
struct PendingHeader {
    message: Message,
    // Header line length including the newline
    header_len: usize,
    payload_len: Option<usize>,
}

impl FrameCodec {
    pub fn new(max_header_bytes: usize, max_chunk_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_chunk_bytes,
            pending: None,
        }
    }

    /// Declared payload length of a frame whose header was read but whose
    /// payload is still incomplete
    pub fn pending_payload(&self) -> Option<usize> {
        self.pending.as_ref().and_then(|header| header.payload_len)
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes
    }

    fn read_header(&self, src: &BytesMut) -> Result<Option<PendingHeader>, CodecError> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_header_bytes {
                return Err(CodecError::HeaderTooLong {
                    len: src.len(),
                    max: self.max_header_bytes,
                });
            }
            return Ok(None);
        };

        if newline > self.max_header_bytes {
            return Err(CodecError::HeaderTooLong {
                len: newline,
                max: self.max_header_bytes,
            });
        }

        let (message, payload_len) = self.parse_header(&src[..newline])?;

        Ok(Some(PendingHeader {
            message,
            header_len: newline + 1,
            payload_len,
        }))
    }

    fn parse_header(&self, line: &[u8]) -> Result<(Message, Option<usize>), CodecError> {
        let mut header: Value = serde_json::from_slice(line)
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;

        let (kind, payload_length) = {
            let fields = header
                .as_object_mut()
                .ok_or_else(|| CodecError::InvalidHeader("header is not a JSON object".into()))?;

            let payload_length = match fields.remove(PAYLOAD_LENGTH_FIELD) {
                None | Some(Value::Null) => None,
                Some(raw) => Some(self.check_payload_length(&raw)?),
            };

            let kind = match fields.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                Some(other) => {
                    return Err(CodecError::InvalidHeader(format!(
                        "type must be a string, got {}",
                        other
                    )))
                }
                None => return Err(CodecError::MissingType),
            };

            (kind, payload_length)
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(CodecError::UnknownType(kind));
        }

        let message: Message = serde_json::from_value(header)
            .map_err(|e| CodecError::InvalidHeader(format!("{}: {}", kind, e)))?;

        match (message.carries_payload(), payload_length) {
            (true, None) => Err(CodecError::MissingPayload(message.kind())),
            (false, Some(_)) => Err(CodecError::UnexpectedPayload(message.kind())),
            _ => Ok((message, payload_length)),
        }
    }

    fn check_payload_length(&self, raw: &Value) -> Result<usize, CodecError> {
        if let Some(len) = raw.as_u64() {
            if len > self.max_chunk_bytes as u64 {
                return Err(CodecError::PayloadTooLarge {
                    len,
                    max: self.max_chunk_bytes,
                });
            }
            return Ok(len as usize);
        }

        match raw.as_i64() {
            Some(len) => Err(CodecError::NegativePayloadLength(len)),
            None => Err(CodecError::InvalidPayloadLength(raw.to_string())),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_CHUNK_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match self.read_header(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        let frame_len = header.header_len + header.payload_len.unwrap_or(0);
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let mut raw = src.split_to(frame_len);
        raw.advance(header.header_len);

        trace!("Decoded {} frame ({} payload bytes)", header.message.kind(), raw.len());

        Ok(Some(Frame {
            message: header.message,
            payload: header.payload_len.map(|_| raw.freeze()),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = match (frame.message.carries_payload(), frame.payload) {
            (true, payload) => Some(payload.unwrap_or_default()),
            (false, None) => None,
            (false, Some(_)) => return Err(CodecError::UnexpectedPayload(frame.message.kind())),
        };

        let mut header = serde_json::to_value(&frame.message)?;
        if let (Some(payload), Some(fields)) = (&payload, header.as_object_mut()) {
            fields.insert(PAYLOAD_LENGTH_FIELD.to_string(), Value::from(payload.len()));
        }

        let line = serde_json::to_vec(&header)?;
        let payload_len = payload.as_ref().map_or(0, Bytes::len);

        dst.reserve(line.len() + 1 + payload_len);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        if let Some(payload) = payload {
            dst.put_slice(&payload);
        }

        Ok(())
    }
}
