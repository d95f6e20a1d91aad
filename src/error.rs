//! Session-scoped error taxonomy
//!
//! Every variant terminates only the session it originated in. All but
//! `Transport` are reported to the client as one `error` frame before the
//! connection is closed.

use crate::audio_buffer::BufferError;
use crate::detector::DetectorError;
use crate::protocol::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(CodecError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    BufferOverflow(BufferError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Detector fault: {0}")]
    DetectorFault(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl SessionError {
    /// Value of the `code` field in the `error` frame
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::MalformedFrame(_) => "malformed-frame",
            SessionError::ProtocolViolation(_) => "protocol-violation",
            SessionError::BufferOverflow(_) => "buffer-overflow",
            SessionError::Config(_) => "config-error",
            SessionError::DetectorFault(_) => "detector-fault",
            SessionError::ServerBusy(_) => "server-busy",
            SessionError::Transport(_) => "transport-error",
        }
    }

    /// Whether the client should be told before disconnecting
    pub fn is_reportable(&self) -> bool {
        !matches!(self, SessionError::Transport(_))
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => SessionError::Transport(io),
            other => SessionError::MalformedFrame(other),
        }
    }
}

impl From<BufferError> for SessionError {
    fn from(err: BufferError) -> Self {
        SessionError::BufferOverflow(err)
    }
}

impl From<DetectorError> for SessionError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Fault(message) => SessionError::DetectorFault(message),
            other => SessionError::Config(other.to_string()),
        }
    }
}
