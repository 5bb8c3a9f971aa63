//! # Error Types
//!
//! Two channels carry failures out of the binding:
//! - **Return values** (`Error`): synchronous misuse or "not ready" results
//!   from `open_stream`, `write`, `read` and friends.
//! - **Events**: asynchronous transport failures are converted into
//!   connection-scope events by the engine adapter and never surface as
//!   raw engine errors.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Transport error codes as defined in RFC 9000 Section 20.1
///
/// Carried in CONNECTION_CLOSE when the binding closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportErrorCode {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    ProtocolViolation = 0x0a,
    /// Base of the CRYPTO_ERROR range (0x0100-0x01ff)
    CryptoError = 0x0100,
}

impl TransportErrorCode {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Transport-level failure reported by the engine adapter
///
/// `MalformedPacket`, `HandshakeFailure` and `VersionMismatch` are
/// recoverable at the adapter: they become connection-scope events.
/// `ResourceExhausted` and `ProtocolViolation` force the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("malformed packet")]
    MalformedPacket,

    /// TLS handshake rejected; carries the QUIC CRYPTO_ERROR code
    #[error("handshake failure (code 0x{code:x})")]
    HandshakeFailure { code: u64 },

    #[error("version mismatch")]
    VersionMismatch,

    #[error("resource exhausted")]
    ResourceExhausted,

    /// Engine-detected protocol violation with its transport error code
    #[error("protocol violation (code 0x{code:x})")]
    ProtocolViolation { code: u64 },
}

impl TransportError {
    /// Whether this error forces the connection closed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ResourceExhausted | TransportError::ProtocolViolation { .. }
        )
    }

    /// Transport error code to report in CONNECTION_CLOSE
    pub fn close_code(&self) -> u64 {
        match self {
            TransportError::MalformedPacket => TransportErrorCode::ProtocolViolation.code(),
            TransportError::HandshakeFailure { code } => *code,
            TransportError::VersionMismatch => TransportErrorCode::ConnectionRefused.code(),
            TransportError::ResourceExhausted => TransportErrorCode::InternalError.code(),
            TransportError::ProtocolViolation { code } => *code,
        }
    }
}

/// Generic Result Type for binding operations
pub type Result<T> = core::result::Result<T, Error>;

/// Synchronous error returned from application-facing calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No flow-control credit; retry after a `StreamWritable` event
    #[error("flow control blocked")]
    FlowControlBlocked,

    /// Peer's concurrent stream limit reached
    #[error("stream limit exceeded")]
    StreamLimitExceeded,

    /// Stream side is finished, reset, or the stream was destroyed
    #[error("stream closed")]
    StreamClosed,

    /// Stream never existed on this connection
    #[error("stream not found")]
    StreamNotFound,

    /// Connection is draining or closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Nothing to read yet; wait for a `StreamReadable` event
    #[error("would block")]
    WouldBlock,

    #[error("invalid input")]
    InvalidInput,
}

impl Error {
    /// Whether the caller may retry the same call after an event
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::FlowControlBlocked | Error::StreamLimitExceeded | Error::WouldBlock
        )
    }
}
