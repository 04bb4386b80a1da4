//! Error types for the wire codec and the connection state machine.
//!
//! Wire errors never reach the application directly (§7 of the spec): a
//! [`WireError`] is always translated into a transport error code and
//! surfaces to the caller as a `ConnectionClose` event. [`ConnectionError`]
//! is the type returned by the public connection API for local misuse
//! (writing to a closed stream, flow-control violations raised locally).

use thiserror::Error;

/// RFC 9000 §20.1 transport error codes, plus the CRYPTO_ERROR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    CryptoError(u8),
}

impl TransportErrorCode {
    pub fn code(self) -> u64 {
        match self {
            Self::NoError => 0x00,
            Self::InternalError => 0x01,
            Self::ConnectionRefused => 0x02,
            Self::FlowControlError => 0x03,
            Self::StreamLimitError => 0x04,
            Self::StreamStateError => 0x05,
            Self::FinalSizeError => 0x06,
            Self::FrameEncodingError => 0x07,
            Self::TransportParameterError => 0x08,
            Self::ConnectionIdLimitError => 0x09,
            Self::ProtocolViolation => 0x0a,
            Self::InvalidToken => 0x0b,
            Self::ApplicationError => 0x0c,
            Self::CryptoBufferExceeded => 0x0d,
            Self::KeyUpdateError => 0x0e,
            Self::AeadLimitReached => 0x0f,
            Self::NoViablePath => 0x10,
            Self::CryptoError(alert) => 0x0100 + alert as u64,
        }
    }
}

/// Errors raised while parsing or serialising bytes off/onto the wire.
///
/// A `WireError` is always local to one packet or frame; it never mutates
/// connection state (§4.4) and is mapped to a [`TransportErrorCode`] by the
/// caller before being folded into a `CONNECTION_CLOSE`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short to decode value")]
    ShortBuffer,
    #[error("varint value exceeds 2^62 - 1")]
    ValueTooLarge,
    #[error("frame did not consume exactly its encoded length")]
    FrameEncoding,
    #[error("frame type {0:#x} is not permitted at this encryption level")]
    FrameNotAllowed(u64),
    #[error("unknown frame type {0:#x}")]
    UnknownFrame(u64),
    #[error("header fixed bit is not set")]
    InvalidFixedBit,
    #[error("reserved bits are non-zero")]
    ReservedBitsSet,
    #[error("initial packet shorter than 1200 bytes")]
    InitialTooShort,
    #[error("unsupported QUIC version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("retry integrity tag mismatch")]
    RetryIntegrityMismatch,
    #[error("AEAD open/seal failed")]
    AeadFailure,
    #[error("connection ID length out of range")]
    InvalidConnectionIdLength,
    #[error("transport parameter {0} present more than once")]
    DuplicateTransportParameter(u64),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl WireError {
    /// Maps a decoding failure to the transport error code used to close
    /// the connection, per §7(a).
    pub fn transport_code(&self) -> TransportErrorCode {
        match self {
            WireError::FrameEncoding
            | WireError::ShortBuffer
            | WireError::ValueTooLarge
            | WireError::InvalidFixedBit
            | WireError::UnsupportedVersion(_)
            | WireError::InvalidConnectionIdLength => TransportErrorCode::FrameEncodingError,
            WireError::FrameNotAllowed(_)
            | WireError::UnknownFrame(_)
            | WireError::ReservedBitsSet
            | WireError::ProtocolViolation(_) => TransportErrorCode::ProtocolViolation,
            WireError::InitialTooShort => TransportErrorCode::ProtocolViolation,
            WireError::RetryIntegrityMismatch => TransportErrorCode::ProtocolViolation,
            WireError::AeadFailure => TransportErrorCode::ProtocolViolation,
            WireError::DuplicateTransportParameter(_) => {
                TransportErrorCode::TransportParameterError
            }
        }
    }
}

/// Errors surfaced by the public connection/stream API.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("connection is closed")]
    Closed,
    #[error("stream {0} does not exist")]
    UnknownStream(u64),
    #[error("stream {0} was reset by the peer with code {1}")]
    StreamReset(u64, u64),
    #[error("stream {0} send side already closed")]
    StreamSendClosed(u64),
    #[error("peer closed the connection: code={0:#x} reason={1:?}")]
    PeerClosed(u64, String),
    #[error("local stream limit reached")]
    StreamLimitReached,
    #[error("flow control limit reached")]
    FlowControlBlocked,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("tls error: {0}")]
    Tls(String),
}
