//! Error types for the rendezvous protocol library.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame was not valid UTF-8.
    #[error("invalid utf-8 at byte {byte_pos}: {details}")]
    InvalidUtf8 {
        /// Offset of the first invalid byte.
        byte_pos: usize,
        /// Decoder error description.
        details: String,
    },

    /// A frame exceeded the configured maximum length.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong {
        /// Observed length in bytes.
        actual: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A frame contained a control character other than the line terminator.
    #[error("illegal control character: {0:?}")]
    IllegalControlChar(char),

    /// A frame was valid text but not a valid protocol message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// WebSocket framing error.
    #[cfg(feature = "tokio")]
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ProtocolError {
    /// Whether the connection can keep reading after this error.
    ///
    /// Malformed JSON inside an otherwise well-framed line leaves the stream
    /// in sync; everything else does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Errors that can occur when reading from a transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportReadError {
    /// An I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A protocol error occurred.
    #[error("transport protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportReadError {
    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_) => false,
            Self::Protocol(e) => e.is_recoverable(),
        }
    }
}
