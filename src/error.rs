//! Error types for relaywire.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::InteractionKind;

/// Main error type for all relaywire operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed or oversized frame. Fatal to the connection.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Frame referenced a stream ID with no open exchange.
    #[error("Unknown stream ID: {0}")]
    UnknownStream(u32),

    /// No free stream ID is left on this connection.
    #[error("Stream ID space exhausted")]
    Exhausted,

    /// No registered route matches the destination.
    #[error("No route for destination: {0}")]
    NoRoute(String),

    /// The matched route is registered for a different interaction kind.
    #[error("Route {route} is registered as {registered}, requested as {requested}")]
    InteractionMismatch {
        /// Destination that was requested.
        route: String,
        /// Interaction kind the route was registered with.
        registered: InteractionKind,
        /// Interaction kind of the incoming request.
        requested: InteractionKind,
    },

    /// A path variable or payload could not be bound to the handler's type.
    #[error("Cannot bind {name}: {reason}")]
    Binding {
        /// Variable name, or `payload`.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Two registered patterns match the same destinations with equal specificity.
    #[error("Route {0} is ambiguous with already registered {1}")]
    AmbiguousRoute(String, String),

    /// Route pattern or template could not be parsed.
    #[error("Invalid route pattern {pattern}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Input/output cardinality pair has no interaction kind.
    #[error("Invalid call descriptor: {0}")]
    InvalidDescriptor(String),

    /// Proxy method name was never declared.
    #[error("Unknown proxy method: {0}")]
    UnknownMethod(String),

    /// Error raised by application handler code.
    #[error("Application error: {0}")]
    Application(String),

    /// Error reported by the peer in an ERROR frame.
    #[error("Remote error ({code}): {message}")]
    Remote {
        /// Error code carried by the frame.
        code: ErrorCode,
        /// Human readable message.
        message: String,
    },

    /// Connection closed while the exchange was open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Exchange was cancelled.
    #[error("Exchange cancelled")]
    Cancelled,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Protocol violation scoped to one exchange.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Convenience constructor for handler-raised errors.
    pub fn application(message: impl Into<String>) -> Self {
        RelayError::Application(message.into())
    }

    /// Wire code used when this error is sent back in an ERROR frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::NoRoute(_) => ErrorCode::NoRoute,
            RelayError::InteractionMismatch { .. } => ErrorCode::InteractionMismatch,
            RelayError::Binding { .. } => ErrorCode::Binding,
            RelayError::MsgPackDecode(_) => ErrorCode::InvalidPayload,
            RelayError::Application(_) => ErrorCode::Application,
            RelayError::Cancelled => ErrorCode::Cancelled,
            RelayError::Protocol(_) | RelayError::UnknownStream(_) => ErrorCode::Protocol,
            RelayError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Check whether the peer answered with a route-not-found error.
    pub fn is_no_route(&self) -> bool {
        matches!(
            self,
            RelayError::NoRoute(_)
                | RelayError::Remote {
                    code: ErrorCode::NoRoute,
                    ..
                }
        )
    }
}

/// Frame-level decode/encode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Declared body length exceeds the configured maximum.
    #[error("frame body of {len} bytes exceeds maximum {max}")]
    OversizedFrame {
        /// Declared body length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Buffer ended before a field was complete.
    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Buffer length disagrees with the header length field.
    #[error("length field says {declared} bytes, buffer holds {actual}")]
    LengthMismatch {
        /// Body length from the header.
        declared: usize,
        /// Actual body length.
        actual: usize,
    },

    /// Kind tag not known to this implementation.
    #[error("unknown frame kind tag {0:#04x}")]
    UnknownKind(u8),

    /// Reserved flag bits were set.
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    /// Route or metadata was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Initiating frame carried no route.
    #[error("initiating frame without a route")]
    MissingRoute,

    /// Field does not fit its length prefix.
    #[error("{field} of {len} bytes does not fit a u16 length prefix")]
    FieldTooLong {
        /// Field being written.
        field: &'static str,
        /// Its length.
        len: usize,
    },
}

/// Numeric error codes carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// Handler returned an application error.
    Application = 1,
    /// No route matched.
    NoRoute = 2,
    /// Route registered for another interaction kind.
    InteractionMismatch = 3,
    /// Path variable coercion failed.
    Binding = 4,
    /// Payload could not be decoded.
    InvalidPayload = 5,
    /// Responder refused the request (capacity).
    Rejected = 6,
    /// Exchange cancelled.
    Cancelled = 7,
    /// Peer violated the protocol on this stream.
    Protocol = 8,
    /// Anything else.
    Internal = 9,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Application,
            2 => Self::NoRoute,
            3 => Self::InteractionMismatch,
            4 => Self::Binding,
            5 => Self::InvalidPayload,
            6 => Self::Rejected,
            7 => Self::Cancelled,
            8 => Self::Protocol,
            _ => Self::Internal,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Application => "application",
            Self::NoRoute => "no-route",
            Self::InteractionMismatch => "interaction-mismatch",
            Self::Binding => "binding",
            Self::InvalidPayload => "invalid-payload",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
