//! Gateway Error Taxonomy
//!
//! Every failure surfaced to callers of the gateway maps onto one
//! [`GatewayError`] variant. The type is `Clone` so a single teardown
//! reason can be fanned out to every pending request on a connection.

use std::time::Duration;

use crate::domain::schema::SchemaError;

/// Upstream error codes carried in response headers.
///
/// Numeric values outside the known set are preserved in [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Request succeeded.
    Success,
    /// Malformed request payload.
    Format,
    /// Unknown command identifier.
    NoCommand,
    /// Referenced field does not exist.
    NoField,
    /// Missing sequence identifier.
    NoSequence,
    /// Upstream is not ready to serve requests.
    NotReady,
    /// Token rejected.
    Token,
    /// Unknown market.
    Market,
    /// Unknown namespace.
    Namespace,
    /// Unknown qualified name.
    QualifiedName,
    /// Invalid request parameter.
    InvalidParameter,
    /// No token supplied.
    NoToken,
    /// Token expired.
    ExpiredToken,
    /// Unspecified upstream failure.
    Unknown,
    /// Code outside the known set.
    Other(i32),
}

impl ErrorCode {
    /// Map a raw wire code onto the known set.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Format,
            2 => Self::NoCommand,
            3 => Self::NoField,
            4 => Self::NoSequence,
            5 => Self::NotReady,
            6 => Self::Token,
            7 => Self::Market,
            8 => Self::Namespace,
            9 => Self::QualifiedName,
            10 => Self::InvalidParameter,
            11 => Self::NoToken,
            12 => Self::ExpiredToken,
            99 => Self::Unknown,
            other => Self::Other(other),
        }
    }

    /// Raw wire code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Format => 1,
            Self::NoCommand => 2,
            Self::NoField => 3,
            Self::NoSequence => 4,
            Self::NotReady => 5,
            Self::Token => 6,
            Self::Market => 7,
            Self::Namespace => 8,
            Self::QualifiedName => 9,
            Self::InvalidParameter => 10,
            Self::NoToken => 11,
            Self::ExpiredToken => 12,
            Self::Unknown => 99,
            Self::Other(code) => code,
        }
    }

    /// Whether the code signals success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Errors surfaced by connections, the pool, and the subscription hub.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Transport could not be opened or a send failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upstream answered with a nonzero error code.
    #[error("server error {code}: {message}")]
    Server {
        /// Raw error code.
        code: i32,
        /// Upstream error message.
        message: String,
    },

    /// A response arrived for a sequence id nobody is waiting on.
    #[error("no pending request for sequence id {0}")]
    CorrelationMiss(u32),

    /// No idle connection in the pool.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Descriptor lookup failed.
    #[error(transparent)]
    SchemaResolution(#[from] SchemaError),

    /// Connection was torn down while the request was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// Request did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Operation requires a bootstrapped connection.
    #[error("connection not ready (state: {0})")]
    NotReady(String),

    /// Operation is not allowed in the connection's current state.
    #[error("invalid connection state: {0}")]
    InvalidState(String),

    /// Codec boundary failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Record and object conversion failure.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Every pool bootstrap failed.
    #[error("all {0} connection bootstraps failed")]
    AllBootstrapsFailed(usize),
}

impl GatewayError {
    /// Build a server error from a response header.
    #[must_use]
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trips_known_values() {
        for raw in 0..=12 {
            assert_eq!(ErrorCode::from_code(raw).code(), raw);
        }
        assert_eq!(ErrorCode::from_code(99), ErrorCode::Unknown);
    }

    #[test]
    fn error_code_preserves_unknown_values() {
        let code = ErrorCode::from_code(4711);
        assert_eq!(code, ErrorCode::Other(4711));
        assert_eq!(code.code(), 4711);
        assert!(!code.is_success());
    }

    #[test]
    fn server_error_display_carries_code_and_message() {
        let err = GatewayError::server(7, "unknown market XYZ");
        assert_eq!(err.to_string(), "server error 7: unknown market XYZ");
    }
}
