//! Connection state machine states.

use std::fmt;

/// Bootstrap and lifecycle state of one connection.
///
/// `Failed` and `Closed` are terminal for a session; a new `connect()`
/// starts over from `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Transport opening.
    Connecting,
    /// Handshake sent, waiting for the schema frame.
    AwaitingSchema,
    /// Schema loaded, waiting for the universe revision response.
    AwaitingUniverseRevision,
    /// Serving requests while seeds responses are still outstanding.
    AwaitingUniverseSeeds {
        /// Seeds responses not yet received.
        outstanding: usize,
    },
    /// Fully bootstrapped.
    Ready,
    /// Bootstrap failed.
    Failed,
    /// Transport closed after bootstrap.
    Closed,
}

impl ConnectionState {
    /// Whether fetch and subscribe requests are accepted.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::AwaitingUniverseSeeds { .. } | Self::Ready)
    }

    /// Whether the session has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether `connect()` may start a new session.
    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Failed | Self::Closed)
    }

    /// Whether the bootstrap has not reached readiness yet.
    #[must_use]
    pub const fn is_bootstrapping(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingSchema | Self::AwaitingUniverseRevision
        )
    }

    /// Stable name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingSchema => "awaiting_schema",
            Self::AwaitingUniverseRevision => "awaiting_universe_revision",
            Self::AwaitingUniverseSeeds { .. } => "awaiting_universe_seeds",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingUniverseSeeds { outstanding } => {
                write!(f, "awaiting_universe_seeds({outstanding})")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Progress of the universe seeds fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedStatus {
    /// Responses outstanding or bootstrap not started.
    #[default]
    Pending,
    /// Every expected response arrived.
    Loaded,
    /// The session ended before seeds completed.
    Failed,
}
