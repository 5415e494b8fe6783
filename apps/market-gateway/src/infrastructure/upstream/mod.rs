//! Upstream Connections
//!
//! Binary WebSocket sessions to the market-data server.
//!
//! # Bootstrap
//!
//! ```text
//! Idle → Connecting → AwaitingSchema → AwaitingUniverseRevision
//!      → AwaitingUniverseSeeds(n) → Ready
//! ```
//!
//! Fetches and subscriptions are accepted from `AwaitingUniverseSeeds`
//! on. A failure before that point ends in `Failed`; afterwards in
//! `Closed`.

mod connection;
pub mod keepalive;
mod pending;
mod session;
mod shared;
mod state;

pub use connection::{FetchOptions, ProtocolConnection};
pub use pending::FetchResult;
pub use state::{ConnectionState, SeedStatus};

/// Identifies one connection within the process.
pub type ConnectionId = u64;
