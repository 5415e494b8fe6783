#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Gateway - Upstream Market Data Client Core
//!
//! Keeps bootstrapped binary WebSocket sessions to an upstream market-data
//! server, maps its schema-defined records into plain objects, and serves
//! fetch and streaming traffic through a connection pool and a
//! deduplicating subscription hub.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state
//!   - `schema`: Descriptors and revision resolution
//!   - `record` / `mapping`: Struct records and the object mapper
//!   - `correlation`: Sequence id bookkeeping
//!   - `universe`: Market revisions and the security index
//!   - `subscription`: Dedup keys and the subscriber table
//!
//! - **Application**: Ports and services
//!   - `ports`: Wire codec boundary, upstream subscription port
//!   - `services`: Subscription hub
//!
//! - **Infrastructure**: Adapters and process plumbing
//!   - `upstream`: Protocol connection and bootstrap state machine
//!   - `codec`: MessagePack reference codec
//!   - `pool`: Connection pool with a shared bootstrap snapshot
//!   - `broadcast`, `config`, `health`, `metrics`, `telemetry`
//!
//! # Bootstrap
//!
//! ```text
//! connect ─► handshake ─► schema ─► universe revision ─► universe seeds ─► ready
//!                           │              │                    │
//!                      codec context   market map        security index
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Schema, mapping, correlation and subscription state.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::error::{ErrorCode, GatewayError};
pub use domain::mapping::{MappedObject, PlainObject, StructValueMapper};
pub use domain::schema::{FieldType, MetaDescriptor, SchemaRegistry};
pub use domain::subscription::{
    DedupKey, SubscribeOptions, SubscriberId, SubscriptionId, SubscriptionStats,
};
pub use domain::universe::{BootstrapSnapshot, MarketRevisionEntry, SecurityIndex};

// Services
pub use application::services::{CallbackError, SubscriberCallback, SubscriptionHub};

// Upstream connection and pool
pub use infrastructure::pool::{ConnectionPool, PoolStats, PooledConnection};
pub use infrastructure::upstream::{
    ConnectionState, FetchOptions, FetchResult, ProtocolConnection,
};

// Reference codec
pub use infrastructure::codec::MsgPackCodec;

// Event stream
pub use infrastructure::broadcast::{DataEvent, EventHub, LifecycleEvent, SharedEventHub};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, ConnectionSettings, GatewayConfig, PoolSettings, Token,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
