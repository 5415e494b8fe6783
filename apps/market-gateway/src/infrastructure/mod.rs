//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations behind the application ports, plus the
//! process plumbing around them.

/// Event fan-out over broadcast channels.
pub mod broadcast;

/// MessagePack reference implementation of the wire codec.
pub mod codec;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Pool of bootstrapped upstream connections.
pub mod pool;

/// Logging and OpenTelemetry setup.
pub mod telemetry;

/// Upstream protocol connection.
pub mod upstream;
