//! Application Layer - Ports and services.
//!
//! The ports describe what the gateway core needs from the outside (a
//! wire codec, an upstream that can subscribe); the services build on
//! them without knowing which adapter sits behind.

/// Port interfaces for the codec and upstream subscriptions.
pub mod ports;

/// Subscription dedup and fan-out.
pub mod services;
