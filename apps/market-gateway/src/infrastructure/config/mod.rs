//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, EventSettings, GatewayConfig, PoolSettings, ServerSettings,
    Token, UpstreamSettings,
};
