//! Domain Layer - Schema, records, correlation and subscription state.
//!
//! Everything here is synchronous and transport-agnostic. Connections and
//! the pool in the infrastructure layer own instances of these types.

/// Gateway error taxonomy.
pub mod error;

/// Schema descriptors and the registry.
pub mod schema;

/// Struct record boundary and the in-memory record.
pub mod record;

/// Record to object mapping.
pub mod mapping;

/// Sequence id correlation.
pub mod correlation;

/// Market revisions, security index, bootstrap snapshot.
pub mod universe;

/// Subscription dedup keys and table.
pub mod subscription;
