//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the subscription pipeline and the port interfaces
//! that define how it reaches the price source, cache, broker and client.

/// Port interfaces for external systems (price source, cache, broker, sink).
pub mod ports;

/// Instrument publishers and the subscription coordinator.
pub mod services;
