//! Domain Layer - Core price streaming types.
//!
//! This layer contains the observation, cache key and subscription request
//! types with no dependency on any transport or store.

/// Price observations and history keys.
pub mod observation;

/// Subscription request validation.
pub mod subscription;
