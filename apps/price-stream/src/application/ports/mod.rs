//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `PriceSource`: Fetches the current price of one instrument upstream
//! - `HistoryStore`: Time-indexed cache of past observations
//! - `FanoutChannel`: Per-instrument publish/subscribe channel
//!
//! ## Driver Ports (Inbound)
//!
//! - `PriceSink`: The consumer-facing output of one subscription

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::domain::observation::PriceObservation;

// =============================================================================
// Price Source
// =============================================================================

/// Upstream price lookup for a single instrument.
///
/// Implementations do not retry; retry policy belongs to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch the current price of `instrument`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the provider has no such instrument, `Unavailable` if
    /// the call or decode fails.
    async fn fetch(&self, instrument: &str) -> Result<PriceObservation, PriceSourceError>;
}

/// Price source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceSourceError {
    /// The provider response has no entry for the instrument.
    #[error("instrument not found upstream: {instrument}")]
    NotFound {
        /// The missing instrument.
        instrument: String,
    },
    /// The network call or response decode failed.
    #[error("price source unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },
}

// =============================================================================
// History Store
// =============================================================================

/// Time-indexed cache of price observations.
///
/// A single store instance is shared by every subscription; a completed
/// `write` is visible to every later `query_range`.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Store an observation under its history key and index it by time.
    ///
    /// Writing the same `(instrument, timestamp)` again overwrites the price.
    async fn write(&self, observation: &PriceObservation) -> Result<(), StoreError>;

    /// All observations of `instrument` with `from <= timestamp <= to`, in
    /// ascending timestamp order.
    ///
    /// Entries whose value can no longer be resolved are skipped.
    async fn query_range(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError>;
}

/// History store error.
///
/// Start times reach the store already parsed; a malformed one is rejected
/// as a [`RequestError`](crate::domain::subscription::RequestError).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Any store-level failure.
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Fanout Channel
// =============================================================================

/// Live observations for one subscriber, in publish order.
pub type ObservationStream = Pin<Box<dyn Stream<Item = PriceObservation> + Send>>;

/// Per-instrument publish/subscribe channel.
///
/// Every subscriber receives its own copy of each observation published
/// after it subscribed. Nothing is replayed; a subscriber that is not
/// listening misses what is published meanwhile.
#[async_trait]
pub trait FanoutChannel: Send + Sync {
    /// Publish an observation to the channel of its instrument.
    async fn publish(&self, observation: &PriceObservation) -> Result<(), BrokerError>;

    /// Start receiving observations of `instrument`.
    ///
    /// The stream ends only if the underlying broker connection is lost.
    async fn subscribe(&self, instrument: &str) -> Result<ObservationStream, BrokerError>;
}

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or rejected the operation.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Price Sink
// =============================================================================

/// Consumer-facing output of a subscription.
///
/// A sink is owned by exactly one writer task; it is never shared between
/// producers.
#[async_trait]
pub trait PriceSink: Send + Sync + 'static {
    /// Deliver one observation to the consumer.
    async fn deliver(&mut self, observation: PriceObservation) -> Result<(), DeliveryError>;

    /// Resolves once the consumer has gone away.
    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}

/// The consumer behind a [`PriceSink`] is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("consumer is no longer receiving")]
pub struct DeliveryError;
