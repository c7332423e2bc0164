//! Application Services
//!
//! Services that orchestrate the subscription pipeline across the ports.
//!
//! - `InstrumentPublisher`: Polls one instrument, caches and republishes it
//! - `PublisherRegistry`: Shares one publisher per instrument across subscriptions
//! - `SubscriptionCoordinator`: Replays history then streams live prices to one client

use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{FanoutChannel, HistoryStore, PriceSource};

mod coordinator;
mod error;
mod publisher;

pub use coordinator::{SubscriptionCoordinator, SubscriptionScope};
pub use error::SubscriptionError;
pub use publisher::{InstrumentPublisher, PublisherLease, PublisherRegistry};

/// Shared handles to the outbound ports.
#[derive(Clone)]
pub struct Backends {
    /// Upstream price provider.
    pub source: Arc<dyn PriceSource>,
    /// Shared history cache.
    pub store: Arc<dyn HistoryStore>,
    /// Per-instrument fanout broker.
    pub fanout: Arc<dyn FanoutChannel>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Tuning for the subscription pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Interval between upstream polls of one instrument.
    pub poll_interval: Duration,
    /// Capacity of each subscription's merge channel in front of the sink.
    pub delivery_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            delivery_buffer: 256,
        }
    }
}
