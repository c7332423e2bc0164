#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Price Stream - Historical Replay + Live Price Streaming
//!
//! A gRPC service that, for each subscription, first replays cached price
//! observations since a requested start time and then keeps streaming live
//! prices polled from an upstream quote provider.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core price types with no transport or store dependency
//!   - `observation`: Price observations and cache keys
//!   - `subscription`: Subscription request validation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Price source, history store, fanout channel and sink traits
//!   - `services`: Instrument publishers and the subscription coordinator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `coindesk`: HTTP quote provider client
//!   - `redis`: History cache and pub/sub fanout
//!   - `memory` / `broadcast`: In-process store and fanout
//!   - `grpc`: Streaming server and client connection helper
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                     ┌──────────────┐   write    ┌──────────────┐
//! Quote API ◄─ poll ──│  Instrument  │──────────► │ HistoryStore │
//!                     │  Publisher   │            └──────┬───────┘
//!                     └──────┬───────┘                   │ replay
//!                            │ publish                   ▼
//!                     ┌──────▼───────┐  live   ┌──────────────────┐
//!                     │   Fanout     │───────► │   Subscription   │──► Client
//!                     │   Channel    │         │   Coordinator    │
//!                     └──────────────┘         └──────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core price types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::observation::{HistoryKey, Instrument, PriceObservation};
pub use domain::subscription::{RequestError, SubscriptionRequest};

// Ports
pub use application::ports::{
    BrokerError, DeliveryError, FanoutChannel, HistoryStore, PriceSink, PriceSource,
    PriceSourceError, StoreError,
};

// Services
pub use application::services::{
    Backends, PipelineConfig, PublisherRegistry, SubscriptionCoordinator, SubscriptionError,
};

// Infrastructure config
pub use infrastructure::config::{Backend, ConfigError, StreamConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// In-process backends (for integration tests and self-contained runs)
pub use infrastructure::broadcast::BroadcastFanout;
pub use infrastructure::memory::InMemoryHistoryStore;

// gRPC server and client
pub use infrastructure::grpc::{
    ConnectPolicy, PriceStreamServer, PriceStreamServerConfig, connect_with_retry,
    proto::price::v1 as proto,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
