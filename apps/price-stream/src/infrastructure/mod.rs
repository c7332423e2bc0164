//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the service's outer surfaces.

/// In-process fanout channel.
pub mod broadcast;

/// Quote provider client.
pub mod coindesk;

/// Configuration loading.
pub mod config;

/// gRPC streaming server and client connection helper.
pub mod grpc;

/// Health check HTTP endpoint.
pub mod health;

/// In-memory history cache.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Redis history cache and pub/sub fanout.
pub mod redis;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
