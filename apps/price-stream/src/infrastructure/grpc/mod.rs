//! gRPC Streaming Server
//!
//! Implements the `PriceService` gRPC service and the client-side
//! connection helper used by the companion CLI.
//!
//! # Architecture
//!
//! Each `Subscribe` RPC:
//!
//! 1. Validates the request (`INVALID_ARGUMENT` before any message)
//! 2. Takes a subscription slot (`RESOURCE_EXHAUSTED` when none is free)
//! 3. Runs the subscription coordinator, which replays history and then
//!    streams live prices into the response
//! 4. Ends the stream with a status mapped from the first failure, or
//!    cleanly when the client disconnects or the server shuts down
//!
//! The message and service types under [`proto`] are checked-in output of
//! `prost`/`tonic` code generation for `proto/price/v1/price.proto`. The
//! `proto_contract` integration tests fail when the two drift apart.

pub mod client;
pub mod server;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod price {
        pub mod v1 {
            include!("proto/price.v1.rs");
        }
    }
}

pub use client::{ConnectError, ConnectPolicy, connect_with_retry};
pub use server::{GrpcSink, PriceStreamServer, PriceStreamServerConfig, observation_to_proto};
