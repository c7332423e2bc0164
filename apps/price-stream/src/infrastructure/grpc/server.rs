//! gRPC Streaming Server Implementation
//!
//! Implements the `PriceService` gRPC service. Each `Subscribe` call is
//! validated, admitted against the subscription limit and then served by
//! the [`SubscriptionCoordinator`] on its own task, writing into the
//! response stream through a [`GrpcSink`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::proto::price::v1::price_service_server::PriceService;
use super::proto::price::v1::{SubscribeRequest, SubscribeResponse};
use crate::application::ports::{DeliveryError, PriceSink};
use crate::application::services::{SubscriptionCoordinator, SubscriptionError};
use crate::domain::observation::PriceObservation;
use crate::domain::subscription::SubscriptionRequest;

// =============================================================================
// Type Aliases
// =============================================================================

type StreamResult<T> = Result<Response<T>, Status>;
type BoxedStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
type ResponseSender = mpsc::Sender<Result<SubscribeResponse, Status>>;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the gRPC streaming server.
#[derive(Debug, Clone, Copy)]
pub struct PriceStreamServerConfig {
    /// Maximum concurrently open subscriptions.
    pub max_subscriptions: usize,
    /// Capacity of each response stream.
    pub delivery_buffer: usize,
}

impl Default for PriceStreamServerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 1024,
            delivery_buffer: 256,
        }
    }
}

// =============================================================================
// Status Mapping
// =============================================================================

impl From<SubscriptionError> for Status {
    fn from(err: SubscriptionError) -> Self {
        let message = err.to_string();
        match err {
            SubscriptionError::InvalidRequest(_) => Self::invalid_argument(message),
            SubscriptionError::NotFound { .. } => Self::not_found(message),
            SubscriptionError::UpstreamUnavailable { .. }
            | SubscriptionError::StoreUnavailable(_)
            | SubscriptionError::BrokerUnavailable(_) => Self::unavailable(message),
            SubscriptionError::DeliveryFailed => Self::cancelled(message),
        }
    }
}

/// Convert an observation to its wire form.
#[must_use]
pub fn observation_to_proto(observation: &PriceObservation) -> SubscribeResponse {
    SubscribeResponse {
        currency: observation.instrument().to_string(),
        timedate: observation.timedate(),
        price: observation.price(),
    }
}

// =============================================================================
// Sink
// =============================================================================

/// [`PriceSink`] writing into a server-streaming response.
#[derive(Debug)]
pub struct GrpcSink {
    tx: ResponseSender,
}

impl GrpcSink {
    /// Wrap the sending half of a response stream.
    #[must_use]
    pub const fn new(tx: ResponseSender) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl PriceSink for GrpcSink {
    async fn deliver(&mut self, observation: PriceObservation) -> Result<(), DeliveryError> {
        self.tx
            .send(Ok(observation_to_proto(&observation)))
            .await
            .map_err(|_| DeliveryError)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

// =============================================================================
// Server
// =============================================================================

/// gRPC streaming server for replay-then-live prices.
#[derive(Debug)]
pub struct PriceStreamServer {
    coordinator: Arc<SubscriptionCoordinator>,
    limiter: Arc<Semaphore>,
    config: PriceStreamServerConfig,
    shutdown: CancellationToken,
}

impl PriceStreamServer {
    /// Create a server. Cancelling `shutdown` ends every open subscription.
    #[must_use]
    pub fn new(
        coordinator: Arc<SubscriptionCoordinator>,
        config: PriceStreamServerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            limiter: Arc::new(Semaphore::new(config.max_subscriptions.max(1))),
            config,
            shutdown,
        }
    }

    /// Subscription slots currently free.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }
}

#[async_trait]
impl PriceService for PriceStreamServer {
    type SubscribeStream = BoxedStream<SubscribeResponse>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> StreamResult<Self::SubscribeStream> {
        let req = request.into_inner();
        let subscription = SubscriptionRequest::parse(&req.currencies, &req.start_time, Utc::now())
            .map_err(|e| Status::from(SubscriptionError::from(e)))?;

        let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
            tracing::warn!(
                max_subscriptions = self.config.max_subscriptions,
                "Subscription rejected, limit reached"
            );
            return Err(Status::resource_exhausted("too many active subscriptions"));
        };

        let (tx, rx) = mpsc::channel(self.config.delivery_buffer.max(1));
        let sink = GrpcSink::new(tx.clone());
        let coordinator = Arc::clone(&self.coordinator);
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = coordinator.run(subscription, sink, cancel).await {
                // The client may already be gone; nothing else to report to.
                let _ = tx.send(Err(Status::from(err))).await;
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }
}

// =============================================================================
// Tests
// =============================================================================
