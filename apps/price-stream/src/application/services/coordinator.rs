//! Subscription Coordinator
//!
//! Serves one subscription end to end. For each requested instrument, in
//! request order:
//!
//! 1. subscribe to the instrument's fanout channel,
//! 2. replay cached history from the requested start up to now,
//! 3. lease the instrument's shared poller and start forwarding live
//!    observations newer than the last replayed one.
//!
//! Every producer forwards into one bounded merge channel drained by a
//! single writer task that owns the sink. The first failure anywhere
//! cancels the whole subscription scope.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::publisher::{InstrumentPublisher, PublisherLease, PublisherRegistry};
use super::{Backends, PipelineConfig, SubscriptionError};
use crate::application::ports::{FanoutChannel, HistoryStore, ObservationStream, PriceSink};
use crate::domain::observation::PriceObservation;
use crate::domain::subscription::SubscriptionRequest;
use crate::infrastructure::metrics::{self, DeliveryPhase};

// =============================================================================
// Subscription Scope
// =============================================================================

/// Cancellation scope shared by every task of one subscription.
///
/// Holds the first error reported by any task.
#[derive(Debug, Clone)]
pub struct SubscriptionScope {
    token: CancellationToken,
    failure: Arc<Mutex<Option<SubscriptionError>>>,
}

impl SubscriptionScope {
    /// Create a scope driven by `token`.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Record `err` unless the scope already ended, then cancel.
    pub fn fail(&self, err: SubscriptionError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() && !self.token.is_cancelled() {
                *failure = Some(err);
            }
        }
        self.token.cancel();
    }

    /// End the scope without an error.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the scope has ended.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope has ended.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The first recorded error, if any.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the scope.
    pub fn outcome(&self) -> Result<(), SubscriptionError> {
        self.failure.lock().clone().map_or(Ok(()), Err)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug)]
struct Delivery {
    observation: PriceObservation,
    phase: DeliveryPhase,
}

/// Runs subscriptions against shared backends and pollers.
pub struct SubscriptionCoordinator {
    store: Arc<dyn HistoryStore>,
    fanout: Arc<dyn FanoutChannel>,
    registry: PublisherRegistry,
    delivery_buffer: usize,
    active: AtomicUsize,
}

impl std::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("registry", &self.registry)
            .field("delivery_buffer", &self.delivery_buffer)
            .field("active", &self.active_subscriptions())
            .finish_non_exhaustive()
    }
}

impl SubscriptionCoordinator {
    /// Create a coordinator with its own poller registry.
    #[must_use]
    pub fn new(backends: Backends, config: PipelineConfig) -> Self {
        Self {
            store: Arc::clone(&backends.store),
            fanout: Arc::clone(&backends.fanout),
            registry: PublisherRegistry::new(backends, config.poll_interval),
            delivery_buffer: config.delivery_buffer.max(1),
            active: AtomicUsize::new(0),
        }
    }

    /// The shared poller registry.
    #[must_use]
    pub const fn registry(&self) -> &PublisherRegistry {
        &self.registry
    }

    /// Number of subscriptions currently running.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop every poller. Running subscriptions keep their leases.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    /// Serve one subscription until the consumer leaves, `cancel` fires, or
    /// any part of the pipeline fails.
    ///
    /// Returns `Ok` when the subscription ended because the consumer went
    /// away or the caller cancelled it.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed by any task of the subscription.
    pub async fn run<S: PriceSink>(
        &self,
        request: SubscriptionRequest,
        sink: S,
        cancel: CancellationToken,
    ) -> Result<(), SubscriptionError> {
        let id = Uuid::new_v4();
        let scope = SubscriptionScope::new(cancel.child_token());
        let _active = ActiveGuard::enter(&self.active);

        tracing::info!(
            subscription_id = %id,
            instruments = ?request.instruments(),
            start_time = %request.start_time(),
            "Subscription started"
        );

        let (tx, rx) = mpsc::channel(self.delivery_buffer);
        let mut tasks = JoinSet::new();
        tasks.spawn(write_loop(sink, rx, scope.clone()));

        let mut leases = Vec::with_capacity(request.instruments().len());
        let started = tokio::select! {
            () = scope.cancelled() => Ok(()),
            started = self.start_instruments(&request, &tx, &scope, &mut tasks, &mut leases) => started,
        };
        if let Err(err) = started {
            scope.fail(err);
        }
        drop(tx);

        scope.cancelled().await;
        tasks.shutdown().await;
        drop(leases);

        let outcome = scope.outcome();
        match &outcome {
            Ok(()) => tracing::info!(subscription_id = %id, "Subscription closed"),
            Err(err) => tracing::warn!(
                subscription_id = %id,
                kind = err.kind(),
                error = %err,
                "Subscription failed"
            ),
        }
        outcome
    }

    async fn start_instruments(
        &self,
        request: &SubscriptionRequest,
        tx: &mpsc::Sender<Delivery>,
        scope: &SubscriptionScope,
        tasks: &mut JoinSet<()>,
        leases: &mut Vec<PublisherLease>,
    ) -> Result<(), SubscriptionError> {
        for instrument in request.instruments() {
            if scope.is_cancelled() {
                return Ok(());
            }

            // Subscribe before querying so nothing published during replay is lost.
            let live = self.fanout.subscribe(instrument).await?;

            let backlog = self
                .store
                .query_range(instrument, request.start_time(), Utc::now())
                .await?;
            tracing::debug!(instrument = %instrument, count = backlog.len(), "Replaying history");

            let mut boundary = None;
            for observation in backlog {
                let timestamp = observation.timestamp();
                let delivery = Delivery {
                    observation,
                    phase: DeliveryPhase::Replay,
                };
                if !forward(tx, scope, delivery).await {
                    return Ok(());
                }
                boundary = Some(timestamp);
            }

            let lease = self.registry.acquire(instrument);
            tasks.spawn(watch_publisher(lease.publisher(), scope.clone()));
            tasks.spawn(consume_live(
                instrument.clone(),
                live,
                boundary,
                tx.clone(),
                scope.clone(),
            ));
            leases.push(lease);
        }
        Ok(())
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Sole owner of the sink.
async fn write_loop<S: PriceSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Delivery>,
    scope: SubscriptionScope,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = scope.cancelled() => break,
            () = sink.closed() => {
                tracing::debug!("Consumer went away");
                scope.cancel();
                break;
            }
            next = rx.recv() => next,
        };
        let Some(Delivery { observation, phase }) = next else {
            break;
        };

        let delivered = tokio::select! {
            () = scope.cancelled() => break,
            delivered = sink.deliver(observation) => delivered,
        };
        match delivered {
            Ok(()) => metrics::record_delivered(phase),
            Err(err) => {
                scope.fail(err.into());
                break;
            }
        }
    }
}

/// Forward live observations newer than `boundary`.
async fn consume_live(
    instrument: String,
    mut live: ObservationStream,
    mut boundary: Option<DateTime<Utc>>,
    tx: mpsc::Sender<Delivery>,
    scope: SubscriptionScope,
) {
    loop {
        let next = tokio::select! {
            () = scope.cancelled() => return,
            next = live.next() => next,
        };
        let Some(observation) = next else {
            scope.fail(SubscriptionError::BrokerUnavailable(format!(
                "fanout stream for {instrument} ended"
            )));
            return;
        };

        if observation.instrument() != instrument {
            continue;
        }
        if boundary.is_some_and(|last| observation.timestamp() <= last) {
            metrics::record_duplicate_dropped();
            tracing::debug!(
                instrument = %instrument,
                timedate = %observation.timedate(),
                "Dropping live observation already delivered"
            );
            continue;
        }
        boundary = Some(observation.timestamp());

        let delivery = Delivery {
            observation,
            phase: DeliveryPhase::Live,
        };
        if !forward(&tx, &scope, delivery).await {
            return;
        }
    }
}

/// Propagate a poller failure into the subscription scope.
async fn watch_publisher(publisher: Arc<InstrumentPublisher>, scope: SubscriptionScope) {
    tokio::select! {
        () = scope.cancelled() => {}
        err = publisher.failed() => scope.fail(err),
    }
}

/// Queue a delivery for the writer. Returns `false` once the scope is over.
async fn forward(
    tx: &mpsc::Sender<Delivery>,
    scope: &SubscriptionScope,
    delivery: Delivery,
) -> bool {
    tokio::select! {
        () = scope.cancelled() => false,
        sent = tx.send(delivery) => {
            if sent.is_err() {
                scope.fail(SubscriptionError::DeliveryFailed);
                return false;
            }
            true
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        let count = active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_subscriptions(count);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_active_subscriptions(count);
    }
}

// =============================================================================
// Tests
// =============================================================================
