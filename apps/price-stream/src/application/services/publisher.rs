//! Instrument Publishers
//!
//! An [`InstrumentPublisher`] polls one instrument on a fixed interval,
//! writes each observation to the history store and publishes it on the
//! instrument's fanout channel. The first failed poll stops the publisher
//! and marks it failed; subscriptions attached to it observe the failure
//! and shut down.
//!
//! The [`PublisherRegistry`] keeps at most one running publisher per
//! instrument. Subscriptions hold a [`PublisherLease`]; the poller stops
//! when the last lease is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Backends, SubscriptionError};
use crate::domain::observation::PriceObservation;
use crate::infrastructure::metrics;

// =============================================================================
// Instrument Publisher
// =============================================================================

/// Poll, cache and republish loop for one instrument.
pub struct InstrumentPublisher {
    instrument: String,
    backends: Backends,
    poll_interval: Duration,
    stop: CancellationToken,
    failed: CancellationToken,
    failure: Mutex<Option<SubscriptionError>>,
}

impl InstrumentPublisher {
    /// Create a publisher. Nothing runs until [`run`](Self::run) is awaited.
    #[must_use]
    pub fn new(instrument: impl Into<String>, backends: Backends, poll_interval: Duration) -> Self {
        Self {
            instrument: instrument.into(),
            backends,
            poll_interval,
            stop: CancellationToken::new(),
            failed: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    /// The instrument this publisher polls.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Fetch once, then write to history and publish.
    ///
    /// # Errors
    ///
    /// Returns the upstream, store or broker failure that interrupted the
    /// cycle.
    pub async fn poll_once(&self) -> Result<PriceObservation, SubscriptionError> {
        let started = Instant::now();
        let observation = self
            .backends
            .source
            .fetch(&self.instrument)
            .await
            .map_err(|e| {
                let err = SubscriptionError::upstream(&self.instrument, e);
                metrics::record_fetch_failure(&self.instrument, err.kind());
                err
            })?;
        metrics::record_fetch(&self.instrument, started.elapsed());

        self.backends.store.write(&observation).await?;
        self.backends.fanout.publish(&observation).await?;
        Ok(observation)
    }

    /// Run the poll loop until stopped or until a poll fails.
    ///
    /// The first tick fires immediately.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                () = self.stop.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(observation) => {
                    tracing::debug!(
                        instrument = %self.instrument,
                        timedate = %observation.timedate(),
                        price = observation.price(),
                        "Price published"
                    );
                }
                Err(err) => {
                    tracing::error!(instrument = %self.instrument, error = %err, "Poll failed");
                    self.fail(err);
                    break;
                }
            }
        }

        tracing::debug!(instrument = %self.instrument, "Poller stopped");
    }

    /// Ask the poll loop to stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether a poll has failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves with the failure once a poll has failed.
    pub async fn failed(&self) -> SubscriptionError {
        self.failed.cancelled().await;
        self.failure
            .lock()
            .clone()
            .unwrap_or_else(|| SubscriptionError::UpstreamUnavailable {
                instrument: self.instrument.clone(),
                message: "poller failed".to_string(),
            })
    }

    fn fail(&self, err: SubscriptionError) {
        self.failure.lock().get_or_insert(err);
        self.failed.cancel();
    }
}

impl std::fmt::Debug for InstrumentPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentPublisher")
            .field("instrument", &self.instrument)
            .field("poll_interval", &self.poll_interval)
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Publisher Registry
// =============================================================================

#[derive(Debug)]
struct Slot {
    publisher: Arc<InstrumentPublisher>,
    leases: usize,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// One shared publisher per instrument, reference-counted by leases.
#[derive(Debug)]
pub struct PublisherRegistry {
    backends: Backends,
    poll_interval: Duration,
    slots: Slots,
}

impl PublisherRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(backends: Backends, poll_interval: Duration) -> Self {
        Self {
            backends,
            poll_interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lease the publisher for `instrument`, starting its poller if none is
    /// running or the running one has failed.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn acquire(&self, instrument: &str) -> PublisherLease {
        let mut slots = self.slots.lock();

        let publisher = match slots.get_mut(instrument) {
            Some(slot) if !slot.publisher.is_failed() => {
                slot.leases += 1;
                Arc::clone(&slot.publisher)
            }
            _ => {
                let publisher = Arc::new(InstrumentPublisher::new(
                    instrument,
                    self.backends.clone(),
                    self.poll_interval,
                ));
                let stale = slots.insert(
                    instrument.to_string(),
                    Slot {
                        publisher: Arc::clone(&publisher),
                        leases: 1,
                    },
                );
                if let Some(stale) = stale {
                    stale.publisher.stop();
                }

                let runner = Arc::clone(&publisher);
                tokio::spawn(async move { runner.run().await });
                tracing::info!(
                    instrument,
                    interval_ms = self.poll_interval.as_millis(),
                    "Poller started"
                );
                publisher
            }
        };

        metrics::set_active_pollers(slots.len());
        PublisherLease {
            slots: Arc::clone(&self.slots),
            publisher,
        }
    }

    /// Number of instruments with a registered publisher.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of leases held on `instrument`'s publisher.
    #[must_use]
    pub fn lease_count(&self, instrument: &str) -> usize {
        self.slots.lock().get(instrument).map_or(0, |slot| slot.leases)
    }

    /// Stop every publisher and forget them.
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.drain() {
            slot.publisher.stop();
        }
        metrics::set_active_pollers(0);
    }
}

/// A subscription's claim on a shared publisher.
#[derive(Debug)]
pub struct PublisherLease {
    slots: Slots,
    publisher: Arc<InstrumentPublisher>,
}

impl PublisherLease {
    /// The leased publisher.
    #[must_use]
    pub fn publisher(&self) -> Arc<InstrumentPublisher> {
        Arc::clone(&self.publisher)
    }
}

impl Drop for PublisherLease {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let instrument = self.publisher.instrument();

        if let Some(slot) = slots.get_mut(instrument)
            && Arc::ptr_eq(&slot.publisher, &self.publisher)
        {
            slot.leases = slot.leases.saturating_sub(1);
            if slot.leases == 0 {
                slots.remove(instrument);
                self.publisher.stop();
                tracing::info!(instrument, "Poller released");
            }
        } else {
            self.publisher.stop();
        }

        metrics::set_active_pollers(slots.len());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use futures::StreamExt;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::{
        FanoutChannel, HistoryStore, MockPriceSource, PriceSourceError,
    };
    use crate::infrastructure::broadcast::BroadcastFanout;
    use crate::infrastructure::memory::InMemoryHistoryStore;

    const FAST: Duration = Duration::from_millis(10);

    fn backends(source: MockPriceSource) -> (Backends, Arc<InMemoryHistoryStore>, Arc<BroadcastFanout>) {
        let store = Arc::new(InMemoryHistoryStore::new());
        let fanout = Arc::new(BroadcastFanout::with_defaults());
        let backends = Backends {
            source: Arc::new(source),
            store: Arc::clone(&store) as Arc<dyn HistoryStore>,
            fanout: Arc::clone(&fanout) as Arc<dyn FanoutChannel>,
        };
        (backends, store, fanout)
    }

    fn steady_source(price: f64) -> MockPriceSource {
        let mut source = MockPriceSource::new();
        source
            .expect_fetch()
            .returning(move |instrument| Ok(PriceObservation::new(instrument, Utc::now(), price)));
        source
    }

    #[tokio::test]
    async fn poll_once_writes_history_then_publishes() {
        let (backends, store, fanout) = backends(steady_source(101.5));
        let mut live = fanout.subscribe("USD").await.unwrap();
        let publisher = InstrumentPublisher::new("USD", backends, FAST);

        let observation = publisher.poll_once().await.unwrap();

        let published = timeout(Duration::from_secs(1), live.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published, observation);

        let cached = store
            .query_range("USD", observation.timestamp(), observation.timestamp())
            .await
            .unwrap();
        assert_eq!(cached, vec![observation]);
    }

    #[tokio::test]
    async fn failed_fetch_marks_publisher_failed_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut source = MockPriceSource::new();
        source.expect_fetch().returning(move |instrument| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PriceSourceError::NotFound {
                instrument: instrument.to_string(),
            })
        });
        let (backends, _store, _fanout) = backends(source);
        let publisher = InstrumentPublisher::new("XYZ", backends, FAST);

        timeout(Duration::from_secs(1), publisher.run()).await.unwrap();

        assert!(publisher.is_failed());
        assert_eq!(
            publisher.failed().await,
            SubscriptionError::NotFound {
                instrument: "XYZ".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_ends_the_poll_loop() {
        let (backends, _store, _fanout) = backends(steady_source(1.0));
        let publisher = Arc::new(InstrumentPublisher::new("USD", backends, FAST));
        let runner = Arc::clone(&publisher);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(FAST * 3).await;
        publisher.stop();

        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(!publisher.is_failed());
    }

    #[tokio::test]
    async fn registry_shares_one_publisher_per_instrument() {
        let (backends, _store, _fanout) = backends(steady_source(1.0));
        let registry = PublisherRegistry::new(backends, FAST);

        let first = registry.acquire("USD");
        let second = registry.acquire("USD");
        let other = registry.acquire("EUR");

        assert!(Arc::ptr_eq(&first.publisher(), &second.publisher()));
        assert_eq!(registry.lease_count("USD"), 2);
        assert_eq!(registry.active_count(), 2);

        drop(first);
        assert_eq!(registry.lease_count("USD"), 1);

        let usd = second.publisher();
        drop(second);
        drop(other);
        assert_eq!(registry.active_count(), 0);
        assert!(usd.stop.is_cancelled());
    }

    #[tokio::test]
    async fn registry_replaces_failed_publisher() {
        let mut source = MockPriceSource::new();
        let mut attempts = 0;
        source.expect_fetch().returning(move |instrument| {
            attempts += 1;
            if attempts == 1 {
                Err(PriceSourceError::Unavailable {
                    message: "boom".to_string(),
                })
            } else {
                Ok(PriceObservation::new(instrument, Utc::now(), 1.0))
            }
        });
        let (backends, _store, _fanout) = backends(source);
        let registry = PublisherRegistry::new(backends, FAST);

        let failing = registry.acquire("USD");
        let err = timeout(Duration::from_secs(1), failing.publisher().failed())
            .await
            .unwrap();
        assert_eq!(err.kind(), "upstream_unavailable");

        let fresh = registry.acquire("USD");
        assert!(!Arc::ptr_eq(&failing.publisher(), &fresh.publisher()));
        assert_eq!(registry.lease_count("USD"), 1);

        drop(failing);
        assert_eq!(registry.lease_count("USD"), 1);
        drop(fresh);
        assert_eq!(registry.active_count(), 0);
    }
}
