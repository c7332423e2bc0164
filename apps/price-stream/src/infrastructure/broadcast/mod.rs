//! Broadcast Channel Fanout
//!
//! In-process [`FanoutChannel`] built on tokio broadcast channels, one per
//! instrument. A channel is created by the first subscriber and removed
//! when its last subscriber's stream is dropped.
//!
//! Each receiver gets its own copy of every observation sent after it
//! subscribed. A receiver that falls more than `capacity` messages behind
//! skips the oldest ones and logs how many were lost.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::application::ports::{BrokerError, FanoutChannel, ObservationStream};
use crate::domain::observation::PriceObservation;

/// Default per-instrument channel capacity.
pub const DEFAULT_CAPACITY: usize = 1_024;

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<PriceObservation>>>>;

/// Per-instrument broadcast channels.
#[derive(Debug)]
pub struct BroadcastFanout {
    capacity: usize,
    channels: Channels,
}

impl BroadcastFanout {
    /// Create a fanout whose channels hold `capacity` messages each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a fanout with [`DEFAULT_CAPACITY`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Number of live receivers on `instrument`'s channel.
    #[must_use]
    pub fn receiver_count(&self, instrument: &str) -> usize {
        self.channels
            .lock()
            .get(instrument)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of instruments that currently have a channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for BroadcastFanout {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl FanoutChannel for BroadcastFanout {
    async fn publish(&self, observation: &PriceObservation) -> Result<(), BrokerError> {
        let sender = self.channels.lock().get(observation.instrument()).cloned();
        // No channel or no receivers is not an error; the observation is simply not seen.
        if let Some(sender) = sender {
            let _ = sender.send(observation.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, instrument: &str) -> Result<ObservationStream, BrokerError> {
        // Subscribe under the lock so a concurrent release never removes the
        // channel between lookup and subscribe.
        let rx = self
            .channels
            .lock()
            .entry(instrument.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = instrument.to_string();
        let inner = BroadcastStream::new(rx).filter_map(move |item| {
            let observation = match item {
                Ok(observation) => Some(observation),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(instrument = %name, skipped, "Fanout receiver lagged");
                    None
                }
            };
            std::future::ready(observation)
        });

        Ok(Box::pin(ChannelStream {
            inner: Box::pin(inner),
            _release: ChannelRelease {
                channels: Arc::clone(&self.channels),
                instrument: instrument.to_string(),
            },
        }))
    }
}

/// Subscriber stream that releases its channel once dropped.
///
/// `inner` is declared first so the receiver is gone before `_release` runs.
struct ChannelStream {
    inner: ObservationStream,
    _release: ChannelRelease,
}

impl Stream for ChannelStream {
    type Item = PriceObservation;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct ChannelRelease {
    channels: Channels,
    instrument: String,
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        let mut channels = self.channels.lock();
        if channels
            .get(&self.instrument)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&self.instrument);
            tracing::debug!(instrument = %self.instrument, "Fanout channel released");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
