//! Redis pub/sub fanout.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::application::ports::{BrokerError, FanoutChannel, ObservationStream};
use crate::domain::observation::{PriceObservation, parse_timestamp};

fn broker_error(err: &redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

/// JSON body of a fanout message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutMessage {
    /// RFC3339 observation time.
    pub timedate: String,
    /// Observed price.
    pub price: f64,
}

impl FanoutMessage {
    /// Encode an observation.
    #[must_use]
    pub fn from_observation(observation: &PriceObservation) -> Self {
        Self {
            timedate: observation.timedate(),
            price: observation.price(),
        }
    }

    /// Decode back into an observation of `instrument`.
    ///
    /// Returns `None` if `timedate` is not RFC3339.
    #[must_use]
    pub fn into_observation(self, instrument: &str) -> Option<PriceObservation> {
        let timestamp = parse_timestamp(&self.timedate).ok()?;
        Some(PriceObservation::new(instrument, timestamp, self.price))
    }
}

/// [`FanoutChannel`] over Redis pub/sub.
///
/// Publishing shares one managed connection. Every subscription opens its
/// own pub/sub connection, which closes when the returned stream is dropped.
#[derive(Clone)]
pub struct RedisFanout {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFanout")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisFanout {
    /// Connect to the broker at `url`; channels are named `<prefix><INSTRUMENT>`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| broker_error(&e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| broker_error(&e))?;
        let prefix = prefix.into();
        tracing::info!(prefix = %prefix, "Fanout broker connected");
        Ok(Self {
            client,
            conn,
            prefix,
        })
    }

    /// Channel name for `instrument`.
    #[must_use]
    pub fn channel(&self, instrument: &str) -> String {
        format!("{}{instrument}", self.prefix)
    }
}

#[async_trait]
impl FanoutChannel for RedisFanout {
    async fn publish(&self, observation: &PriceObservation) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&FanoutMessage::from_observation(observation))
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(self.channel(observation.instrument()), payload)
            .await
            .map_err(|e| broker_error(&e))?;
        tracing::trace!(instrument = observation.instrument(), receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, instrument: &str) -> Result<ObservationStream, BrokerError> {
        let channel = self.channel(instrument);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| broker_error(&e))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| broker_error(&e))?;
        tracing::debug!(channel = %channel, "Subscribed to fanout channel");

        let instrument = instrument.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let observation = decode(&instrument, &msg);
            std::future::ready(observation)
        });
        Ok(Box::pin(stream))
    }
}

fn decode(instrument: &str, msg: &redis::Msg) -> Option<PriceObservation> {
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(instrument, error = %e, "Unreadable fanout payload");
            return None;
        }
    };
    let observation = serde_json::from_str::<FanoutMessage>(&payload)
        .ok()
        .and_then(|message| message.into_observation(instrument));
    if observation.is_none() {
        tracing::warn!(instrument, payload = %payload, "Malformed fanout message");
    }
    observation
}
