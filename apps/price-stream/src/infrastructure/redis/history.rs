//! Redis history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::application::ports::{HistoryStore, StoreError};
use crate::domain::observation::{HistoryKey, PriceObservation};
use crate::infrastructure::metrics;

/// Sorted set indexing every history key by its Unix timestamp.
pub const TIME_INDEX_KEY: &str = "times";

fn store_error(err: &redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// [`HistoryStore`] backed by Redis.
///
/// Each observation is stored twice: `SET <key> <price>` and
/// `ZADD times <unix seconds> <key>`, where `<key>` is the observation's
/// [`HistoryKey`].
#[derive(Clone)]
pub struct RedisHistoryStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHistoryStore").finish_non_exhaustive()
    }
}

impl RedisHistoryStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| store_error(&e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| store_error(&e))?;
        tracing::info!("History store connected");
        Ok(Self { conn })
    }

    /// Check the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if Redis does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn resolve(&self, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(member).await.map_err(|e| store_error(&e))?;
        Ok(raw.and_then(|value| value.parse().ok()))
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn write(&self, observation: &PriceObservation) -> Result<(), StoreError> {
        let key = observation.key();
        let score = observation.timestamp().timestamp();

        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .set(key.as_str(), observation.price())
            .ignore()
            .zadd(TIME_INDEX_KEY, key.as_str(), score)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn query_range(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(TIME_INDEX_KEY, from.timestamp(), to.timestamp())
            .await
            .map_err(|e| store_error(&e))?;

        let mut observations = Vec::new();
        let mut skipped = 0_u64;
        for member in members {
            let Ok(key) = HistoryKey::parse(&member) else {
                tracing::warn!(key = %member, "Malformed history key, skipping");
                skipped += 1;
                continue;
            };
            if !key.belongs_to(instrument) {
                continue;
            }

            match self.resolve(&member).await {
                Ok(Some(price)) => observations.extend(key.into_observation(price)),
                Ok(None) => {
                    tracing::warn!(key = %member, "History value missing, skipping");
                    skipped += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        key = %member,
                        error = %err,
                        "History value lookup failed, skipping"
                    );
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            metrics::record_replay_skipped(skipped);
        }
        Ok(observations)
    }
}
