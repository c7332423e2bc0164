//! In-Memory History Store
//!
//! Process-local [`HistoryStore`] with the same layout as the Redis store:
//! a key/value map from history key to price, and a time index ordered by
//! `(unix seconds, key)`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{HistoryStore, StoreError};
use crate::domain::observation::{HistoryKey, PriceObservation};
use crate::infrastructure::metrics;

#[derive(Debug, Default)]
struct Tables {
    values: HashMap<String, f64>,
    index: BTreeSet<(i64, String)>,
}

/// History store backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().index.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn evict_value(&self, observation: &PriceObservation) {
        self.tables.write().values.remove(observation.key().as_str());
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn write(&self, observation: &PriceObservation) -> Result<(), StoreError> {
        let key = observation.key();
        let score = observation.timestamp().timestamp();

        let mut tables = self.tables.write();
        tables.values.insert(key.as_str().to_string(), observation.price());
        tables.index.insert((score, key.as_str().to_string()));
        Ok(())
    }

    async fn query_range(
        &self,
        instrument: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        let (min, max) = (from.timestamp(), to.timestamp());
        if min > max {
            return Ok(Vec::new());
        }

        let tables = self.tables.read();
        let mut skipped = 0_u64;
        let observations = tables
            .index
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .filter_map(|(_, member)| {
                let key = HistoryKey::parse(member).ok()?;
                if !key.belongs_to(instrument) {
                    return None;
                }
                let Some(price) = tables.values.get(member) else {
                    skipped += 1;
                    tracing::warn!(key = %member, "History value missing, skipping");
                    return None;
                };
                key.into_observation(*price)
            })
            .collect();

        if skipped > 0 {
            metrics::record_replay_skipped(skipped);
        }
        Ok(observations)
    }
}

// =============================================================================
// Tests
// =============================================================================
