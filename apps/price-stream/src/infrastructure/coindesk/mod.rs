//! Coindesk price source adapter.
//!
//! Fetches the Bitcoin price index from a Coindesk-shaped endpoint:
//!
//! ```json
//! { "time": { "updatedISO": "..." }, "bpi": { "USD": { "rate_float": 46211.24 } } }
//! ```
//!
//! Only `rate_float` of the requested code is used. Observations are stamped
//! with the local fetch time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::application::ports::{PriceSource, PriceSourceError};
use crate::domain::observation::PriceObservation;

/// Default quote endpoint.
pub const DEFAULT_QUOTE_URL: &str = "https://api.coindesk.com/v1/bpi/currentprice.json";

/// Quote endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentPriceResponse {
    /// Provider timestamps.
    #[serde(default)]
    pub time: UpdateTime,
    /// Price index keyed by currency code.
    pub bpi: HashMap<String, BpiEntry>,
}

/// Provider update timestamps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTime {
    /// ISO-8601 time of the provider's last update.
    #[serde(rename = "updatedISO", default)]
    pub updated_iso: String,
}

/// One currency's entry in the price index.
#[derive(Debug, Clone, Deserialize)]
pub struct BpiEntry {
    /// Price as a float.
    pub rate_float: f64,
}

/// [`PriceSource`] backed by the Coindesk current price endpoint.
#[derive(Debug, Clone)]
pub struct CoindeskPriceSource {
    client: reqwest::Client,
    url: String,
}

impl CoindeskPriceSource {
    /// Create a source polling `url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `PriceSourceError::Unavailable` if the HTTP client cannot be
    /// built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PriceSourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PriceSourceError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn fetch_index(&self) -> Result<CurrentPriceResponse, PriceSourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PriceSourceError::Unavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PriceSourceError::Unavailable {
                message: format!("quote endpoint returned {status}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| PriceSourceError::Unavailable {
                message: format!("failed to decode quote response: {e}"),
            })
    }
}

#[async_trait]
impl PriceSource for CoindeskPriceSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceObservation, PriceSourceError> {
        let index = self.fetch_index().await?;
        let fetched_at = Utc::now();

        let entry = index
            .bpi
            .get(instrument)
            .ok_or_else(|| PriceSourceError::NotFound {
                instrument: instrument.to_string(),
            })?;

        tracing::debug!(
            instrument,
            price = entry.rate_float,
            updated = %index.time.updated_iso,
            "Quote fetched"
        );
        Ok(PriceObservation::new(instrument, fetched_at, entry.rate_float))
    }
}
