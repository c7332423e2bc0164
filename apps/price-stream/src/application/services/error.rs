//! Subscription error taxonomy.

use crate::application::ports::{BrokerError, DeliveryError, PriceSourceError, StoreError};
use crate::domain::subscription::RequestError;

/// Why a subscription ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The request was malformed; nothing was delivered.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream price provider failed for an instrument.
    #[error("upstream unavailable for {instrument}: {message}")]
    UpstreamUnavailable {
        /// Instrument being polled.
        instrument: String,
        /// Error details.
        message: String,
    },

    /// The upstream price provider does not know the instrument.
    #[error("instrument not found upstream: {instrument}")]
    NotFound {
        /// The unknown instrument.
        instrument: String,
    },

    /// The history store failed.
    #[error("history store unavailable: {0}")]
    StoreUnavailable(String),

    /// The consumer-facing sink went away.
    #[error("delivery to the subscriber failed")]
    DeliveryFailed,

    /// The fanout broker failed.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

impl SubscriptionError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DeliveryFailed => "delivery_failed",
            Self::BrokerUnavailable(_) => "broker_unavailable",
        }
    }

    /// Attribute a price source failure to the instrument being polled.
    #[must_use]
    pub fn upstream(instrument: &str, err: PriceSourceError) -> Self {
        match err {
            PriceSourceError::NotFound { .. } => Self::NotFound {
                instrument: instrument.to_string(),
            },
            PriceSourceError::Unavailable { message } => Self::UpstreamUnavailable {
                instrument: instrument.to_string(),
                message,
            },
        }
    }
}

impl From<RequestError> for SubscriptionError {
    fn from(err: RequestError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<StoreError> for SubscriptionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
        }
    }
}

impl From<BrokerError> for SubscriptionError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(message) => Self::BrokerUnavailable(message),
        }
    }
}

impl From<DeliveryError> for SubscriptionError {
    fn from(_: DeliveryError) -> Self {
        Self::DeliveryFailed
    }
}
